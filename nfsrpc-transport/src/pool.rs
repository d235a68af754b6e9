//! Bounded connection pooling per endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rand::Rng;
use tokio::runtime::Handle;

use nfsrpc_core::{Endpoint, NetworkError, RpcError, TransportConfig};

use crate::connection::{Connection, ConnectionObserver};

/// Configuration for connection pooling.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Maximum connections per endpoint.
    pub max_connections_per_endpoint: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: 4,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum connections per endpoint (at least one).
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections_per_endpoint = max.max(1);
        self
    }
}

struct Slot {
    connection: RwLock<Option<Arc<Connection>>>,
    // Serializes creation so one slot never opens two sockets
    init: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            connection: RwLock::new(None),
            init: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }
}

struct PoolInner {
    endpoint: Endpoint,
    privileged: bool,
    transport: Arc<TransportConfig>,
    io: Handle,
    slots: Box<[Slot]>,
    closed: AtomicBool,
}

impl PoolInner {
    fn drop_connection(&self, connection: &Connection) {
        let removed = self.slots.get(connection.id()).and_then(|slot| {
            let mut current = slot.connection.write();
            let same = current
                .as_ref()
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection));
            if same { current.take() } else { None }
        });

        connection.close();
        let failed = connection.notify_all_pending("connection dropped from pool");

        if removed.is_some() {
            tracing::debug!(
                endpoint = %self.endpoint,
                connection = connection.id(),
                failed,
                "dropped connection from pool"
            );
        }
    }

    fn pool_closed(&self) -> RpcError {
        NetworkError::PoolClosed {
            endpoint: self.endpoint.to_string(),
        }
        .into()
    }
}

/// Removes a connection from its pool once it goes inactive.
struct PoolLifecycle {
    pool: Weak<PoolInner>,
}

impl ConnectionObserver for PoolLifecycle {
    fn on_inactive(&self, connection: &Connection) {
        if let Some(pool) = self.pool.upgrade() {
            pool.drop_connection(connection);
        }
    }

    fn on_error(&self, connection: &Connection, error: &NetworkError) {
        tracing::debug!(
            endpoint = %connection.endpoint(),
            connection = connection.id(),
            error = %error,
            "pooled connection failed"
        );
    }
}

/// Fixed-size set of multiplexed connections to one endpoint.
///
/// Each call picks a slot uniformly at random and reuses the connection in
/// it, opening one on first use. A connection that goes inactive vacates
/// its slot; the next call that lands there opens a replacement.
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use nfsrpc_core::{Endpoint, TransportConfig};
/// use nfsrpc_transport::{ConnectionPool, PoolConfig};
///
/// # async fn run() -> Result<(), nfsrpc_core::RpcError> {
/// let pool = ConnectionPool::new(
///     Endpoint::new("nfs.example", 2049),
///     false,
///     PoolConfig::default().max_connections(8),
///     Arc::new(TransportConfig::default()),
///     tokio::runtime::Handle::current(),
/// );
/// let connection = pool.get_connection().await?;
/// assert!(connection.is_connected());
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened lazily on `io`.
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        privileged: bool,
        config: PoolConfig,
        transport: Arc<TransportConfig>,
        io: Handle,
    ) -> Self {
        let slots = (0..config.max_connections_per_endpoint.max(1))
            .map(|_| Slot::new())
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                privileged,
                transport,
                io,
                slots,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Remote endpoint served by this pool.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Whether connections in this pool request a privileged port.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.inner.privileged
    }

    /// Check whether two handles refer to the same pool.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Get a connection from a random slot, opening one if the slot is empty.
    ///
    /// A connection that fails to open is not stored. The returned
    /// connection is not re-checked for liveness; a dead one fails the send
    /// and vacates its slot.
    pub async fn get_connection(&self) -> Result<Arc<Connection>, RpcError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(inner.pool_closed());
        }

        let index = rand::thread_rng().gen_range(0..inner.slots.len());
        let slot = &inner.slots[index];
        if let Some(connection) = slot.current() {
            return Ok(connection);
        }

        let _guard = slot.init.lock().await;
        if let Some(connection) = slot.current() {
            return Ok(connection);
        }
        if inner.closed.load(Ordering::Acquire) {
            return Err(inner.pool_closed());
        }

        let connection = Arc::new(Connection::new(
            index,
            inner.endpoint.clone(),
            inner.privileged,
            inner.transport.clone(),
            inner.io.clone(),
        ));
        connection.add_observer(Arc::new(PoolLifecycle {
            pool: Arc::downgrade(inner),
        }));
        connection.connect().await?;

        *slot.connection.write() = Some(connection.clone());

        // Lost a race with the reader, or with close()
        if connection.is_closed() || inner.closed.load(Ordering::Acquire) {
            inner.drop_connection(&connection);
            return Err(NetworkError::Broken {
                endpoint: inner.endpoint.to_string(),
            }
            .into());
        }

        tracing::debug!(
            endpoint = %inner.endpoint,
            slot = index,
            privileged = inner.privileged,
            "opened pooled connection"
        );
        Ok(connection)
    }

    /// Remove `connection` from its slot, close it, and fail its pending
    /// requests. The slot is left alone if it already holds a different
    /// connection.
    pub fn drop_connection(&self, connection: &Connection) {
        self.inner.drop_connection(connection);
    }

    /// Close every connection and refuse further use.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in self.inner.slots.iter() {
            let taken = slot.connection.write().take();
            if let Some(connection) = taken {
                connection.close();
            }
        }
        tracing::debug!(endpoint = %self.inner.endpoint, "closed connection pool");
    }

    /// Check if the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get statistics for this pool.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let live_connections = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.connection.read().is_some())
            .count();
        PoolStats {
            live_connections,
            max_connections: self.inner.slots.len(),
        }
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("privileged", &self.inner.privileged)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of slots holding a connection.
    pub live_connections: usize,
    /// Maximum connections allowed.
    pub max_connections: usize,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::test_support::{FakeServer, Reply, request, unused_endpoint, wait_until};

    const LONG: Duration = Duration::from_secs(30);

    fn pool_for(endpoint: Endpoint, max: usize) -> ConnectionPool {
        ConnectionPool::new(
            endpoint,
            false,
            PoolConfig::new().max_connections(max),
            Arc::default(),
            Handle::current(),
        )
    }

    #[test]
    fn test_config_clamps_to_one() {
        assert_eq!(PoolConfig::new().max_connections(0).max_connections_per_endpoint, 1);
        assert_eq!(PoolConfig::default().max_connections_per_endpoint, 4);
    }

    #[tokio::test]
    async fn test_pool_reuse() {
        let server = FakeServer::echo().await;
        let pool = pool_for(server.endpoint(), 1);

        let first = pool.get_connection().await.unwrap();
        let second = pool.get_connection().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        let server = FakeServer::echo().await;
        let pool = pool_for(server.endpoint(), 3);

        let mut seen: Vec<Arc<Connection>> = Vec::new();
        for _ in 0..64 {
            let connection = pool.get_connection().await.unwrap();
            if !seen.iter().any(|c| Arc::ptr_eq(c, &connection)) {
                seen.push(connection);
            }
        }

        assert!(seen.len() <= 3);
        assert!(pool.stats().live_connections <= 3);
        assert_eq!(pool.stats().max_connections, 3);
        wait_until(|| server.accepted() == seen.len()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_opens_once() {
        let server = FakeServer::echo().await;
        let pool = pool_for(server.endpoint(), 1);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_connection().await.unwrap() })
            })
            .collect();

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap());
        }
        assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
        wait_until(|| server.accepted() >= 1).await;
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_not_stored() {
        let pool = pool_for(unused_endpoint().await, 2);

        assert!(pool.get_connection().await.is_err());
        assert_eq!(pool.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn test_inactive_connection_is_replaced() {
        let server = FakeServer::start(|xid| {
            if xid == 1 {
                Reply::Close
            } else {
                Reply::Echo
            }
        })
        .await;
        let pool = pool_for(server.endpoint(), 1);

        let first = pool.get_connection().await.unwrap();
        assert!(first.send_and_wait(LONG, &request(1)).await.is_err());
        wait_until(|| pool.stats().live_connections == 0).await;

        let second = pool.get_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.send_and_wait(LONG, &request(2)).await.unwrap().xid(), 2);
        assert_eq!(server.accepted(), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_fails_pending() {
        let server = FakeServer::start(|_| Reply::Ignore).await;
        let pool = pool_for(server.endpoint(), 1);
        let connection = pool.get_connection().await.unwrap();

        let (tx, rx) = oneshot::channel();
        connection
            .send_with_callback(&request(1), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        pool.drop_connection(&connection);
        assert!(connection.is_closed());
        assert_eq!(pool.stats().live_connections, 0);
        assert!(matches!(
            rx.await.unwrap(),
            Err(RpcError::Network(NetworkError::Dropped { .. }))
        ));
    }

    #[tokio::test]
    async fn test_drop_keeps_replacement() {
        let server = FakeServer::echo().await;
        let pool = pool_for(server.endpoint(), 1);

        let first = pool.get_connection().await.unwrap();
        pool.drop_connection(&first);
        let second = pool.get_connection().await.unwrap();

        // A stale drop must not evict the newer connection
        pool.drop_connection(&first);
        assert_eq!(pool.stats().live_connections, 1);
        assert!(Arc::ptr_eq(&second, &pool.get_connection().await.unwrap()));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let server = FakeServer::echo().await;
        let pool = pool_for(server.endpoint(), 2);
        let connection = pool.get_connection().await.unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert!(connection.is_closed());
        assert_eq!(pool.stats().live_connections, 0);

        let err = pool.get_connection().await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Network(NetworkError::PoolClosed { .. })
        ));
        assert!(!err.is_retryable());
    }
}
