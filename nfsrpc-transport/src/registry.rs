//! Endpoint routing and the shared I/O runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};

use nfsrpc_core::{Endpoint, NetworkError, RpcError, RpcReply, RpcRequest, TransportConfig};

use crate::metric::CallMetric;
use crate::mux::{self, ReplyResult};
use crate::pool::{ConnectionPool, PoolConfig};

/// Configuration for a [`ConnectionRegistry`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryConfig {
    /// Worker threads of the owned I/O runtime.
    pub io_threads: usize,

    /// Timeout used by [`ConnectionRegistry::call`].
    pub call_timeout: Duration,

    /// How long [`ConnectionRegistry::shutdown`] waits for I/O tasks.
    pub shutdown_timeout: Duration,

    /// Socket-level settings for every connection.
    pub transport: TransportConfig,

    /// Per-endpoint pool settings.
    pub pool: PoolConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            io_threads: num_cpus::get() * 2,
            call_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            transport: TransportConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of I/O worker threads.
    #[must_use]
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the transport configuration.
    #[must_use]
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Routes requests to per-endpoint connection pools.
///
/// Privileged and non-privileged connections to one endpoint are pooled
/// separately. Pools are created on first use, exactly once per endpoint.
/// The registry owns the I/O runtime every socket runs on, unless it was
/// built around an existing one with [`ConnectionRegistry::with_handle`].
///
/// ## Example
///
/// ```rust,no_run
/// use nfsrpc_core::{Endpoint, RpcRequest};
/// use nfsrpc_transport::{ConnectionRegistry, RegistryConfig};
/// use std::time::Duration;
///
/// let registry = ConnectionRegistry::new(RegistryConfig::default())?;
/// let endpoint = Endpoint::new("nfs.example", 2049);
///
/// let request = RpcRequest::from_encoded(vec![0, 0, 0, 1 /* ... */])?;
/// let reply = registry.send_and_wait_blocking(&endpoint, false, &request, Duration::from_secs(5))?;
/// println!("reply of {} bytes", reply.payload().len());
///
/// registry.shutdown();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ConnectionRegistry {
    config: RegistryConfig,
    transport: Arc<TransportConfig>,
    pools: DashMap<Endpoint, ConnectionPool>,
    privileged_pools: DashMap<Endpoint, ConnectionPool>,
    io: Handle,
    runtime: Mutex<Option<Runtime>>,
    metric: Arc<CallMetric>,
    shut_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a registry with its own multi-thread I/O runtime.
    pub fn new(config: RegistryConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("nfsrpc-io")
            .enable_all()
            .build()?;
        let io = runtime.handle().clone();
        Ok(Self::build(config, io, Some(runtime)))
    }

    /// Create a registry whose sockets run on an existing runtime.
    ///
    /// `io_threads` is ignored; shutting the registry down closes its pools
    /// but leaves the runtime running.
    #[must_use]
    pub fn with_handle(config: RegistryConfig, io: Handle) -> Self {
        Self::build(config, io, None)
    }

    fn build(config: RegistryConfig, io: Handle, runtime: Option<Runtime>) -> Self {
        Self {
            transport: Arc::new(config.transport.clone()),
            config,
            pools: DashMap::new(),
            privileged_pools: DashMap::new(),
            io,
            runtime: Mutex::new(runtime),
            metric: Arc::new(CallMetric::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Handle to the I/O runtime.
    #[must_use]
    pub fn io_handle(&self) -> &Handle {
        &self.io
    }

    /// Latency of completed calls.
    #[must_use]
    pub fn call_metric(&self) -> &CallMetric {
        &self.metric
    }

    /// Number of pools currently registered, both privilege classes.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len() + self.privileged_pools.len()
    }

    /// Check if the registry has been shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Get the pool for `endpoint`, creating it on first use.
    pub fn pool(&self, endpoint: &Endpoint, privileged: bool) -> Result<ConnectionPool, RpcError> {
        if self.is_shut_down() {
            return Err(self.closed(endpoint));
        }

        let pools = if privileged {
            &self.privileged_pools
        } else {
            &self.pools
        };
        if let Some(pool) = pools.get(endpoint) {
            return Ok(pool.clone());
        }

        let pool = pools
            .entry(endpoint.clone())
            .or_insert_with(|| {
                tracing::debug!(endpoint = %endpoint, privileged, "creating connection pool");
                ConnectionPool::new(
                    endpoint.clone(),
                    privileged,
                    self.config.pool.clone(),
                    self.transport.clone(),
                    self.io.clone(),
                )
            })
            .clone();

        // Raced with shutdown after the first check
        if self.is_shut_down() {
            pool.close();
            return Err(self.closed(endpoint));
        }
        Ok(pool)
    }

    /// Send a request and wait for its reply.
    pub async fn send_and_wait(
        &self,
        endpoint: &Endpoint,
        privileged: bool,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<RpcReply, RpcError> {
        let pool = self.pool(endpoint, privileged)?;
        let connection = pool.get_connection().await?;

        let started = Instant::now();
        let reply = connection.send_and_wait(timeout, request).await?;
        self.metric.add(started.elapsed());
        Ok(reply)
    }

    /// [`send_and_wait`](Self::send_and_wait) with the configured call timeout.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        privileged: bool,
        request: &RpcRequest,
    ) -> Result<RpcReply, RpcError> {
        self.send_and_wait(endpoint, privileged, request, self.config.call_timeout)
            .await
    }

    /// Send a request and block the calling thread until it resolves.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// [`send_and_wait`](Self::send_and_wait) there instead.
    pub fn send_and_wait_blocking(
        &self,
        endpoint: &Endpoint,
        privileged: bool,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<RpcReply, RpcError> {
        if self.is_shut_down() {
            return Err(self.closed(endpoint));
        }
        self.io
            .block_on(self.send_and_wait(endpoint, privileged, request, timeout))
    }

    /// Send a request without waiting; `callback` receives the outcome.
    ///
    /// Never blocks the caller. Connection setup runs on the I/O runtime,
    /// and the callback runs exactly once, possibly on an I/O thread.
    pub fn send_with_callback<F>(
        &self,
        endpoint: &Endpoint,
        privileged: bool,
        request: RpcRequest,
        callback: F,
    ) where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        let xid = request.xid();
        let pool = match self.pool(endpoint, privileged) {
            Ok(pool) => pool,
            Err(e) => return mux::deliver(xid, callback, Err(e)),
        };

        let metric = self.metric.clone();
        self.io.spawn(async move {
            let connection = match pool.get_connection().await {
                Ok(connection) => connection,
                Err(e) => return mux::deliver(xid, callback, Err(e)),
            };

            let started = Instant::now();
            // Admission failures are delivered to the callback as well
            let _ = connection.send_with_callback(&request, move |result| {
                if result.is_ok() {
                    metric.add(started.elapsed());
                }
                callback(result);
            });
        });
    }

    /// Remove both pools for `endpoint` and close their connections.
    pub fn drop_connection(&self, endpoint: &Endpoint) {
        let removed = [
            self.pools.remove(endpoint),
            self.privileged_pools.remove(endpoint),
        ];
        for (_, pool) in removed.into_iter().flatten() {
            tracing::debug!(endpoint = %endpoint, privileged = pool.is_privileged(), "dropping connection pool");
            pool.close();
        }
    }

    /// Close every pool and stop the owned I/O runtime. Idempotent.
    ///
    /// Later sends fail with [`NetworkError::PoolClosed`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut closed = 0;
        for pools in [&self.pools, &self.privileged_pools] {
            pools.retain(|_, pool| {
                pool.close();
                closed += 1;
                false
            });
        }
        tracing::debug!(pools = closed, "connection registry shut down");

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            // Blocking on the runtime is not allowed from async code
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.config.shutdown_timeout);
            }
        }
    }

    fn closed(&self, endpoint: &Endpoint) -> RpcError {
        NetworkError::PoolClosed {
            endpoint: endpoint.to_string(),
        }
        .into()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("pools", &self.pools.len())
            .field("privileged_pools", &self.privileged_pools.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Helper function to check CPU count.
mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::test_support::{FakeServer, Reply, request, unused_endpoint};

    const LONG: Duration = Duration::from_secs(30);

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::with_handle(RegistryConfig::default(), Handle::current())
    }

    #[test]
    fn test_config_defaults() {
        let config = RegistryConfig::default();
        assert!(config.io_threads >= 2);
        assert_eq!(config.pool.max_connections_per_endpoint, 4);
        assert_eq!(RegistryConfig::new().io_threads(0).io_threads, 1);
    }

    #[tokio::test]
    async fn test_pool_shared_per_endpoint() {
        let registry = registry();
        let a = Endpoint::new("127.0.0.1", 2049);
        let b = Endpoint::new("127.0.0.1", 2050);

        let first = registry.pool(&a, false).unwrap();
        let again = registry.pool(&a, false).unwrap();
        let privileged = registry.pool(&a, true).unwrap();
        let other = registry.pool(&b, false).unwrap();

        assert!(ConnectionPool::ptr_eq(&first, &again));
        assert!(!ConnectionPool::ptr_eq(&first, &privileged));
        assert!(!ConnectionPool::ptr_eq(&first, &other));
        assert!(privileged.is_privileged());
        assert_eq!(registry.pool_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pool_creation() {
        let registry = Arc::new(registry());
        let endpoint = Endpoint::new("10.0.0.1", 2049);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move { registry.pool(&endpoint, false).unwrap() })
            })
            .collect();

        let mut pools = Vec::new();
        for task in tasks {
            pools.push(task.await.unwrap());
        }
        assert!(pools.iter().all(|p| ConnectionPool::ptr_eq(p, &pools[0])));
        assert_eq!(registry.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_send_and_wait_records_latency() {
        let server = FakeServer::echo().await;
        let registry = registry();

        let reply = registry
            .send_and_wait(&server.endpoint(), false, &request(21), LONG)
            .await
            .unwrap();
        assert_eq!(reply.xid(), 21);

        let reply = registry.call(&server.endpoint(), false, &request(22)).await.unwrap();
        assert_eq!(reply.xid(), 22);

        assert_eq!(registry.call_metric().calls(), 2);
        assert!(registry.call_metric().get_and_reset().is_some());
        assert_eq!(registry.call_metric().get_and_reset(), None);
    }

    #[tokio::test]
    async fn test_failed_call_not_recorded() {
        let registry = registry();
        let endpoint = unused_endpoint().await;

        let err = registry
            .send_and_wait(&endpoint, false, &request(1), LONG)
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(registry.call_metric().calls(), 0);
    }

    #[tokio::test]
    async fn test_send_with_callback() {
        let server = FakeServer::echo().await;
        let registry = registry();

        let (tx, rx) = oneshot::channel();
        registry.send_with_callback(&server.endpoint(), false, request(31), move |result| {
            let _ = tx.send(result);
        });

        assert_eq!(rx.await.unwrap().unwrap().xid(), 31);
        assert_eq!(registry.call_metric().calls(), 1);
    }

    #[tokio::test]
    async fn test_callback_receives_connect_failure() {
        let registry = registry();
        let endpoint = unused_endpoint().await;

        let (tx, rx) = oneshot::channel();
        registry.send_with_callback(&endpoint, false, request(1), move |result| {
            let _ = tx.send(result);
        });

        assert!(rx.await.unwrap().unwrap_err().is_connection_error());
    }

    #[tokio::test]
    async fn test_drop_connection_removes_both_pools() {
        let server = FakeServer::start(|_| Reply::Ignore).await;
        let registry = registry();
        let endpoint = server.endpoint();

        let pool = registry.pool(&endpoint, false).unwrap();
        let connection = pool.get_connection().await.unwrap();
        registry.pool(&endpoint, true).unwrap();
        assert_eq!(registry.pool_count(), 2);

        registry.drop_connection(&endpoint);
        assert_eq!(registry.pool_count(), 0);
        assert!(pool.is_closed());
        assert!(connection.is_closed());

        // The next send builds a fresh pool
        let fresh = registry.pool(&endpoint, false).unwrap();
        assert!(!ConnectionPool::ptr_eq(&pool, &fresh));
    }

    #[tokio::test]
    async fn test_privileged_pool_without_fallback() {
        let server = FakeServer::echo().await;
        let config = RegistryConfig::new()
            .transport(TransportConfig::new().privileged_port_fallback(false));
        let registry = ConnectionRegistry::with_handle(config, Handle::current());

        let err = registry
            .send_and_wait(&server.endpoint(), true, &request(1), LONG)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::LocalBinding(_)));

        // Non-privileged traffic is unaffected
        let reply = registry
            .send_and_wait(&server.endpoint(), false, &request(2), LONG)
            .await
            .unwrap();
        assert_eq!(reply.xid(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_on_borrowed_runtime() {
        let server = FakeServer::echo().await;
        let registry = registry();
        let endpoint = server.endpoint();
        let pool = registry.pool(&endpoint, false).unwrap();

        registry.shutdown();
        registry.shutdown();
        assert!(registry.is_shut_down());
        assert!(pool.is_closed());
        assert_eq!(registry.pool_count(), 0);

        let err = registry
            .send_and_wait(&endpoint, false, &request(1), LONG)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Network(NetworkError::PoolClosed { .. })
        ));
    }

    #[test]
    fn test_blocking_api_on_owned_runtime() {
        let registry = ConnectionRegistry::new(RegistryConfig::new().io_threads(2)).unwrap();
        let server = registry.io_handle().block_on(FakeServer::echo());
        let endpoint = server.endpoint();

        for xid in 1..=4 {
            let reply = registry
                .send_and_wait_blocking(&endpoint, false, &request(xid), LONG)
                .unwrap();
            assert_eq!(reply.xid(), xid);
            assert_eq!(reply.payload(), request(xid).payload());
        }
        assert_eq!(registry.call_metric().calls(), 4);

        // Caller threads share the registry
        let registry = Arc::new(registry);
        let threads: Vec<_> = (10..14)
            .map(|xid| {
                let registry = registry.clone();
                let endpoint = endpoint.clone();
                std::thread::spawn(move || {
                    registry
                        .send_and_wait_blocking(&endpoint, false, &request(xid), LONG)
                        .unwrap()
                        .xid()
                })
            })
            .collect();
        for (thread, xid) in threads.into_iter().zip(10..14) {
            assert_eq!(thread.join().unwrap(), xid);
        }

        registry.shutdown();
        let err = registry
            .send_and_wait_blocking(&endpoint, false, &request(99), LONG)
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Network(NetworkError::PoolClosed { .. })
        ));
        drop(server);
    }
}
