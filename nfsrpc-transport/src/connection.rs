//! A single multiplexed TCP connection to an RPC server.
//!
//! Each established connection owns two tasks on the I/O runtime: a reader
//! that deframes reply records and hands them to the [`Multiplexer`], and a
//! writer that drains the outbound queue onto the socket. Callers never touch
//! the socket; they frame their record, register the xid and enqueue.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_util::codec::FramedRead;

use nfsrpc_codec::{HEADER_LEN, RecordCodec};
use nfsrpc_core::{Endpoint, NetworkError, RpcError, RpcReply, RpcRequest, TransportConfig};

use crate::mux::{self, Multiplexer, PendingGuard, ReplyResult};

/// Lifecycle of a [`Connection`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, `connect` not called yet.
    Disconnected = 0,
    /// A connection attempt is in flight.
    Connecting = 1,
    /// The socket is open and accepting requests.
    Connected = 2,
    /// The socket is closed, or the connection attempt failed.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// Receives lifecycle events from a connection.
///
/// Events are delivered on the connection's reader task and must not block.
pub trait ConnectionObserver: Send + Sync {
    /// The socket went inactive. Pending requests have already been failed.
    fn on_inactive(&self, connection: &Connection);

    /// An I/O or framing error was observed. `on_inactive` follows.
    fn on_error(&self, connection: &Connection, error: &NetworkError) {
        let _ = (connection, error);
    }
}

/// Count of framed bytes handed to the writer but not yet on the socket.
#[derive(Debug)]
struct OutboundBuffer {
    queued: AtomicUsize,
    high_water_mark: usize,
}

impl OutboundBuffer {
    fn new(high_water_mark: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            high_water_mark,
        }
    }

    fn is_writable(&self) -> bool {
        self.queued() <= self.high_water_mark
    }

    // Incremented by the caller before the frame reaches the writer, so an
    // admitted request counts against the mark before it is written.
    fn enqueued(&self, len: usize) {
        self.queued.fetch_add(len, Ordering::AcqRel);
    }

    fn flushed(&self, len: usize) {
        self.queued.fetch_sub(len, Ordering::AcqRel);
    }

    fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Handles to the I/O tasks of an established connection.
struct Link {
    outbound: mpsc::UnboundedSender<Bytes>,
    buffer: Arc<OutboundBuffer>,
    close: watch::Sender<bool>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

/// A multiplexed TCP connection.
///
/// Any number of requests may be in flight at once; replies are matched to
/// their callers by xid in whatever order the server sends them.
pub struct Connection {
    id: usize,
    endpoint: Endpoint,
    privileged: bool,
    config: Arc<TransportConfig>,
    io: Handle,
    framer: RecordCodec,
    state: AtomicU8,
    link: OnceCell<Link>,
    mux: Multiplexer,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    // First write failure, reported as the cause once the reader winds down
    failure: OnceLock<NetworkError>,
    close_requested: AtomicBool,
    inactive: AtomicBool,
}

impl Connection {
    /// Create an unconnected connection. I/O tasks are spawned on `io`.
    #[must_use]
    pub fn new(
        id: usize,
        endpoint: Endpoint,
        privileged: bool,
        config: Arc<TransportConfig>,
        io: Handle,
    ) -> Self {
        let framer = RecordCodec::new().with_max_fragment_size(config.max_fragment_size);
        Self {
            id,
            endpoint,
            privileged,
            config,
            io,
            framer,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            link: OnceCell::new(),
            mux: Multiplexer::new(),
            observers: RwLock::new(Vec::new()),
            failure: OnceLock::new(),
            close_requested: AtomicBool::new(false),
            inactive: AtomicBool::new(false),
        }
    }

    /// Pool-local id of this connection.
    #[inline]
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Remote endpoint.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether a privileged local port was requested.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if the connection is accepting requests.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Check if the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.mux.pending_count()
    }

    /// Framed bytes queued for the socket but not yet written.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.link.get().map_or(0, |link| link.buffer.queued())
    }

    /// Address of the server, once connected.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.get().and_then(|link| link.peer_addr)
    }

    /// Local socket address, once connected.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.get().and_then(|link| link.local_addr)
    }

    /// Register a lifecycle observer.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// Open the socket and start the I/O tasks.
    ///
    /// Concurrent callers share one attempt. Calling this on a connection
    /// that is already established is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.broken());
        }

        let link = self.link.get_or_try_init(|| self.establish()).await?;
        if self.close_requested.load(Ordering::SeqCst) {
            link.close.send_replace(true);
        }
        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> Result<Link, RpcError> {
        self.set_state(ConnectionState::Connecting);

        if self.privileged {
            // Binding a reserved local port is not supported
            if !self.config.privileged_port_fallback {
                self.set_state(ConnectionState::Closed);
                return Err(RpcError::LocalBinding(format!(
                    "cannot bind a local port below 1024 for {}",
                    self.endpoint
                )));
            }
            tracing::warn!(
                endpoint = %self.endpoint,
                "privileged port requested, connecting from an ephemeral port"
            );
        }

        tracing::debug!(endpoint = %self.endpoint, connection = self.id, "connecting");

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                tracing::debug!(endpoint = %self.endpoint, error = %e, "connect failed");
                return Err(e);
            }
        };

        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (close, close_rx) = watch::channel(false);
        let buffer = Arc::new(OutboundBuffer::new(self.config.write_high_water_mark));
        let records = FramedRead::new(
            read_half,
            RecordCodec::new().with_max_record_size(self.config.max_record_size),
        );

        self.set_state(ConnectionState::Connected);
        self.io.spawn(write_loop(
            Arc::downgrade(self),
            write_half,
            outbound_rx,
            buffer.clone(),
            close_rx.clone(),
        ));
        self.io
            .spawn(read_loop(Arc::downgrade(self), records, close_rx));

        tracing::debug!(
            endpoint = %self.endpoint,
            connection = self.id,
            local = ?local_addr,
            "connection established"
        );

        Ok(Link {
            outbound,
            buffer,
            close,
            peer_addr,
            local_addr,
        })
    }

    async fn open_stream(&self) -> Result<TcpStream, RpcError> {
        let endpoint = self.endpoint.clone();
        let timeout = self.config.connect_timeout;

        // The socket is registered with the I/O runtime, not the caller's
        let attempt = self.io.spawn(async move {
            tokio::time::timeout(timeout, TcpStream::connect(endpoint.as_tuple())).await
        });

        let endpoint = self.endpoint.to_string();
        let stream = match attempt.await {
            Ok(Ok(Ok(stream))) => stream,
            Ok(Ok(Err(e))) => {
                return Err(NetworkError::ConnectFailed {
                    endpoint,
                    reason: e.to_string(),
                }
                .into());
            }
            Ok(Err(_)) => return Err(NetworkError::ConnectTimeout { endpoint, timeout }.into()),
            Err(e) => {
                return Err(NetworkError::ConnectFailed {
                    endpoint,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        configure_socket(&stream, &self.config).map_err(|e| NetworkError::ConnectFailed {
            endpoint,
            reason: e.to_string(),
        })?;
        Ok(stream)
    }

    /// Send a request and wait for its reply.
    ///
    /// The request is failed with a timeout if no reply arrives within
    /// `timeout`; other requests on the connection are unaffected and a
    /// reply arriving afterwards is discarded.
    pub async fn send_and_wait(
        &self,
        timeout: Duration,
        request: &RpcRequest,
    ) -> Result<RpcReply, RpcError> {
        let link = self.admit()?;
        let xid = request.xid();

        let reply = self
            .mux
            .register(xid)
            .ok_or_else(|| self.duplicate_xid(xid))?;
        // Cancels the entry on every exit that does not consume the reply,
        // including the caller dropping this future
        let mut pending = PendingGuard::new(&self.mux, xid);

        self.transmit(link, request)?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(completed) => {
                pending.disarm();
                // Completion dropped without a value
                completed.unwrap_or_else(|_| Err(self.broken()))
            }
            Err(_) => Err(NetworkError::Timeout {
                endpoint: self.endpoint.to_string(),
                timeout,
            }
            .into()),
        }
    }

    /// Send a request and resolve `callback` with its outcome.
    ///
    /// The callback runs exactly once: with the reply, with the failure that
    /// ends the connection, or right away if the request is not admitted (in
    /// which case the error is also returned). It runs on the reader task and
    /// must not block.
    pub fn send_with_callback<F>(&self, request: &RpcRequest, callback: F) -> Result<(), RpcError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        let xid = request.xid();

        let link = match self.admit() {
            Ok(link) => link,
            Err(e) => {
                mux::deliver(xid, callback, Err(e.clone()));
                return Err(e);
            }
        };

        if let Err(callback) = self.mux.register_callback(xid, Box::new(callback)) {
            let e = self.duplicate_xid(xid);
            mux::deliver(xid, callback, Err(e.clone()));
            return Err(e);
        }

        if let Err(e) = self.transmit(link, request) {
            self.mux.fail(xid, e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Complete the pending request matching `reply`.
    ///
    /// Returns `false` if nothing is waiting for it.
    pub fn notify_response(&self, reply: RpcReply) -> bool {
        self.mux.dispatch(reply)
    }

    /// Fail every pending request with a dropped-connection error.
    ///
    /// Returns the number of requests failed.
    pub fn notify_all_pending(&self, reason: &str) -> usize {
        let error = NetworkError::Dropped {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_owned(),
        };
        self.mux.fail_all(&error.into())
    }

    /// Close the socket. Idempotent.
    ///
    /// Pending requests are failed by the reader as it shuts down.
    pub fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        match self.link.get() {
            Some(link) => {
                self.state
                    .store(ConnectionState::Closed as u8, Ordering::SeqCst);
                link.close.send_replace(true);
            }
            None => {
                let _ = self.state.compare_exchange(
                    ConnectionState::Disconnected as u8,
                    ConnectionState::Closed as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let closed = ConnectionState::Closed as u8;
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != closed).then_some(state as u8)
            });
    }

    fn admit(&self) -> Result<&Link, RpcError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(self.broken()),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(self.not_connected());
            }
        }

        let link = self.link.get().ok_or_else(|| self.not_connected())?;
        if !link.buffer.is_writable() {
            tracing::warn!(
                endpoint = %self.endpoint,
                connection = self.id,
                queued = link.buffer.queued(),
                "outbound buffer over high-water mark, rejecting request"
            );
            return Err(NetworkError::Backpressure {
                endpoint: self.endpoint.to_string(),
            }
            .into());
        }
        Ok(link)
    }

    fn transmit(&self, link: &Link, request: &RpcRequest) -> Result<(), RpcError> {
        let payload = request.payload();
        let mut frame = BytesMut::with_capacity(payload.len() + HEADER_LEN);
        self.framer.encode_record(payload, &mut frame);

        let frame = frame.freeze();
        let len = frame.len();
        link.buffer.enqueued(len);
        if link.outbound.send(frame).is_err() {
            link.buffer.flushed(len);
            return Err(self.broken());
        }

        // The reader may have failed everything between admission and now
        if self.is_closed() {
            return Err(self.broken());
        }
        Ok(())
    }

    fn dispatch_record(&self, record: Bytes) {
        match RpcReply::decode(record) {
            Ok(reply) => {
                let xid = reply.xid();
                if !self.notify_response(reply) {
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        xid,
                        "discarding reply with no pending request"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "discarding malformed reply");
            }
        }
    }

    fn io_failure(&self, cause: &dyn fmt::Display) -> NetworkError {
        tracing::warn!(endpoint = %self.endpoint, connection = self.id, error = %cause, "connection failed");
        NetworkError::Io {
            endpoint: self.endpoint.to_string(),
            reason: cause.to_string(),
        }
    }

    fn fail(&self, error: NetworkError) {
        let _ = self.failure.set(error);
        self.close();
    }

    fn handle_inactive(&self, observed: Option<NetworkError>) {
        if self.inactive.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);

        let failure = self.failure.get().cloned().or(observed);
        let observers = self.observers.read().clone();

        if let Some(error) = &failure {
            for observer in &observers {
                observer.on_error(self, error);
            }
        }

        let cause: RpcError = failure.unwrap_or_else(|| self.broken_network()).into();
        let failed = self.mux.fail_all(&cause);
        tracing::debug!(
            endpoint = %self.endpoint,
            connection = self.id,
            failed,
            "connection inactive"
        );

        for observer in &observers {
            observer.on_inactive(self);
        }
    }

    fn broken_network(&self) -> NetworkError {
        NetworkError::Broken {
            endpoint: self.endpoint.to_string(),
        }
    }

    fn broken(&self) -> RpcError {
        self.broken_network().into()
    }

    fn not_connected(&self) -> RpcError {
        RpcError::NotConnected {
            endpoint: self.endpoint.to_string(),
        }
    }

    fn duplicate_xid(&self, xid: u32) -> RpcError {
        RpcError::DuplicateXid {
            xid,
            endpoint: self.endpoint.to_string(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("privileged", &self.privileged)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn configure_socket(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    let socket = SockRef::from(stream);
    socket.set_keepalive(true)?;
    if let Some(idle) = config.keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    Ok(())
}

async fn read_loop(
    connection: Weak<Connection>,
    mut records: FramedRead<OwnedReadHalf, RecordCodec>,
    mut closed: watch::Receiver<bool>,
) {
    let failure = loop {
        tokio::select! {
            () = close_signalled(&mut closed) => break None,
            record = records.next() => {
                let Some(conn) = connection.upgrade() else { return };
                match record {
                    Some(Ok(record)) => conn.dispatch_record(record),
                    Some(Err(e)) => break Some(conn.io_failure(&e)),
                    // Peer closed the socket
                    None => break None,
                }
            }
        }
    };
    drop(records);

    if let Some(conn) = connection.upgrade() {
        conn.handle_inactive(failure);
    }
}

/// Resolve once `close` has been requested.
///
/// Drops the watch borrow before returning so the enclosing task stays `Send`.
async fn close_signalled(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn write_loop(
    connection: Weak<Connection>,
    mut socket: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    buffer: Arc<OutboundBuffer>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = close_signalled(&mut closed) => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };

                let len = frame.len();
                // Close interrupts a write stalled on a peer that stopped reading
                let written = tokio::select! {
                    written = socket.write_all(&frame) => written,
                    () = close_signalled(&mut closed) => {
                        buffer.flushed(len);
                        break;
                    }
                };
                buffer.flushed(len);

                if let Err(e) = written {
                    if let Some(conn) = connection.upgrade() {
                        let failure = conn.io_failure(&e);
                        conn.fail(failure);
                    }
                    return;
                }
            }
        }
    }

    let _ = socket.shutdown().await;
}
