//! Loopback RPC server used by the transport tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use nfsrpc_codec::RecordCodec;
use nfsrpc_core::{Endpoint, RpcRequest, read_xid};

/// What the server does with a request, chosen by xid.
pub(crate) enum Reply {
    /// Send the record straight back.
    Echo,
    /// Send the record back after a delay, without blocking later requests.
    Delay(Duration),
    /// Never answer.
    Ignore,
    /// Close the socket without answering.
    Close,
}

pub(crate) struct FakeServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub(crate) async fn start<F>(policy: F) -> Self
    where
        F: Fn(u32) -> Reply + Send + Sync + 'static,
    {
        let policy = Arc::new(policy);
        Self::listen(move |stream| {
            tokio::spawn(serve(stream, policy.clone()));
        })
        .await
    }

    pub(crate) async fn echo() -> Self {
        Self::start(|_| Reply::Echo).await
    }

    /// Accept connections and never read from them.
    pub(crate) async fn stalled() -> Self {
        let mut held = Vec::new();
        Self::listen(move |stream| held.push(stream)).await
    }

    /// Accept connections without reading, handing each stream to the test.
    pub(crate) async fn holding() -> (Self, mpsc::UnboundedReceiver<TcpStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Self::listen(move |stream| {
            let _ = tx.send(stream);
        })
        .await;
        (server, rx)
    }

    async fn listen<F>(mut on_accept: F) -> Self
    where
        F: FnMut(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                on_accept(stream);
            }
        });

        Self {
            addr,
            accepted,
            task,
        }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.addr)
    }

    /// Number of connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<F>(stream: TcpStream, policy: Arc<F>)
where
    F: Fn(u32) -> Reply + Send + Sync + 'static,
{
    let (read, write) = stream.into_split();
    let mut records = FramedRead::new(read, RecordCodec::new());
    let sink = Arc::new(Mutex::new(FramedWrite::new(write, RecordCodec::new())));

    while let Some(Ok(record)) = records.next().await {
        let Ok(xid) = read_xid(&record) else { continue };

        match policy(xid) {
            Reply::Echo => {
                let _ = sink.lock().await.send(record).await;
            }
            Reply::Delay(delay) => {
                let sink = sink.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sink.lock().await.send(record).await;
                });
            }
            Reply::Ignore => {}
            Reply::Close => return,
        }
    }
}

/// A request whose payload starts with its xid.
pub(crate) fn request(xid: u32) -> RpcRequest {
    let mut payload = xid.to_be_bytes().to_vec();
    payload.extend_from_slice(b"nfsrpc-test");
    RpcRequest::new(xid, Bytes::from(payload))
}

/// An endpoint nothing is listening on.
pub(crate) async fn unused_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Endpoint::from(addr)
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub(crate) async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
