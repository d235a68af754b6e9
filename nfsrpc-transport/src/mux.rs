//! Request/response correlation by transaction id.

use std::panic::{self, AssertUnwindSafe};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use nfsrpc_core::{RpcError, RpcReply};

/// Outcome delivered to a pending request.
pub type ReplyResult = Result<RpcReply, RpcError>;

/// Continuation invoked once with the outcome of an asynchronous send.
pub type ReplyCallback = Box<dyn FnOnce(ReplyResult) + Send + 'static>;

/// How a pending request is resolved.
enum Completion {
    Waiter(oneshot::Sender<ReplyResult>),
    // The mutex only makes the boxed callback shareable inside the table
    Callback(Mutex<ReplyCallback>),
}

impl Completion {
    fn complete(self, xid: u32, result: ReplyResult) {
        match self {
            // Ignore send errors - the waiter may have timed out
            Self::Waiter(sender) => {
                let _ = sender.send(result);
            }
            Self::Callback(callback) => deliver(xid, callback.into_inner(), result),
        }
    }
}

/// Run a reply callback, containing any panic it raises.
pub(crate) fn deliver<F>(xid: u32, callback: F, result: ReplyResult)
where
    F: FnOnce(ReplyResult),
{
    if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        tracing::error!(xid, "reply callback panicked");
    }
}

/// Pending-request table for one connection.
///
/// The caller chooses the transaction id. Each pending entry is resolved
/// exactly once, by a reply, a failure, or a cancellation, and is removed
/// from the table as it is resolved.
///
/// ## Example
///
/// ```rust
/// use bytes::Bytes;
/// use nfsrpc_core::RpcReply;
/// use nfsrpc_transport::Multiplexer;
///
/// let mux = Multiplexer::new();
/// let mut rx = mux.register(7).unwrap();
///
/// let reply = RpcReply::decode(Bytes::from_static(&[0, 0, 0, 7])).unwrap();
/// assert!(mux.dispatch(reply));
/// assert_eq!(rx.try_recv().unwrap().unwrap().xid(), 7);
/// ```
pub struct Multiplexer {
    pending: DashMap<u32, Completion>,
}

impl Multiplexer {
    /// Create a new multiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Register a waiter for `xid`.
    ///
    /// Returns `None` if `xid` is already pending.
    pub fn register(&self, xid: u32) -> Option<oneshot::Receiver<ReplyResult>> {
        match self.pending.entry(xid) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(Completion::Waiter(tx));
                Some(rx)
            }
        }
    }

    /// Register a callback for `xid`.
    ///
    /// Hands the callback back if `xid` is already pending.
    pub fn register_callback(&self, xid: u32, callback: ReplyCallback) -> Result<(), ReplyCallback> {
        match self.pending.entry(xid) {
            Entry::Occupied(_) => Err(callback),
            Entry::Vacant(slot) => {
                slot.insert(Completion::Callback(Mutex::new(callback)));
                Ok(())
            }
        }
    }

    /// Deliver a reply to the request with the same xid.
    ///
    /// Returns `false` if nothing was waiting for it (late or unknown reply).
    pub fn dispatch(&self, reply: RpcReply) -> bool {
        let xid = reply.xid();
        match self.pending.remove(&xid) {
            Some((_, pending)) => {
                pending.complete(xid, Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Fail one pending request.
    pub fn fail(&self, xid: u32, error: RpcError) -> bool {
        match self.pending.remove(&xid) {
            Some((_, pending)) => {
                pending.complete(xid, Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget a pending request without resolving it.
    ///
    /// Used when the waiter gave up; a reply arriving later is discarded.
    pub fn cancel(&self, xid: u32) -> bool {
        self.pending.remove(&xid).is_some()
    }

    /// Fail every pending request. Returns how many were failed.
    pub fn fail_all(&self, error: &RpcError) -> usize {
        // Collect keys first to avoid holding shard locks while completing
        let keys: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();

        let mut failed = 0;
        for xid in keys {
            if let Some((_, pending)) = self.pending.remove(&xid) {
                pending.complete(xid, Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Check whether `xid` is pending.
    #[must_use]
    pub fn is_pending(&self, xid: u32) -> bool {
        self.pending.contains_key(&xid)
    }

    /// Get the number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are any pending requests.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Cancels a waiter's entry when dropped, unless disarmed first.
///
/// Holds the registration of an awaited request so that a dropped or timed
/// out wait does not leave its xid pending.
pub(crate) struct PendingGuard<'a> {
    mux: &'a Multiplexer,
    xid: u32,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(mux: &'a Multiplexer, xid: u32) -> Self {
        Self {
            mux,
            xid,
            armed: true,
        }
    }

    /// The entry was already removed by its completion.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mux.cancel(self.xid);
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}
