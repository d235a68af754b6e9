//! # nfsrpc-transport
//!
//! Client-side TCP transport for ONC RPC.
//!
//! This crate provides:
//! - `Multiplexer` - Request/reply correlation by xid
//! - `Connection` - One multiplexed TCP connection with its reader and writer tasks
//! - `ConnectionPool` - A fixed number of connections per endpoint
//! - `ConnectionRegistry` - Endpoint routing and the shared I/O runtime
//! - `CallMetric` - Average call latency
//!
//! ## Architecture Note
//!
//! All sockets live on one tokio runtime owned (or borrowed) by the
//! registry. Caller threads never touch a socket: they register a pending
//! request, enqueue its framed record and wait on a completion, either
//! asynchronously, by blocking, or through a callback.

mod connection;
mod metric;
mod mux;
mod pool;
mod registry;

#[cfg(test)]
mod test_support;

pub use connection::{Connection, ConnectionObserver, ConnectionState};
pub use metric::CallMetric;
pub use mux::{Multiplexer, ReplyCallback, ReplyResult};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use registry::{ConnectionRegistry, RegistryConfig};
