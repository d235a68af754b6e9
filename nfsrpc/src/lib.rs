//! # nfsrpc
//!
//! Client-side TCP transport for NFS and other ONC RPC programs.
//!
//! nfsrpc provides:
//! - **Record marking** (RFC 5531 section 11) for framing calls and reassembling replies
//! - **Multiplexing**: many calls in flight per connection, correlated by xid
//! - **Pooling**: a bounded set of connections per server endpoint
//! - **Routing**: one registry that owns the I/O runtime and every pool
//!
//! Calls and replies are opaque XDR byte sequences; only the xid in the
//! first four bytes is read.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nfsrpc::{ConnectionRegistry, Endpoint, RegistryConfig, RpcRequest};
//! use std::time::Duration;
//!
//! let registry = ConnectionRegistry::new(RegistryConfig::default())?;
//! let server = Endpoint::new("nfs.example", 2049);
//!
//! // An already-encoded call whose first four bytes are its xid
//! let call = RpcRequest::from_encoded(vec![0, 0, 0, 1 /* ... */])?;
//! let reply = registry.send_and_wait_blocking(&server, false, &call, Duration::from_secs(5))?;
//! assert_eq!(reply.xid(), 1);
//!
//! registry.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Features
//!
//! - `serde` - Derive `Serialize`/`Deserialize` for the configuration types
//!
//! ## Architecture
//!
//! nfsrpc is composed of several crates:
//!
//! - [`nfsrpc-core`] - Errors, endpoints, messages and transport configuration
//! - [`nfsrpc-codec`] - Record-marking codec
//! - [`nfsrpc-transport`] - Connections, pools and the registry

// Re-export core types
pub use nfsrpc_core::{
    CodecError, Endpoint, ErrorKind, NetworkError, RpcError, RpcReply, RpcRequest,
    TransportConfig, read_xid,
};

// Re-export codec
pub use nfsrpc_codec::{FragmentHeader, RecordCodec};

// Re-export transport
pub use nfsrpc_transport::{
    CallMetric, Connection, ConnectionObserver, ConnectionPool, ConnectionRegistry,
    ConnectionState, Multiplexer, PoolConfig, PoolStats, RegistryConfig, ReplyResult,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use nfsrpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ConnectionRegistry, Endpoint, RegistryConfig, RpcError, RpcReply, RpcRequest,
    };
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
