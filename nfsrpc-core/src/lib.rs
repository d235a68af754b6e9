//! # nfsrpc-core
//!
//! Core types, error definitions and configuration for the nfsrpc transport.
//!
//! This crate provides:
//! - Error types (`RpcError`, `NetworkError`, `CodecError`)
//! - Remote endpoint addressing (`Endpoint`)
//! - Opaque request/reply containers with xid access (`RpcRequest`, `RpcReply`)
//! - Socket-level configuration (`TransportConfig`)

mod config;
mod endpoint;
mod error;
mod message;

pub use config::{
    DEFAULT_MAX_RECORD_SIZE, DEFAULT_WRITE_HIGH_WATER_MARK, MAX_FRAGMENT_SIZE, TransportConfig,
};
pub use endpoint::Endpoint;
pub use error::{CodecError, ErrorKind, NetworkError, RpcError};
pub use message::{RpcReply, RpcRequest, XID_LEN, read_xid};
