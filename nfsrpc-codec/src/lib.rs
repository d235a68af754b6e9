//! # nfsrpc-codec
//!
//! Record-marking codec for RPC messages carried over a TCP byte stream.
//!
//! This crate provides:
//! - `RecordCodec` - record framer and per-connection deframer
//! - `FragmentHeader` - the 4-byte fragment header
//!
//! ## Wire Format
//!
//! ```text
//! record   := fragment+
//! fragment := header (4 bytes, big-endian) payload (length bytes)
//!
//! +---+-------------------------------+------------------+
//! | L | Length (31 bits)              | Payload (Length) |
//! +---+-------------------------------+------------------+
//! ```
//!
//! `L` is set on the last fragment of a record only.

mod record;

pub use record::{FragmentHeader, HEADER_LEN, LAST_FRAGMENT, RecordCodec};
