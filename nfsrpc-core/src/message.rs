//! RPC request and reply containers.
//!
//! The transport never interprets procedure arguments. A message is an opaque,
//! already-encoded byte sequence; the only field the transport reads is the
//! transaction id, which ONC RPC places in the first four bytes (big-endian)
//! of both calls and replies.

use bytes::Bytes;

use crate::error::CodecError;

/// Length of the transaction id at the start of every RPC message.
pub const XID_LEN: usize = 4;

/// Read the transaction id from the first four bytes of an encoded message.
pub fn read_xid(message: &[u8]) -> Result<u32, CodecError> {
    match message.get(..XID_LEN) {
        Some(&[a, b, c, d]) => Ok(u32::from_be_bytes([a, b, c, d])),
        _ => Err(CodecError::Truncated {
            len: message.len(),
            needed: XID_LEN,
        }),
    }
}

/// An encoded RPC call ready to be framed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    xid: u32,
    payload: Bytes,
}

impl RpcRequest {
    /// Create a request from a caller-assigned xid and the encoded call.
    ///
    /// The payload is expected to carry the same xid; the transport uses the
    /// value given here to correlate the reply.
    #[must_use]
    pub fn new(xid: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            xid,
            payload: payload.into(),
        }
    }

    /// Create a request, reading its xid out of the encoded call.
    pub fn from_encoded(payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        let payload = payload.into();
        let xid = read_xid(&payload)?;
        Ok(Self { xid, payload })
    }

    /// Transaction id.
    #[inline]
    #[must_use]
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Encoded call bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// A complete RPC reply record as received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    xid: u32,
    payload: Bytes,
}

impl RpcReply {
    /// Decode the xid of a reassembled record.
    pub fn decode(record: Bytes) -> Result<Self, CodecError> {
        let xid = read_xid(&record)?;
        Ok(Self {
            xid,
            payload: record,
        })
    }

    /// Transaction id.
    #[inline]
    #[must_use]
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Raw reply bytes, xid included.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take the raw reply bytes.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
