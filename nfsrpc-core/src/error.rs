//! Error types for the nfsrpc transport.

use std::sync::Arc;
use std::time::Duration;

/// Main error type returned by every send operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// Network-level failure (connect, broken socket, timeout, backpressure).
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A privileged (sub-1024) local port could not be acquired.
    #[error("local binding error: {0}")]
    LocalBinding(String),

    /// The connection was used before it was ever established.
    #[error("attempt to send RPC request over a connection to {endpoint} that was never established")]
    NotConnected {
        /// Remote endpoint of the connection.
        endpoint: String,
    },

    /// The transaction id is already pending on this connection.
    #[error("xid {xid} is already pending on the connection to {endpoint}")]
    DuplicateXid {
        /// The offending transaction id.
        xid: u32,
        /// Remote endpoint of the connection.
        endpoint: String,
    },

    /// Record framing or reply decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Network-level errors. Every variant names the remote endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    /// The TCP connection attempt failed.
    #[error("waiting for connection to {endpoint} to be established, but failed: {reason}")]
    ConnectFailed {
        /// Remote endpoint.
        endpoint: String,
        /// Underlying cause.
        reason: String,
    },

    /// The TCP connection attempt did not resolve in time.
    #[error("connection to {endpoint} not established after {timeout:?}")]
    ConnectTimeout {
        /// Remote endpoint.
        endpoint: String,
        /// Configured connect timeout.
        timeout: Duration,
    },

    /// The outbound buffer is over its high-water mark.
    #[error("too many pending requests for the connection: {endpoint}")]
    Backpressure {
        /// Remote endpoint.
        endpoint: String,
    },

    /// The connection is closed.
    #[error("the connection is broken: {endpoint}")]
    Broken {
        /// Remote endpoint.
        endpoint: String,
    },

    /// An I/O error was observed on the socket.
    #[error("tcp IO error on the connection {endpoint}: {reason}")]
    Io {
        /// Remote endpoint.
        endpoint: String,
        /// Underlying cause.
        reason: String,
    },

    /// No reply arrived before the call timeout.
    #[error("rpc request timeout after {timeout:?} on the connection: {endpoint}")]
    Timeout {
        /// Remote endpoint.
        endpoint: String,
        /// Timeout the caller asked for.
        timeout: Duration,
    },

    /// The connection was removed from its pool while the request was pending.
    #[error("connection to {endpoint} dropped: {reason}")]
    Dropped {
        /// Remote endpoint.
        endpoint: String,
        /// Why the connection was dropped.
        reason: String,
    },

    /// The pool or registry serving this endpoint has been shut down.
    #[error("connection pool for {endpoint} is closed")]
    PoolClosed {
        /// Remote endpoint.
        endpoint: String,
    },
}

/// Errors raised while framing or deframing records.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// A reassembled record exceeds the configured maximum.
    #[error("record too large: {size} bytes (max: {max})")]
    RecordTooLarge {
        /// Size the record would have reached.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A record is too short to carry a transaction id.
    #[error("record truncated: {len} bytes, need at least {needed}")]
    Truncated {
        /// Length of the record.
        len: usize,
        /// Minimum length required.
        needed: usize,
    },

    /// IO error from the underlying stream.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Coarse classification of an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect failure, broken socket, backpressure, or timeout.
    Network,
    /// Failure to bind a privileged local port.
    LocalBinding,
    /// The caller used the transport incorrectly.
    CallerMisuse,
    /// Malformed record on the wire.
    Codec,
}

impl RpcError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::LocalBinding(_) => ErrorKind::LocalBinding,
            Self::NotConnected { .. } | Self::DuplicateXid { .. } => ErrorKind::CallerMisuse,
            Self::Codec(_) => ErrorKind::Codec,
        }
    }

    /// Check if resending the same request may succeed.
    ///
    /// The transport never resends on its own; this is a hint for the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(NetworkError::PoolClosed { .. }) => false,
            Self::Network(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the connection that produced it is gone.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Network(
                NetworkError::Broken { .. }
                    | NetworkError::Io { .. }
                    | NetworkError::Dropped { .. }
                    | NetworkError::ConnectFailed { .. }
                    | NetworkError::ConnectTimeout { .. }
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_endpoint() {
        let err = RpcError::from(NetworkError::Backpressure {
            endpoint: "nfs.example:2049".into(),
        });
        assert_eq!(
            err.to_string(),
            "network error: too many pending requests for the connection: nfs.example:2049"
        );
    }

    #[test]
    fn test_kind() {
        let misuse = RpcError::NotConnected {
            endpoint: "a:1".into(),
        };
        assert_eq!(misuse.kind(), ErrorKind::CallerMisuse);
        assert_eq!(
            RpcError::LocalBinding("no port".into()).kind(),
            ErrorKind::LocalBinding
        );
        assert_eq!(
            RpcError::from(CodecError::Truncated { len: 1, needed: 4 }).kind(),
            ErrorKind::Codec
        );
    }

    #[test]
    fn test_retryable() {
        let timeout = RpcError::from(NetworkError::Timeout {
            endpoint: "a:1".into(),
            timeout: Duration::from_secs(1),
        });
        assert!(timeout.is_retryable());
        assert!(!timeout.is_connection_error());

        let closed = RpcError::from(NetworkError::PoolClosed {
            endpoint: "a:1".into(),
        });
        assert!(!closed.is_retryable());

        let broken = RpcError::from(NetworkError::Broken {
            endpoint: "a:1".into(),
        });
        assert!(broken.is_connection_error());
    }
}
