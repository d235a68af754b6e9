//! Remote endpoint addressing.

use std::fmt;

/// A remote RPC service address: host name (or literal IP) and port.
///
/// The host is kept unresolved; two endpoints are the same pool key only if
/// they are spelled the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    /// Host name or IP literal (IPv6 without brackets).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Borrow the endpoint in the form accepted by `ToSocketAddrs`.
    #[must_use]
    pub fn as_tuple(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::new("nfs.local", 2049).to_string(), "nfs.local:2049");
        assert_eq!(Endpoint::new("::1", 111).to_string(), "[::1]:111");
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: std::net::SocketAddr = "127.0.0.1:2049".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("127.0.0.1", 2049));
    }
}
