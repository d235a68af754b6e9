//! Socket-level transport configuration.

use std::time::Duration;

/// Default outbound high-water mark (1 GiB).
///
/// Large enough for tens of thousands of small metadata calls or a few dozen
/// 512 KiB writes queued on one connection.
pub const DEFAULT_WRITE_HIGH_WATER_MARK: usize = 1024 * 1024 * 1024;

/// Default maximum size of a reassembled inbound record (16 MiB).
pub const DEFAULT_MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Largest fragment the record-marking header can describe.
pub const MAX_FRAGMENT_SIZE: usize = 0x7fff_ffff;

/// Configuration shared by every connection a registry opens.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransportConfig {
    /// How long a connection attempt may take before it fails.
    pub connect_timeout: Duration,

    /// Enable TCP nodelay.
    pub nodelay: bool,

    /// TCP keepalive idle time. SO_KEEPALIVE is enabled either way.
    pub keepalive: Option<Duration>,

    /// Unflushed outbound bytes above which new sends are rejected.
    pub write_high_water_mark: usize,

    /// Maximum size of a reassembled inbound record.
    pub max_record_size: usize,

    /// Largest fragment emitted when framing an outbound record.
    pub max_fragment_size: usize,

    /// Connect from an ephemeral port when a privileged port is requested.
    ///
    /// Privileged-port binding is not supported. When this is `false`, a
    /// privileged connection fails with a local binding error instead.
    pub privileged_port_fallback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            write_high_water_mark: DEFAULT_WRITE_HIGH_WATER_MARK,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            privileged_port_fallback: true,
        }
    }
}

impl TransportConfig {
    /// Create a new transport configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable TCP nodelay.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Set the TCP keepalive idle time.
    #[must_use]
    pub fn keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = Some(idle);
        self
    }

    /// Set the outbound high-water mark in bytes.
    #[must_use]
    pub fn write_high_water_mark(mut self, bytes: usize) -> Self {
        self.write_high_water_mark = bytes;
        self
    }

    /// Set the maximum inbound record size.
    #[must_use]
    pub fn max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Set the largest outbound fragment, clamped to what the header can carry.
    #[must_use]
    pub fn max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size.clamp(1, MAX_FRAGMENT_SIZE);
        self
    }

    /// Allow or refuse the ephemeral-port fallback for privileged connections.
    #[must_use]
    pub fn privileged_port_fallback(mut self, enabled: bool) -> Self {
        self.privileged_port_fallback = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.write_high_water_mark, 1 << 30);
        assert!(config.nodelay);
        assert!(config.keepalive.is_some());
    }

    #[test]
    fn test_fragment_size_clamped() {
        assert_eq!(
            TransportConfig::new().max_fragment_size(usize::MAX).max_fragment_size,
            MAX_FRAGMENT_SIZE
        );
        assert_eq!(TransportConfig::new().max_fragment_size(0).max_fragment_size, 1);
    }
}
