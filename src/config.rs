//! Runtime configuration for a [`Central`](crate::Central).

use std::time::Duration;

use crate::error::{Error, Result};

/// Timeouts and buffer sizes used by the central session.
///
/// Every native operation is bounded by one of these timeouts; when it
/// expires the operation fails with [`Error::Timeout`] instead of hanging.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Bound on the native acknowledgement of a disconnect.
    pub disconnect_timeout: Duration,
    /// Bound on a single service, characteristic or descriptor discovery.
    pub discovery_timeout: Duration,
    /// Bound on reads, writes and notification (un)subscription.
    pub io_timeout: Duration,
    /// Bound on starting or stopping a scan.
    pub radio_timeout: Duration,
    /// Buffer size of the broadcast event channel.
    pub event_capacity: usize,
}

impl CentralConfig {
    /// Default connect timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default disconnect timeout (5 seconds).
    pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default discovery timeout (10 seconds).
    pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default I/O timeout (10 seconds).
    pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default radio timeout (5 seconds).
    pub const DEFAULT_RADIO_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default broadcast capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 256;

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the I/O timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the radio timeout.
    pub fn with_radio_timeout(mut self, timeout: Duration) -> Self {
        self.radio_timeout = timeout;
        self
    }

    /// Set the broadcast event capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check that every timeout is non-zero and the event buffer can hold an event.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("io_timeout", self.io_timeout),
            ("radio_timeout", self.radio_timeout),
        ];

        if let Some((name, value)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::InvalidParameter {
                name: (*name).to_string(),
                value: format!("{:?}", value),
            });
        }

        if self.event_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "event_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: Self::DEFAULT_DISCONNECT_TIMEOUT,
            discovery_timeout: Self::DEFAULT_DISCOVERY_TIMEOUT,
            io_timeout: Self::DEFAULT_IO_TIMEOUT,
            radio_timeout: Self::DEFAULT_RADIO_TIMEOUT,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CentralConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_builder_methods() {
        let config = CentralConfig::default()
            .with_connect_timeout(Duration::from_millis(500))
            .with_io_timeout(Duration::from_secs(2))
            .with_event_capacity(8);

        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.io_timeout, Duration::from_secs(2));
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.discovery_timeout, CentralConfig::DEFAULT_DISCOVERY_TIMEOUT);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = CentralConfig::default().with_discovery_timeout(Duration::ZERO);
        match config.validate() {
            Err(Error::InvalidParameter { name, .. }) => assert_eq!(name, "discovery_timeout"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CentralConfig::default().with_event_capacity(0);
        assert!(config.validate().is_err());
    }
}
