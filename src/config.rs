//! Transport configuration.
//!
//! All timing and retry knobs live in one explicit struct passed to the
//! client at construction time. Defaults mirror the production service's
//! values.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

// ============================================================================
// TransportConfig
// ============================================================================

/// Configuration for [`TransportClient`](crate::TransportClient).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use mercury_client::TransportConfig;
///
/// let config = TransportConfig {
///     max_retries: Some(5),
///     ..TransportConfig::default()
/// };
/// assert_eq!(config.ping_interval, Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between liveness pings once authorized.
    pub ping_interval: Duration,

    /// How long to wait for a pong before closing the socket.
    pub pong_timeout: Duration,

    /// Initial delay of the exponential backoff schedule.
    pub backoff_initial: Duration,

    /// Ceiling on the backoff delay.
    pub backoff_max: Duration,

    /// How long a graceful close waits for the server's close
    /// acknowledgment before the closure is forced locally.
    pub force_close_delay: Duration,

    /// Retry ceiling for one `connect()` call. `None` retries forever.
    pub max_retries: Option<u32>,

    /// When enabled, a generic connection failure marks the current
    /// endpoint failed and asks the URL resolver for another one.
    pub high_availability: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(14),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(32),
            force_close_delay: Duration::from_secs(2),
            max_retries: None,
            high_availability: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.pong_timeout, Duration::from_secs(14));
        assert_eq!(config.backoff_initial, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(32));
        assert_eq!(config.force_close_delay, Duration::from_secs(2));
        assert_eq!(config.max_retries, None);
        assert!(!config.high_availability);
    }

    // The pong timeout has to fire before the next ping goes out, otherwise
    // a dead socket survives a full extra interval.
    #[test]
    fn test_pong_timeout_shorter_than_ping_interval() {
        let config = TransportConfig::default();
        assert!(config.pong_timeout < config.ping_interval);
    }
}
