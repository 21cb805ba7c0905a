//! Configuration for a [`Connection`](crate::Connection).

use std::time::Duration;

use crate::reconnect::ReconnectPolicy;

/// Default time a transport candidate gets to connect and deliver its handshake.
const DEFAULT_TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`Connection`](crate::Connection).
///
/// Every field has a sensible default.
///
/// # Example
///
/// ```
/// use persistent_connection::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_transport_connect_timeout(Duration::from_secs(2))
///     .with_keep_alive_timeout(Duration::from_secs(30))
///     .with_header("X-Client", "dashboard");
/// assert_eq!(config.keep_alive_timeout, Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time each negotiation candidate gets to start and deliver its
    /// handshake frame.
    ///
    /// Defaults to **5 seconds**.
    pub transport_connect_timeout: Duration,
    /// Retry policy applied after a transport loss.
    pub reconnect: ReconnectPolicy,
    /// Treat the transport as lost if no frame arrives for this long.
    ///
    /// Defaults to `None` (disabled).
    pub keep_alive_timeout: Option<Duration>,
    /// Time `stop` waits for the background driver before aborting it.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the driver immediately
    /// without waiting for the transport to stop gracefully.
    pub shutdown_timeout: Duration,
    /// Extra headers attached to every transport request.
    pub headers: Vec<(String, String)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport_connect_timeout: DEFAULT_TRANSPORT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            keep_alive_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            headers: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Set the per-candidate negotiation timeout.
    #[must_use]
    pub fn with_transport_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport_connect_timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable keep-alive loss detection.
    #[must_use]
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = Some(timeout);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Add a header sent with every transport request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::reconnect::Backoff;

    #[test]
    fn config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.transport_connect_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(config.keep_alive_timeout.is_none());
        assert!(config.headers.is_empty());
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn config_builder_methods() {
        let policy = ReconnectPolicy::default().with_backoff(Backoff::Fixed(Duration::ZERO));
        let config = ConnectionConfig::default()
            .with_reconnect_policy(policy)
            .with_shutdown_timeout(Duration::from_millis(10))
            .with_header("a", "1")
            .with_header("b", "2");
        assert_eq!(config.reconnect.backoff, Backoff::Fixed(Duration::ZERO));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(10));
        assert_eq!(config.headers.len(), 2);
    }
}
