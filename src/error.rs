//! Error types for the persistent connection client.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when using a [`Connection`](crate::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires a started connection.
    #[error("not connected to server")]
    NotConnected,

    /// No transport candidate could establish a connection.
    #[error("transport negotiation failed: {}", .attempts.join("; "))]
    NegotiationFailed {
        /// One `"<transport>: <reason>"` entry per candidate, in preference order.
        attempts: Vec<String>,
    },

    /// The reconnect window elapsed without re-establishing the transport.
    #[error("reconnect gave up after {attempts} attempt(s) in {elapsed:?}")]
    ReconnectExhausted {
        /// Number of reconnect attempts made.
        attempts: u32,
        /// Time spent in the `Reconnecting` state.
        elapsed: Duration,
    },

    /// An inbound frame could not be decoded.
    #[error("malformed frame: {0}")]
    Decode(String),

    /// The server violated the session protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A subscriber failed while handling an event.
    #[error("event handler failed: {0}")]
    Handler(String),

    /// An HTTP request completed with a non-success status.
    #[error("HTTP request failed with status {status}")]
    Http {
        /// The HTTP status code returned by the server.
        status: u16,
    },

    /// The connection URL could not be parsed or extended.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// `send_as` was used but the transport returned no response body.
    #[error("transport returned no response")]
    EmptyResponse,

    /// `start` was called but no transport is available.
    #[error("no transports available")]
    NoTransports,

    /// The operation was cancelled by `stop`.
    #[error("operation aborted by stop")]
    Aborted,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

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

    #[test]
    fn negotiation_failure_lists_every_attempt() {
        let err = ConnectionError::NegotiationFailed {
            attempts: vec![
                "webSockets: refused".into(),
                "longPolling: operation timed out".into(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "transport negotiation failed: webSockets: refused; longPolling: operation timed out"
        );
    }

    #[test]
    fn serde_errors_convert() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: ConnectionError = json_err.into();
        assert!(matches!(err, ConnectionError::Serialization(_)));
    }

    #[test]
    fn connection_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConnectionError>();
    }
}
