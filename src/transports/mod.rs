//! Built-in [`ClientTransport`](crate::ClientTransport) implementations.
//!
//! | Transport                | Name           | Requires                               |
//! |--------------------------|----------------|----------------------------------------|
//! | [`WebSocketTransport`]   | `webSockets`   | feature `transport-websocket`          |
//! | [`LongPollingTransport`] | `longPolling`  | any [`HttpClient`](crate::HttpClient)  |
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> persistent_connection::error::Result<()> {
//! use std::sync::Arc;
//! use persistent_connection::{Connection, LongPollingTransport, ReqwestHttpClient};
//!
//! let connection = Connection::new("http://localhost:8080/echo");
//! let client = Arc::new(ReqwestHttpClient::new());
//! connection
//!     .start_with_transport(LongPollingTransport::new(client))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::transport::ClientTransport;

pub mod long_polling;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use long_polling::LongPollingTransport;

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketTransport;

/// Candidates used by [`Connection::start`](crate::Connection::start), most capable first.
pub fn default_transports() -> Vec<Box<dyn ClientTransport>> {
    #[allow(unused_mut)]
    let mut transports: Vec<Box<dyn ClientTransport>> = Vec::new();

    #[cfg(feature = "transport-websocket")]
    transports.push(Box::new(WebSocketTransport::new()));

    #[cfg(feature = "http-reqwest")]
    transports.push(Box::new(LongPollingTransport::new(std::sync::Arc::new(
        crate::http::ReqwestHttpClient::new(),
    ))));

    transports
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

    #[test]
    #[cfg(all(feature = "transport-websocket", feature = "http-reqwest"))]
    fn default_order_prefers_websockets() {
        let names: Vec<_> = default_transports().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["webSockets", "longPolling"]);
    }
}
