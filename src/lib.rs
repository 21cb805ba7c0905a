//! # Persistent Connection
//!
//! Client-side persistent, bidirectional connection to a push-style server.
//!
//! A [`Connection`] negotiates one of several pluggable transports, keeps the
//! server-assigned session (connection id, message id, groups), transparently
//! re-establishes the transport after a loss, and delivers everything that
//! happens to subscribers in a single total order.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`ClientTransport`] for any backend
//! - **Built-in transports**: WebSockets (feature `transport-websocket`) and
//!   long polling over any [`HttpClient`] (`reqwest` with feature `http-reqwest`)
//! - **Resumable sessions**: reconnects carry the connection id, the last
//!   message id and the group membership
//! - **Ordered events**: `StateChanged`, `Received`, `Reconnected`, `Error` and
//!   `Closed` via callbacks or a channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> persistent_connection::error::Result<()> {
//! use persistent_connection::Connection;
//!
//! let connection = Connection::new("http://localhost:8080/echo");
//! connection.on_received(|text| {
//!     println!("server said: {text}");
//!     Ok(())
//! });
//! connection.on_state_changed(|change| {
//!     println!("{change}");
//!     Ok(())
//! });
//!
//! connection.start().await?;
//! connection.send("hello").await?;
//! connection.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod event;
pub mod http;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder};
pub use dispatcher::{EventDispatcher, HandlerError, HandlerResult, SubscriptionId};
pub use envelope::{Envelope, GroupDelta, MessageId};
pub use error::ConnectionError;
pub use event::{ConnectionEvent, EventKind};
pub use http::{CookieJar, Credentials, HttpClient, HttpRequest, HttpResponse, RequestPreparer};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use session::SessionSnapshot;
pub use state::{ConnectionState, StateChange, StateMachine};
pub use transport::{ClientTransport, StartMode, TransportHost};
pub use transports::LongPollingTransport;

#[cfg(feature = "http-reqwest")]
pub use http::ReqwestHttpClient;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
