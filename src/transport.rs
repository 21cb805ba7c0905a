//! Transport abstraction for persistent connections.
//!
//! A [`ClientTransport`] moves opaque text frames between the client and the
//! server. The connection drives it through a small lifecycle:
//!
//! 1. [`start`](ClientTransport::start) establishes connectivity, either for a
//!    new session ([`StartMode::Connect`]) or to resume one
//!    ([`StartMode::Reconnect`]). The [`TransportHost`] passed in gives access
//!    to the URL, the caller's query string, the live session data and the
//!    request preparer.
//! 2. [`recv`](ClientTransport::recv) yields inbound frames. Returning `None`
//!    or an error is how a transport reports that connectivity was lost.
//! 3. [`send`](ClientTransport::send) delivers one outbound payload.
//! 4. [`stop`](ClientTransport::stop) releases everything. It must be
//!    idempotent, and a stopped transport must accept another `start`.
//!    [`abort`](ClientTransport::abort) is the variant used when the session
//!    ends for good.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use persistent_connection::error::Result;
//! use persistent_connection::transport::{ClientTransport, StartMode, TransportHost};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl ClientTransport for MyTransport {
//!     fn name(&self) -> &'static str {
//!         "myTransport"
//!     }
//!
//!     async fn start(&mut self, host: Arc<dyn TransportHost>, mode: StartMode) -> Result<()> {
//!         // Connect to host.url(), resuming host.session() if mode is Reconnect
//!         todo!()
//!     }
//!
//!     async fn send(&mut self, data: String) -> Result<Option<String>> {
//!         // Deliver the payload; return the response body if there is one
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String>> {
//!         // Return the next frame, or None once the connection is gone
//!         todo!()
//!     }
//!
//!     async fn stop(&mut self) -> Result<()> {
//!         todo!()
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::{ConnectionError, Result};
use crate::http::{HttpResponse, RequestPreparer};
use crate::session::SessionSnapshot;

/// Why a transport is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Establish a new session during negotiation.
    Connect,
    /// Resume the current session after a loss.
    Reconnect,
}

impl StartMode {
    /// Endpoint action for this mode.
    pub fn action(self) -> &'static str {
        match self {
            StartMode::Connect => "connect",
            StartMode::Reconnect => "reconnect",
        }
    }
}

/// What a transport can see of the connection that owns it.
pub trait TransportHost: RequestPreparer {
    /// Base URL of the connection.
    fn url(&self) -> &str;

    /// Query string supplied at construction, without the leading `?`.
    fn query_string(&self) -> Option<&str>;

    /// Current session resumption data.
    fn session(&self) -> SessionSnapshot;

    /// Observe a response received from the server, e.g. to store cookies.
    fn record_response(&self, _response: &HttpResponse) {}
}

/// A pluggable, restartable frame transport.
///
/// # Cancel Safety
///
/// [`recv`](ClientTransport::recv) **MUST** be cancel-safe: the connection
/// polls it inside `tokio::select!` next to outbound sends and timers.
/// Channel-backed implementations are naturally cancel-safe.
#[async_trait]
pub trait ClientTransport: Send + 'static {
    /// Short name used in logs, errors and the `transport` query parameter.
    fn name(&self) -> &'static str;

    /// Establish connectivity.
    ///
    /// # Errors
    ///
    /// Any error makes the connection try the next candidate (negotiation) or
    /// schedule another attempt (reconnection).
    async fn start(&mut self, host: Arc<dyn TransportHost>, mode: StartMode) -> Result<()>;

    /// Send one payload, returning the response body if the transport has one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::TransportSend`] (or a more specific error)
    /// if the payload could not be delivered. Only this send fails; loss of
    /// connectivity is reported through [`recv`](ClientTransport::recv).
    async fn send(&mut self, data: String) -> Result<Option<String>>;

    /// Receive the next raw frame.
    ///
    /// Returns:
    /// - `Some(Ok(frame))`: a frame arrived
    /// - `Some(Err(e))`: connectivity was lost because of `e`
    /// - `None`: the server closed the connection
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Release the transport. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if a graceful shutdown failed. Resources must be
    /// released regardless.
    async fn stop(&mut self) -> Result<()>;

    /// End the session for good: stop, and tell the server if the transport
    /// has a way to. Called when the caller stops the connection.
    ///
    /// # Errors
    ///
    /// As [`stop`](ClientTransport::stop).
    async fn abort(&mut self) -> Result<()> {
        self.stop().await
    }
}

/// Query parameters that let the server resume `session`.
///
/// # Errors
///
/// Returns [`ConnectionError::Serialization`] if the groups cannot be encoded.
pub fn session_query(session: &SessionSnapshot) -> Result<Vec<(&'static str, String)>> {
    let mut params = Vec::new();
    if let Some(id) = &session.connection_id {
        params.push(("connectionId", id.clone()));
    }
    if let Some(id) = session.message_id {
        params.push(("messageId", id.to_string()));
    }
    if !session.groups.is_empty() {
        params.push(("groups", serde_json::to_string(&session.groups)?));
    }
    Ok(params)
}

/// Build `{host.url()}/{action}?{params}&{host.query_string()}`.
///
/// # Errors
///
/// Returns [`ConnectionError::InvalidUrl`] if the base URL cannot be parsed
/// or cannot carry a path.
pub fn endpoint_url(
    host: &dyn TransportHost,
    action: &str,
    params: &[(&str, String)],
) -> Result<Url> {
    let mut url = Url::parse(host.url())?;
    url.path_segments_mut()
        .map_err(|()| {
            ConnectionError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase)
        })?
        .pop_if_empty()
        .push(action);

    {
        let mut query = url.query_pairs_mut();
        for (name, value) in params {
            query.append_pair(name, value);
        }
        if let Some(extra) = host.query_string() {
            let extra = extra.trim_start_matches('?');
            for (name, value) in url::form_urlencoded::parse(extra.as_bytes()) {
                query.append_pair(&name, &value);
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
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
    use crate::envelope::MessageId;

    use crate::transport::testing::StaticHost;

    fn host(url: &str, query: Option<&str>) -> StaticHost {
        let host = StaticHost::new(url);
        match query {
            Some(query) => host.with_query(query),
            None => host,
        }
    }

    #[test]
    fn endpoint_appends_action_and_params() {
        let h = host("http://example.com/echo", Some("?token=a b"));
        let url = endpoint_url(&h, "connect", &[("transport", "longPolling".into())]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://example.com/echo/connect?transport=longPolling&token=a+b"
        );
    }

    #[test]
    fn endpoint_handles_trailing_slash_and_no_query() {
        let h = host("http://example.com/echo/", None);
        let url = endpoint_url(&h, "poll", &[]).unwrap();
        assert_eq!(url.as_str(), "http://example.com/echo/poll");
    }

    #[test]
    fn endpoint_rejects_bad_urls() {
        let err = endpoint_url(&host("not a url", None), "connect", &[]).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
        let err = endpoint_url(&host("mailto:a@b.c", None), "connect", &[]).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
    }

    #[test]
    fn session_query_includes_resumption_data() {
        let session = SessionSnapshot {
            connection_id: Some("c1".into()),
            message_id: Some(MessageId::new(9)),
            groups: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            session_query(&session).unwrap(),
            vec![
                ("connectionId", "c1".to_string()),
                ("messageId", "9".to_string()),
                ("groups", r#"["a","b"]"#.to_string()),
            ]
        );
        assert!(session_query(&SessionSnapshot::default()).unwrap().is_empty());
    }

    #[test]
    fn start_mode_actions() {
        assert_eq!(StartMode::Connect.action(), "connect");
        assert_eq!(StartMode::Reconnect.action(), "reconnect");
    }
}
