//! WebSocket transport over `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] maps the connection URL from `http(s)` to `ws(s)`
//! and opens `{url}/connect` (or `/reconnect`) with the session query. Both
//! `ws://` and `wss://` are supported; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::error::{ConnectionError, Result};
use crate::http::{HttpRequest, HttpResponse};
use crate::transport::{endpoint_url, session_query, ClientTransport, StartMode, TransportHost};

const TRANSPORT_NAME: &str = "webSockets";

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`ClientTransport`] backed by a WebSocket connection.
///
/// Text frames are frames. Ping, pong and binary frames are skipped.
/// [`send`](ClientTransport::send) writes a text frame and never has a
/// response body.
///
/// # Cancel Safety
///
/// The [`recv`](ClientTransport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages,
/// making it safe to use inside `tokio::select!`.
#[derive(Debug, Default)]
pub struct WebSocketTransport {
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `{url}/{action}?transport=webSockets&...` with a `ws` or `wss` scheme.
fn socket_url(host: &dyn TransportHost, mode: StartMode) -> Result<Url> {
    let mut params = vec![("transport", TRANSPORT_NAME.to_string())];
    params.extend(session_query(&host.session())?);
    let mut url = endpoint_url(host, mode.action(), &params)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::Protocol(format!(
                "unsupported scheme for websockets: {other}"
            )))
        }
    };
    url.set_scheme(scheme).map_err(|()| {
        ConnectionError::Protocol(format!("cannot switch {url} to {scheme}"))
    })?;
    Ok(url)
}

fn map_connect_error(e: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Http(response) => ConnectionError::Http {
            status: response.status().as_u16(),
        },
        Error::Io(io) => ConnectionError::Io(io),
        other => ConnectionError::Io(std::io::Error::other(other)),
    }
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    async fn start(&mut self, host: Arc<dyn TransportHost>, mode: StartMode) -> Result<()> {
        if let Err(e) = self.stop().await {
            tracing::debug!(error = %e, "closing previous WebSocket failed");
        }

        let url = socket_url(host.as_ref(), mode)?;
        tracing::debug!(url = %url, "connecting to WebSocket server");

        // Headers go through the preparer like any HTTP request, then onto the upgrade.
        let mut prepared = HttpRequest::get(url.as_str());
        host.prepare_request(&mut prepared);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(map_connect_error)?;
        for (name, value) in &prepared.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConnectionError::Protocol(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConnectionError::Protocol(format!("invalid header value: {e}")))?;
            request.headers_mut().append(name, value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_connect_error)?;

        host.record_response(&HttpResponse {
            status: response.status().as_u16(),
            headers: response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_lowercase(), v.to_string()))
                })
                .collect(),
            body: String::new(),
        });

        tracing::info!(url = %url, "WebSocket connection established");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, data: String) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(ConnectionError::TransportClosed)?;
        stream
            .send(Message::Text(data.into()))
            .await
            .map_err(|e| ConnectionError::TransportSend(e.to_string()))?;
        Ok(None)
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        let stream = self.stream.as_mut()?;
        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(ConnectionError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                // `Utf8Bytes::to_string()` copies the payload into a new `String`
                // because `Utf8Bytes` does not expose the inner buffer by value.
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) => {
                    // tungstenite auto-queues a Pong reply; no manual response needed.
                    tracing::debug!("received WebSocket ping");
                }
                Message::Pong(_) => {
                    tracing::debug!("received WebSocket pong (ignored)");
                }
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    // Never produced by the read half of the stream.
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        use tokio_tungstenite::tungstenite::Error;
        match stream.close(None).await {
            Ok(()) | Err(Error::ConnectionClosed | Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ConnectionError::TransportSend(e.to_string())),
        }
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
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
    use crate::session::SessionSnapshot;
    use crate::transport::testing::StaticHost;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn socket_url_switches_scheme_and_carries_session() {
        let host = StaticHost::new("https://example.com/hub").with_query("v=2");
        host.set_session(SessionSnapshot {
            connection_id: Some("c1".into()),
            message_id: Some(MessageId::new(4)),
            groups: Vec::new(),
        });

        let url = socket_url(&host, StartMode::Reconnect).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://example.com/hub/reconnect?transport=webSockets&connectionId=c1&messageId=4&v=2"
        );

        let url = socket_url(&StaticHost::new("http://example.com/hub"), StartMode::Connect).unwrap();
        assert_eq!(url.as_str(), "ws://example.com/hub/connect?transport=webSockets");
    }

    #[test]
    fn socket_url_rejects_other_schemes() {
        let err = socket_url(&StaticHost::new("ftp://example.com/hub"), StartMode::Connect)
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[tokio::test]
    async fn start_fails_with_unreachable_host() {
        let mut transport = WebSocketTransport::new();
        let host = Arc::new(StaticHost::new("http://127.0.0.1:1/hub"));
        let err = transport
            .start(host, StartMode::Connect)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// What the mock server saw of the upgrade request.
    #[derive(Debug, Default, Clone)]
    struct Upgrade {
        uri: String,
        header: Option<String>,
    }

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the base `http://` URL plus the upgrade record.
    async fn start_mock_server<F, Fut>(handler: F) -> (String, Arc<Mutex<Upgrade>>)
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upgrade = Arc::new(Mutex::new(Upgrade::default()));
        let record = Arc::clone(&upgrade);

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let mut seen = record.lock().unwrap();
                seen.uri = req.uri().to_string();
                seen.header = req
                    .headers()
                    .get("x-test")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Ok(resp)
            };
            let ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();
            handler(ws).await;
        });

        (format!("http://{addr}/hub"), upgrade)
    }

    async fn started(url: &str) -> WebSocketTransport {
        let host = Arc::new(StaticHost::new(url).with_header("X-Test", "yes"));
        let mut transport = WebSocketTransport::new();
        transport.start(host, StartMode::Connect).await.unwrap();
        transport
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn start_sends_action_query_and_prepared_headers() {
        let (url, upgrade) = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let _transport = started(&url).await;

        let upgrade = upgrade.lock().unwrap().clone();
        assert_eq!(upgrade.uri, "/hub/connect?transport=webSockets");
        assert_eq!(upgrade.header.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn recv_yields_text_frames_in_order() {
        let (url, _) = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("{\"MessageId\":\"1\"}".into())).await.unwrap();
            ws.send(Message::Text("{\"MessageId\":\"2\"}".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = started(&url).await;

        assert_eq!(transport.recv().await.unwrap().unwrap(), "{\"MessageId\":\"1\"}");
        assert_eq!(transport.recv().await.unwrap().unwrap(), "{\"MessageId\":\"2\"}");
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let (url, _) = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = started(&url).await;
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let (url, _) = start_mock_server(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text("frame after binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = started(&url).await;

        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, "frame after binary");
    }

    #[tokio::test]
    async fn send_round_trip_has_no_response() {
        let (url, _) = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = started(&url).await;
        assert_eq!(transport.send("echoed payload".to_string()).await.unwrap(), None);

        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, "echoed payload");
    }

    #[tokio::test]
    async fn send_after_stop_returns_transport_closed() {
        let (url, _) = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = started(&url).await;
        transport.stop().await.unwrap();

        let err = transport.send("too late".to_string()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportClosed));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn double_stop_is_idempotent() {
        let (url, _) =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = started(&url).await;
        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        transport.abort().await.unwrap();
    }
}
