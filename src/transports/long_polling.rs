//! Long-polling transport over any [`HttpClient`].
//!
//! `start` calls `GET {url}/connect` (or `/reconnect`) and treats the body as
//! the first frame. A background task then keeps a `GET {url}/poll` request
//! outstanding and forwards every non-empty body to [`recv`] through a
//! channel. Outbound payloads are form-posted to `{url}/send`.
//!
//! [`recv`]: ClientTransport::recv

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::{self, MessageId};
use crate::error::{ConnectionError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::transport::{endpoint_url, session_query, ClientTransport, StartMode, TransportHost};

const TRANSPORT_NAME: &str = "longPolling";

/// HTTP status a server may use for an empty poll.
const NO_CONTENT: u16 = 204;

/// Polling session established by a successful `start`.
struct PollSession {
    host: Arc<dyn TransportHost>,
    frames: mpsc::UnboundedReceiver<Result<String>>,
    poller: JoinHandle<()>,
}

/// A [`ClientTransport`] that emulates a persistent connection with
/// repeated HTTP requests.
///
/// # Cancel Safety
///
/// [`recv`](ClientTransport::recv) only reads from a channel fed by the poll
/// task, so it is cancel-safe.
pub struct LongPollingTransport {
    client: Arc<dyn HttpClient>,
    session: Option<PollSession>,
    /// Host of the last successful start. Outlives `stop` so `abort` can
    /// still end the server-side session.
    host: Option<Arc<dyn TransportHost>>,
}

impl LongPollingTransport {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            session: None,
            host: None,
        }
    }

    fn running(&self) -> Result<&PollSession> {
        self.session.as_ref().ok_or(ConnectionError::TransportClosed)
    }
}

impl std::fmt::Debug for LongPollingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollingTransport")
            .field("running", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for LongPollingTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.poller.abort();
        }
    }
}

#[async_trait]
impl ClientTransport for LongPollingTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    async fn start(&mut self, host: Arc<dyn TransportHost>, mode: StartMode) -> Result<()> {
        self.stop().await?;

        let mut params = vec![("transport", TRANSPORT_NAME.to_string())];
        params.extend(session_query(&host.session())?);
        let url = endpoint_url(host.as_ref(), mode.action(), &params)?;
        debug!(%url, "long polling start");

        let response = execute(self.client.as_ref(), host.as_ref(), HttpRequest::get(url)).await?;

        let (tx, frames) = mpsc::unbounded_channel();
        let mut forwarded = None;
        if !response.body.trim().is_empty() {
            forwarded = frame_message_id(&response.body);
            let _ = tx.send(Ok(response.body));
        }
        let poller = tokio::spawn(poll_loop(
            Arc::clone(&self.client),
            Arc::clone(&host),
            tx,
            forwarded,
        ));
        self.host = Some(Arc::clone(&host));

        self.session = Some(PollSession {
            host,
            frames,
            poller,
        });
        Ok(())
    }

    async fn send(&mut self, data: String) -> Result<Option<String>> {
        let session = self.running()?;
        let host = session.host.as_ref();

        let mut params = vec![("transport", TRANSPORT_NAME.to_string())];
        if let Some(id) = host.session().connection_id {
            params.push(("connectionId", id));
        }
        let url = endpoint_url(host, "send", &params)?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("data", &data)
            .finish();
        let mut request = HttpRequest::post(url, body);
        request.add_header("Content-Type", "application/x-www-form-urlencoded");

        let response = execute(self.client.as_ref(), host, request)
            .await
            .map_err(|e| match e {
                ConnectionError::Io(io) => ConnectionError::TransportSend(io.to_string()),
                other => other,
            })?;
        Ok(Some(response.body).filter(|body| !body.is_empty()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.session.as_mut()?.frames.recv().await
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.poller.abort();
            debug!("long polling stopped");
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.stop().await?;
        let Some(host) = self.host.take() else {
            return Ok(());
        };

        let host = host.as_ref();
        let mut params = vec![("transport", TRANSPORT_NAME.to_string())];
        if let Some(id) = host.session().connection_id {
            params.push(("connectionId", id));
        }
        let url = endpoint_url(host, "abort", &params)?;
        if let Err(e) = execute(self.client.as_ref(), host, HttpRequest::post(url, "")).await {
            debug!(error = %e, "abort request failed");
        }
        Ok(())
    }
}

/// Prepare, send and vet one request.
async fn execute(
    client: &dyn HttpClient,
    host: &dyn TransportHost,
    mut request: HttpRequest,
) -> Result<HttpResponse> {
    host.prepare_request(&mut request);
    let response = client.execute(request).await?;
    host.record_response(&response);
    if !response.is_success() {
        return Err(ConnectionError::Http {
            status: response.status,
        });
    }
    Ok(response)
}

/// Message id carried by a raw frame, if it decodes.
fn frame_message_id(raw: &str) -> Option<MessageId> {
    envelope::decode(raw).ok().and_then(|e| e.message_id)
}

/// Keep one poll outstanding until the server fails it or the receiver goes away.
///
/// `forwarded` is the highest message id handed to the channel so far. The
/// connection may not have applied it yet, so every poll resumes from the
/// larger of it and the session's own id.
async fn poll_loop(
    client: Arc<dyn HttpClient>,
    host: Arc<dyn TransportHost>,
    frames: mpsc::UnboundedSender<Result<String>>,
    mut forwarded: Option<MessageId>,
) {
    info!("starting poll loop");

    loop {
        match poll_once(client.as_ref(), host.as_ref(), forwarded).await {
            Ok(Some(frame)) => {
                forwarded = forwarded.max(frame_message_id(&frame));
                if frames.send(Ok(frame)).is_err() {
                    debug!("poll loop: receiver dropped, exiting");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "poll failed");
                let _ = frames.send(Err(e));
                break;
            }
        }
    }

    info!("poll loop exited");
}

async fn poll_once(
    client: &dyn HttpClient,
    host: &dyn TransportHost,
    forwarded: Option<MessageId>,
) -> Result<Option<String>> {
    let mut session = host.session();
    session.message_id = session.message_id.max(forwarded);

    let mut params = vec![("transport", TRANSPORT_NAME.to_string())];
    params.extend(session_query(&session)?);
    let url = endpoint_url(host, "poll", &params)?;

    let response = execute(client, host, HttpRequest::get(url)).await?;
    if response.status == NO_CONTENT || response.body.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(response.body))
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
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::envelope::MessageId;
    use crate::http::Method;
    use crate::session::SessionSnapshot;
    use crate::transport::testing::StaticHost;

    /// Scripted client keyed by the last path segment. Requests past the
    /// end of a script never complete, like an idle long poll.
    #[derive(Default)]
    struct ScriptedClient {
        scripts: Mutex<HashMap<String, VecDeque<Result<HttpResponse>>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        fn respond(self, action: &str, status: u16, body: &str) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .entry(action.to_string())
                .or_default()
                .push_back(Ok(HttpResponse {
                    status,
                    headers: Vec::new(),
                    body: body.to_string(),
                }));
            self
        }

        fn requests(&self, action: &str) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| action_of(&r.url) == action)
                .cloned()
                .collect()
        }
    }

    fn action_of(url: &str) -> String {
        let url = url::Url::parse(url).unwrap();
        url.path_segments()
            .and_then(|mut s| s.next_back().map(String::from))
            .unwrap_or_default()
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let action = action_of(&request.url);
            self.requests.lock().unwrap().push(request);
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&action)
                .and_then(VecDeque::pop_front);
            match next {
                Some(response) => response,
                None => std::future::pending().await,
            }
        }
    }

    fn host() -> Arc<StaticHost> {
        Arc::new(
            StaticHost::new("http://example.com/echo")
                .with_query("token=t")
                .with_header("X-Test", "1"),
        )
    }

    #[tokio::test]
    async fn start_yields_connect_body_then_polls() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond("connect", 200, r#"{"ConnectionId":"c1"}"#)
                .respond("poll", 204, "")
                .respond("poll", 200, r#"{"Messages":["hi"]}"#),
        );
        let host = host();
        let mut transport = LongPollingTransport::new(client.clone());

        transport
            .start(host.clone(), StartMode::Connect)
            .await
            .unwrap();

        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            r#"{"ConnectionId":"c1"}"#
        );
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            r#"{"Messages":["hi"]}"#
        );

        let connect = &client.requests("connect")[0];
        assert_eq!(connect.method, Method::Get);
        assert_eq!(
            connect.url,
            "http://example.com/echo/connect?transport=longPolling&token=t"
        );
        assert_eq!(connect.header("x-test"), Some("1"));
        assert_eq!(host.responses.lock().unwrap()[0], 200);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_carries_session_data() {
        let client = Arc::new(ScriptedClient::default().respond("reconnect", 200, ""));
        let host = host();
        host.set_session(SessionSnapshot {
            connection_id: Some("c1".into()),
            message_id: Some(MessageId::new(7)),
            groups: vec!["g".into()],
        });
        let mut transport = LongPollingTransport::new(client.clone());

        transport
            .start(host.clone(), StartMode::Reconnect)
            .await
            .unwrap();

        let url = &client.requests("reconnect")[0].url;
        assert_eq!(
            url.as_str(),
            "http://example.com/echo/reconnect?transport=longPolling&connectionId=c1&messageId=7&groups=%5B%22g%22%5D&token=t"
        );
    }

    #[tokio::test]
    async fn start_fails_on_error_status() {
        let client = Arc::new(ScriptedClient::default().respond("connect", 500, "boom"));
        let mut transport = LongPollingTransport::new(client);

        let err = transport
            .start(host(), StartMode::Connect)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Http { status: 500 }));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_poll_reports_loss_then_ends() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond("connect", 200, "")
                .respond("poll", 502, ""),
        );
        let mut transport = LongPollingTransport::new(client);
        transport.start(host(), StartMode::Connect).await.unwrap();

        let err = transport.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Http { status: 502 }));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_posts_form_encoded_payload() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond("connect", 200, "")
                .respond("send", 200, r#"{"ok":true}"#)
                .respond("send", 200, ""),
        );
        let host = host();
        host.set_session(SessionSnapshot {
            connection_id: Some("c1".into()),
            ..SessionSnapshot::default()
        });
        let mut transport = LongPollingTransport::new(client.clone());
        transport.start(host, StartMode::Connect).await.unwrap();

        let response = transport.send("a b&c".to_string()).await.unwrap();
        assert_eq!(response.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(transport.send("x".to_string()).await.unwrap(), None);

        let sent = &client.requests("send")[0];
        assert_eq!(sent.method, Method::Post);
        assert_eq!(
            sent.url,
            "http://example.com/echo/send?transport=longPolling&connectionId=c1&token=t"
        );
        assert_eq!(sent.body.as_deref(), Some("data=a+b%26c"));
        assert_eq!(
            sent.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[tokio::test]
    async fn send_before_start_is_closed() {
        let mut transport = LongPollingTransport::new(Arc::new(ScriptedClient::default()));
        let err = transport.send("x".to_string()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::TransportClosed));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_abort_notifies_server() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond("connect", 200, "")
                .respond("abort", 200, ""),
        );
        let mut transport = LongPollingTransport::new(client.clone());

        transport.stop().await.unwrap();
        transport.start(host(), StartMode::Connect).await.unwrap();
        transport.abort().await.unwrap();
        transport.abort().await.unwrap();
        transport.stop().await.unwrap();

        assert_eq!(client.requests("abort").len(), 1);
        assert!(tokio::time::timeout(Duration::from_millis(50), transport.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn abort_after_stop_still_ends_server_session() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond("connect", 200, "")
                .respond("abort", 200, ""),
        );
        let host = host();
        host.set_session(SessionSnapshot {
            connection_id: Some("c1".into()),
            ..SessionSnapshot::default()
        });
        let mut transport = LongPollingTransport::new(client.clone());
        transport.start(host, StartMode::Connect).await.unwrap();

        transport.stop().await.unwrap();
        assert!(client.requests("abort").is_empty());
        transport.abort().await.unwrap();

        let aborts = client.requests("abort");
        assert_eq!(aborts.len(), 1);
        assert_eq!(
            aborts[0].url,
            "http://example.com/echo/abort?transport=longPolling&connectionId=c1&token=t"
        );
    }

    #[tokio::test]
    async fn next_poll_resumes_after_the_forwarded_frame() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond("connect", 200, r#"{"ConnectionId":"c1","MessageId":"4"}"#)
                .respond("poll", 200, r#"{"MessageId":"5","Messages":["m5"]}"#),
        );
        let mut transport = LongPollingTransport::new(client.clone());
        transport.start(host(), StartMode::Connect).await.unwrap();

        transport.recv().await.unwrap().unwrap();
        transport.recv().await.unwrap().unwrap();
        let polls = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let polls = client.requests("poll");
                if polls.len() >= 2 {
                    return polls;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let resumed_from = |url: &str| {
            url::Url::parse(url)
                .unwrap()
                .query_pairs()
                .find(|(k, _)| k == "messageId")
                .map(|(_, v)| v.into_owned())
        };
        assert_eq!(resumed_from(&polls[0].url).as_deref(), Some("4"));
        assert_eq!(resumed_from(&polls[1].url).as_deref(), Some("5"));

        transport.stop().await.unwrap();
    }

    #[test]
    fn long_polling_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<LongPollingTransport>();
    }
}
