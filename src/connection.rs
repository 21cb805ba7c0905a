//! Persistent connection handle and its background driver.
//!
//! [`Connection`] is a thin handle. [`start`](Connection::start) spawns a
//! driver task that negotiates a transport, then multiplexes inbound frames,
//! queued sends, keep-alive and shutdown with `tokio::select!`. Sends reach the
//! driver over an unbounded MPSC channel and are answered on a oneshot.
//! Notifications go through the connection's [`EventDispatcher`].
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> persistent_connection::error::Result<()> {
//! use persistent_connection::{Connection, ConnectionEvent};
//!
//! let connection = Connection::builder("http://localhost:8080/echo")
//!     .query_string("token=abc")
//!     .build();
//! let mut events = connection.events();
//!
//! connection.start().await?;
//! connection.send("hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ConnectionEvent::Received(text) => println!("{text}"),
//!         ConnectionEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::dispatcher::{EventDispatcher, HandlerResult, SubscriptionId};
use crate::envelope::{self, Envelope, MessageId};
use crate::error::{ConnectionError, Result};
use crate::event::{ConnectionEvent, EventKind};
use crate::http::{CookieJar, Credentials, HttpClient, HttpRequest, HttpResponse, RequestPreparer};
use crate::reconnect::{self, abort_quietly, stop_quietly, ReconnectOutcome};
use crate::session::{Session, SessionSnapshot};
use crate::state::{ConnectionState, StateChange, StateMachine};
use crate::transport::{ClientTransport, StartMode, TransportHost};
use crate::transports::{self, LongPollingTransport};

type Item = Arc<dyn Any + Send + Sync>;

// ── Builder ─────────────────────────────────────────────────────────

/// Builder for a [`Connection`].
///
/// # Example
///
/// ```
/// use persistent_connection::{Connection, ConnectionConfig, ConnectionState};
///
/// let connection = Connection::builder("http://localhost:8080/chat")
///     .query_string("room=42")
///     .config(ConnectionConfig::default())
///     .build();
/// assert_eq!(connection.url(), "http://localhost:8080/chat");
/// assert_eq!(connection.query_string(), Some("room=42"));
/// assert_eq!(connection.state(), ConnectionState::Disconnected);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    url: String,
    query_string: Option<String>,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Query string appended to every transport request. A leading `?` is dropped.
    #[must_use]
    pub fn query_string(mut self, query_string: impl Into<String>) -> Self {
        let query_string = query_string.into();
        self.query_string = Some(query_string.trim_start_matches('?').to_string());
        self
    }

    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Connection {
        Connection {
            shared: Arc::new(Shared {
                url: self.url,
                query_string: self.query_string,
                config: self.config,
                state: StateMachine::new(),
                session: Mutex::new(Session::default()),
                items: Mutex::new(HashMap::new()),
                cookies: CookieJar::new(),
                credentials: Mutex::new(None),
                dispatcher: EventDispatcher::new(),
            }),
            driver: tokio::sync::Mutex::new(None),
        }
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// State shared between the handle, the driver task and running transports.
pub(crate) struct Shared {
    url: String,
    query_string: Option<String>,
    pub(crate) config: ConnectionConfig,
    state: StateMachine,
    session: Mutex<Session>,
    items: Mutex<HashMap<String, Item>>,
    cookies: CookieJar,
    credentials: Mutex<Option<Credentials>>,
    dispatcher: EventDispatcher,
}

/// What the driver should do after a frame was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Continue,
    Disconnect,
}

impl Shared {
    /// Apply `expected → new`, emitting `StateChanged` and then `follow_up`.
    ///
    /// Both events are queued before the state guard is released, so nothing
    /// can be delivered between them.
    pub(crate) fn transition(
        &self,
        expected: ConnectionState,
        new: ConnectionState,
        follow_up: Option<ConnectionEvent>,
    ) -> bool {
        let applied = self.state.transition_with(expected, new, |change| {
            self.dispatcher.enqueue_all(
                std::iter::once(ConnectionEvent::StateChanged(change)).chain(follow_up),
            );
        });
        if applied {
            self.dispatcher.drain();
        }
        applied
    }

    /// `Disconnected → Connecting`, forgetting the previous session's identity.
    fn begin_session(&self) -> bool {
        let applied = self.state.transition_with(
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            |change| {
                self.lock_session().reset();
                self.dispatcher.enqueue(ConnectionEvent::StateChanged(change));
            },
        );
        if applied {
            self.dispatcher.drain();
        }
        applied
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.dispatcher.emit(event);
    }

    pub(crate) fn host(self: &Arc<Self>) -> Arc<dyn TransportHost> {
        Arc::clone(self) as Arc<dyn TransportHost>
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_items(&self) -> MutexGuard<'_, HashMap<String, Item>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_credentials(&self) -> MutexGuard<'_, Option<Credentials>> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge session metadata from a decoded frame.
    ///
    /// Returns `false` if the frame's message id was already seen.
    fn absorb(&self, envelope: &Envelope) -> bool {
        self.lock_session().apply(envelope)
    }

    /// Emit one `Received` per payload, in order.
    fn deliver(&self, envelope: &Envelope) {
        for payload in envelope.payloads() {
            self.dispatcher.enqueue(ConnectionEvent::Received(payload));
        }
        self.dispatcher.drain();
    }

    /// Decode and apply one inbound frame.
    ///
    /// Malformed frames are reported through `Error` and dropped.
    fn process_frame(&self, raw: &str) -> FrameOutcome {
        let envelope = match envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                self.emit(ConnectionEvent::error(e));
                return FrameOutcome::Continue;
            }
        };

        if self.absorb(&envelope) {
            self.deliver(&envelope);
        } else if !envelope.messages.is_empty() {
            warn!(
                message_id = ?envelope.message_id,
                dropped = envelope.messages.len(),
                "dropping payloads of an already delivered message id"
            );
        }

        if envelope.disconnect {
            FrameOutcome::Disconnect
        } else {
            FrameOutcome::Continue
        }
    }
}

impl RequestPreparer for Shared {
    fn prepare_request(&self, request: &mut HttpRequest) {
        if let Some(cookie) = self.cookies.header_value() {
            request.add_header("Cookie", cookie);
        }

        if let Some(credentials) = self.lock_credentials().as_ref() {
            if request.header("authorization").is_some() {
                warn!(url = %request.url, "request already has an Authorization header, not adding credentials");
            } else {
                request.add_header("Authorization", credentials.authorization());
            }
        }

        for (name, value) in &self.config.headers {
            request.add_header(name.clone(), value.clone());
        }
    }
}

impl TransportHost for Shared {
    fn url(&self) -> &str {
        &self.url
    }

    fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    fn session(&self) -> SessionSnapshot {
        self.lock_session().snapshot()
    }

    fn record_response(&self, response: &HttpResponse) {
        self.cookies.absorb(response);
    }
}

// ── Connection handle ───────────────────────────────────────────────

/// Command sent from the handle to the driver.
enum Command {
    Send {
        data: String,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
}

/// Handle to a running driver task.
struct Driver {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

/// A persistent connection to a server.
///
/// Created in [`ConnectionState::Disconnected`]. Every method takes `&self`;
/// wrap the connection in an [`Arc`] to share it between tasks.
pub struct Connection {
    shared: Arc<Shared>,
    /// Held for the whole of `stop` so start, send and a second stop wait for it.
    driver: tokio::sync::Mutex<Option<Driver>>,
}

impl Connection {
    /// Create a connection to `url` with default configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    pub fn builder(url: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder {
            url: url.into(),
            query_string: None,
            config: ConnectionConfig::default(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start with the default transports, most capable first.
    ///
    /// # Errors
    ///
    /// See [`start_with_transports`](Self::start_with_transports).
    pub async fn start(&self) -> Result<()> {
        self.start_with_transports(transports::default_transports())
            .await
    }

    /// Start with the HTTP-based transports running on `client`.
    ///
    /// # Errors
    ///
    /// See [`start_with_transports`](Self::start_with_transports).
    pub async fn start_with_http_client(&self, client: Arc<dyn HttpClient>) -> Result<()> {
        self.start_with_transports(vec![Box::new(LongPollingTransport::new(client))])
            .await
    }

    /// Start with a single caller-supplied transport.
    ///
    /// # Errors
    ///
    /// See [`start_with_transports`](Self::start_with_transports).
    pub async fn start_with_transport(&self, transport: impl ClientTransport) -> Result<()> {
        self.start_with_transports(vec![Box::new(transport)]).await
    }

    /// Negotiate a transport from `candidates`, in order, and start the driver.
    ///
    /// Resolves once the connection is `Connected`. Calling it on a connection
    /// that is already started is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NoTransports`] if `candidates` is empty
    /// - [`ConnectionError::NegotiationFailed`] if every candidate failed; an
    ///   `Error` event is raised too and the state returns to `Disconnected`
    /// - [`ConnectionError::Aborted`] if [`stop`](Self::stop) interrupted negotiation
    pub async fn start_with_transports(
        &self,
        candidates: Vec<Box<dyn ClientTransport>>,
    ) -> Result<()> {
        if candidates.is_empty() {
            return Err(ConnectionError::NoTransports);
        }

        let ready_rx = {
            let mut driver = self.driver.lock().await;
            if !self.shared.begin_session() {
                debug!(state = %self.state(), "start ignored, connection already started");
                return Ok(());
            }

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

            let task = tokio::spawn(drive(
                Arc::clone(&self.shared),
                candidates,
                cmd_rx,
                shutdown_rx,
                ready_tx,
            ));

            *driver = Some(Driver {
                cmd_tx,
                shutdown_tx: Some(shutdown_tx),
                task,
            });
            ready_rx
        };

        ready_rx.await.unwrap_or(Err(ConnectionError::Aborted))
    }

    /// Stop the connection.
    ///
    /// Aborts any negotiation or reconnect in progress, stops the transport and
    /// settles in `Disconnected`. If the connection was not already
    /// disconnected, a single `Closed` event is the last notification, and
    /// it has been delivered by the time this returns. Calling `stop` again is
    /// a no-op.
    pub async fn stop(&self) {
        let mut slot = self.driver.lock().await;

        if let Some(mut driver) = slot.take() {
            debug!("Connection: stop requested");
            if let Some(tx) = driver.shutdown_tx.take() {
                let _ = tx.send(());
            }

            // Await the driver with a timeout. If it doesn't exit in time,
            // abort it so the task cannot detach and run indefinitely.
            match tokio::time::timeout(self.shared.config.shutdown_timeout, &mut driver.task).await
            {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection driver terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection driver did not exit within timeout; aborting task");
                    driver.task.abort();
                    if let Err(join_err) = driver.task.await {
                        debug!("connection driver aborted: {join_err}");
                    }
                }
            }
        }

        loop {
            let current = self.shared.state.current();
            if current == ConnectionState::Disconnected {
                break;
            }
            if self.shared.transition(
                current,
                ConnectionState::Disconnected,
                Some(ConnectionEvent::Closed),
            ) {
                info!(from = %current, "connection stopped");
                break;
            }
        }

        self.shared.dispatcher.flush().await;
        drop(slot);
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Send a text payload.
    ///
    /// Sends issued while `Connecting` or `Reconnecting` are queued and go out
    /// once the connection is `Connected`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] if the connection is not
    /// started or stops before the payload goes out, or the transport's error
    /// if this send failed in transit.
    pub async fn send(&self, data: impl Into<String>) -> Result<()> {
        self.send_raw(data.into()).await.map(|_| ())
    }

    /// Serialize `value` to JSON and send it.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`ConnectionError::Serialization`].
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)?;
        self.send(data).await
    }

    /// Send a text payload and deserialize the transport's response into `R`.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`ConnectionError::EmptyResponse`] if the
    /// transport has no response body and [`ConnectionError::Serialization`]
    /// if it does not parse as `R`.
    pub async fn send_as<R: DeserializeOwned>(&self, data: impl Into<String>) -> Result<R> {
        let response = self
            .send_raw(data.into())
            .await?
            .filter(|body| !body.trim().is_empty())
            .ok_or(ConnectionError::EmptyResponse)?;
        Ok(serde_json::from_str(&response)?)
    }

    async fn send_raw(&self, data: String) -> Result<Option<String>> {
        if self.state() == ConnectionState::Disconnected {
            return Err(ConnectionError::NotConnected);
        }
        let cmd_tx = self
            .driver
            .lock()
            .await
            .as_ref()
            .map(|d| d.cmd_tx.clone())
            .ok_or(ConnectionError::NotConnected)?;

        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send { data, reply })
            .map_err(|_| ConnectionError::NotConnected)?;
        reply_rx.await.map_err(|_| ConnectionError::NotConnected)?
    }

    // ── State ───────────────────────────────────────────────────────

    /// Compare-and-swap the connection state, emitting `StateChanged` on success.
    ///
    /// Returns `false`, without side effects, if the current state is not
    /// `expected` or the edge is not part of the state graph.
    pub fn try_transition(&self, expected: ConnectionState, new: ConnectionState) -> bool {
        self.shared.transition(expected, new, None)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Query string supplied at construction, without the leading `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.shared.query_string.as_deref()
    }

    /// Server-assigned connection id of the current session.
    pub fn connection_id(&self) -> Option<String> {
        self.shared.lock_session().connection_id.clone()
    }

    /// Id of the last message processed in the current session.
    pub fn message_id(&self) -> Option<MessageId> {
        self.shared.lock_session().message_id
    }

    /// Groups the session belongs to, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.shared.lock_session().snapshot().groups
    }

    /// Replace the group membership sent with the next connect or reconnect.
    pub fn set_groups<I, S>(&self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared.lock_session().groups = groups.into_iter().map(Into::into).collect();
    }

    /// Connection id, message id and groups read under a single lock.
    pub fn session(&self) -> SessionSnapshot {
        self.shared.lock_session().snapshot()
    }

    // ── Items, cookies, credentials ─────────────────────────────────

    /// Attach caller state to the connection. Returns `true` if a value was replaced.
    pub fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> bool {
        self.shared
            .lock_items()
            .insert(key.into(), Arc::new(value))
            .is_some()
    }

    /// Fetch caller state, if present and of type `T`.
    pub fn item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.shared.lock_items().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_item(&self, key: &str) -> bool {
        self.shared.lock_items().remove(key).is_some()
    }

    /// Shared handle to the cookies sent with every request.
    pub fn cookies(&self) -> CookieJar {
        self.shared.cookies.clone()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.shared.lock_credentials().clone()
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.shared.lock_credentials() = credentials;
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Receive every event on an unbounded channel.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.shared.dispatcher.channel()
    }

    pub fn on_received<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .dispatcher
            .subscribe(Some(EventKind::Received), move |event| match event {
                ConnectionEvent::Received(text) => handler(text),
                _ => Ok(()),
            })
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionError) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .dispatcher
            .subscribe(Some(EventKind::Error), move |event| match event {
                ConnectionEvent::Error(e) => handler(e),
                _ => Ok(()),
            })
    }

    pub fn on_closed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .dispatcher
            .subscribe(Some(EventKind::Closed), move |_| handler())
    }

    pub fn on_reconnected<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .dispatcher
            .subscribe(Some(EventKind::Reconnected), move |_| handler())
    }

    pub fn on_state_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(StateChange) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .dispatcher
            .subscribe(Some(EventKind::StateChanged), move |event| match event {
                ConnectionEvent::StateChanged(change) => handler(*change),
                _ => Ok(()),
            })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .field("message_id", &self.message_id())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping both senders without a shutdown signal tells the driver
        // the handle is gone. It aborts the transport and closes on its own,
        // bounded by `shutdown_timeout`.
        if let Some(driver) = self.driver.get_mut().take() {
            debug!("connection handle dropped, detaching driver");
            drop(driver);
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

enum Negotiated {
    Connected(Box<dyn ClientTransport>, Envelope),
    Failed(Vec<String>),
    Aborted,
}

/// Why the connected loop returned.
enum Exit {
    Shutdown,
    HandleDropped,
    ServerDisconnect,
    Lost(String),
}

/// Background task owning the transport for one session.
async fn drive(
    shared: Arc<Shared>,
    candidates: Vec<Box<dyn ClientTransport>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    debug!("connection driver started");

    let (mut transport, handshake) = match negotiate(&shared, candidates, &mut shutdown_rx).await {
        Negotiated::Connected(transport, handshake) => (transport, handshake),
        Negotiated::Failed(attempts) => {
            shared.transition(ConnectionState::Connecting, ConnectionState::Disconnected, None);
            shared.emit(ConnectionEvent::error(ConnectionError::NegotiationFailed {
                attempts: attempts.clone(),
            }));
            let _ = ready_tx.send(Err(ConnectionError::NegotiationFailed { attempts }));
            return;
        }
        Negotiated::Aborted => {
            let _ = ready_tx.send(Err(ConnectionError::Aborted));
            return;
        }
    };

    let fresh = shared.absorb(&handshake);
    if !shared.transition(ConnectionState::Connecting, ConnectionState::Connected, None) {
        stop_quietly(transport.as_mut()).await;
        let _ = ready_tx.send(Err(ConnectionError::Aborted));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    if fresh {
        shared.deliver(&handshake);
    }

    if handshake.disconnect {
        close_from_driver(&shared, transport.as_mut(), "server requested disconnect").await;
        return;
    }

    loop {
        match connected_loop(&shared, transport.as_mut(), &mut cmd_rx, &mut shutdown_rx).await {
            Exit::Shutdown => {
                abort_quietly(transport.as_mut()).await;
                break;
            }
            Exit::HandleDropped => {
                let grace = shared.config.shutdown_timeout;
                if tokio::time::timeout(grace, abort_quietly(transport.as_mut()))
                    .await
                    .is_err()
                {
                    warn!("transport abort did not finish after the handle was dropped");
                }
                close_from_driver(&shared, transport.as_mut(), "connection handle dropped").await;
                break;
            }
            Exit::ServerDisconnect => {
                close_from_driver(&shared, transport.as_mut(), "server requested disconnect").await;
                break;
            }
            Exit::Lost(reason) => {
                info!(transport = transport.name(), %reason, "transport lost, reconnecting");
                match reconnect::reconnect(&shared, transport.as_mut(), &mut shutdown_rx).await {
                    ReconnectOutcome::Reconnected => continue,
                    ReconnectOutcome::Exhausted | ReconnectOutcome::Aborted => break,
                }
            }
        }
    }

    debug!("connection driver exited");
}

/// Try each candidate in order until one connects and completes the handshake.
async fn negotiate(
    shared: &Arc<Shared>,
    candidates: Vec<Box<dyn ClientTransport>>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Negotiated {
    let timeout = shared.config.transport_connect_timeout;
    let mut attempts = Vec::with_capacity(candidates.len());

    for mut transport in candidates {
        let name = transport.name();
        debug!(transport = name, "trying transport");

        let result = tokio::select! {
            _ = &mut *shutdown_rx => {
                debug!(transport = name, "stop requested during negotiation");
                abort_quietly(transport.as_mut()).await;
                return Negotiated::Aborted;
            }
            res = tokio::time::timeout(timeout, handshake(transport.as_mut(), shared.host())) => {
                res.unwrap_or_else(|_| Err(ConnectionError::Timeout))
            }
        };

        match result {
            Ok(envelope) => {
                info!(transport = name, "transport connected");
                return Negotiated::Connected(transport, envelope);
            }
            Err(e) => {
                warn!(transport = name, error = %e, "transport failed to connect");
                stop_quietly(transport.as_mut()).await;
                attempts.push(format!("{name}: {e}"));
            }
        }
    }

    Negotiated::Failed(attempts)
}

/// Start `transport` and wait for the first frame carrying a connection id.
async fn handshake(
    transport: &mut dyn ClientTransport,
    host: Arc<dyn TransportHost>,
) -> Result<Envelope> {
    transport.start(host, StartMode::Connect).await?;
    loop {
        let frame = match transport.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e),
            None => return Err(ConnectionError::TransportClosed),
        };
        if frame.trim().is_empty() {
            continue;
        }
        let envelope = envelope::decode(&frame)?;
        if envelope.connection_id.is_none() {
            return Err(ConnectionError::Protocol(
                "handshake frame carried no connection id".into(),
            ));
        }
        return Ok(envelope);
    }
}

/// Multiplex inbound frames, queued sends, keep-alive and shutdown while `Connected`.
async fn connected_loop(
    shared: &Shared,
    transport: &mut dyn ClientTransport,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Exit {
    let keep_alive = shared.config.keep_alive_timeout;
    let mut deadline = keep_alive.map(|t| Instant::now() + t);

    loop {
        tokio::select! {
            signal = &mut *shutdown_rx => {
                return match signal {
                    Ok(()) => {
                        debug!("shutdown signal received");
                        Exit::Shutdown
                    }
                    Err(_) => Exit::HandleDropped,
                };
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send { data, reply }) => {
                    let result = transport.send(data).await;
                    if let Err(e) = &result {
                        warn!(transport = transport.name(), error = %e, "send failed");
                    }
                    let _ = reply.send(result);
                }
                None => return Exit::HandleDropped,
            },

            frame = transport.recv() => match frame {
                Some(Ok(raw)) => {
                    deadline = keep_alive.map(|t| Instant::now() + t);
                    if shared.process_frame(&raw) == FrameOutcome::Disconnect {
                        return Exit::ServerDisconnect;
                    }
                }
                Some(Err(e)) => return Exit::Lost(e.to_string()),
                None => return Exit::Lost("closed by server".into()),
            },

            () = expire(deadline) => return Exit::Lost("keep-alive timeout".into()),
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Stop the transport and close the session from inside the driver.
async fn close_from_driver(shared: &Shared, transport: &mut dyn ClientTransport, reason: &str) {
    info!(transport = transport.name(), reason, "closing connection");
    stop_quietly(transport).await;
    shared.transition(
        ConnectionState::Connected,
        ConnectionState::Disconnected,
        Some(ConnectionEvent::Closed),
    );
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
    fn builder_strips_leading_question_mark() {
        let connection = Connection::builder("http://x").query_string("?a=1").build();
        assert_eq!(connection.query_string(), Some("a=1"));
    }

    #[test]
    fn items_are_typed() {
        let connection = Connection::new("http://x");
        assert!(!connection.set_item("count", 3_u32));
        assert!(connection.set_item("count", 4_u32));
        assert_eq!(connection.item::<u32>("count").as_deref(), Some(&4));
        assert!(connection.item::<String>("count").is_none());
        assert!(connection.remove_item("count"));
        assert!(connection.item::<u32>("count").is_none());
    }

    #[test]
    fn preparer_attaches_cookies_credentials_and_headers() {
        let connection = Connection::builder("http://x")
            .config(ConnectionConfig::default().with_header("X-Trace", "1"))
            .build();
        connection.cookies().insert("sid", "abc");
        connection.set_credentials(Some(Credentials::Bearer("tok".into())));

        let mut request = HttpRequest::get("http://x/poll");
        connection.shared.prepare_request(&mut request);

        assert_eq!(request.url, "http://x/poll");
        assert_eq!(request.header("cookie"), Some("sid=abc"));
        assert_eq!(request.header("authorization"), Some("Bearer tok"));
        assert_eq!(request.header("x-trace"), Some("1"));
    }

    #[test]
    fn preparer_keeps_existing_authorization() {
        let connection = Connection::new("http://x");
        connection.set_credentials(Some(Credentials::Bearer("tok".into())));

        let mut request = HttpRequest::get("http://x/poll");
        request.add_header("Authorization", "Custom 1");
        connection.shared.prepare_request(&mut request);

        let auth: Vec<_> = request
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("authorization"))
            .collect();
        assert_eq!(auth.len(), 1);
        assert_eq!(request.header("authorization"), Some("Custom 1"));
    }

    #[test]
    fn malformed_frame_reports_error_without_state_change() {
        let connection = Connection::new("http://x");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        connection.on_error(move |e| {
            sink.lock().unwrap().push(e.to_string());
            Ok(())
        });

        let outcome = connection.shared.process_frame("{not json");

        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("malformed frame"));
    }

    #[test]
    fn frame_updates_session_before_payloads_are_delivered() {
        let connection = Arc::new(Connection::new("http://x"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, conn) = (Arc::clone(&seen), Arc::downgrade(&connection));
        connection.on_received(move |text| {
            let id = conn.upgrade().and_then(|c| c.message_id()).map(MessageId::get);
            sink.lock().unwrap().push((text.to_string(), id));
            Ok(())
        });

        let outcome = connection
            .shared
            .process_frame(r#"{"MessageId":"3","Messages":["a","b","c"]}"#);

        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("a".to_string(), Some(3)),
                ("b".to_string(), Some(3)),
                ("c".to_string(), Some(3)),
            ]
        );
    }

    #[test]
    fn replayed_message_id_is_not_delivered_again() {
        let connection = Connection::new("http://x");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        connection.on_received(move |text| {
            sink.lock().unwrap().push(text.to_string());
            Ok(())
        });

        for _ in 0..3 {
            connection
                .shared
                .process_frame(r#"{"MessageId":"1","Messages":["m1"]}"#);
        }
        connection
            .shared
            .process_frame(r#"{"MessageId":"2","Messages":["m2"]}"#);

        assert_eq!(*seen.lock().unwrap(), vec!["m1", "m2"]);
        assert_eq!(connection.message_id(), Some(MessageId::new(2)));
    }

    #[test]
    fn disconnect_flag_is_reported() {
        let connection = Connection::new("http://x");
        assert_eq!(
            connection.shared.process_frame(r#"{"Disconnect":true}"#),
            FrameOutcome::Disconnect
        );
    }

    #[test]
    fn try_transition_emits_state_changed() {
        let connection = Connection::new("http://x");
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        connection.on_state_changed(move |c| {
            sink.lock().unwrap().push(c);
            Ok(())
        });

        assert!(connection.try_transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!connection.try_transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!connection.try_transition(ConnectionState::Connecting, ConnectionState::Reconnecting));

        assert_eq!(
            *changes.lock().unwrap(),
            vec![StateChange::new(
                ConnectionState::Disconnected,
                ConnectionState::Connecting
            )]
        );
    }

    #[tokio::test]
    async fn send_before_start_is_not_connected() {
        let connection = Connection::new("http://x");
        let err = connection.send("hi").await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn start_without_candidates_fails() {
        let connection = Connection::new("http://x");
        let err = connection.start_with_transports(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NoTransports));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_on_fresh_connection_is_silent() {
        let connection = Connection::new("http://x");
        let mut events = connection.events();
        connection.stop().await;
        assert!(events.try_recv().is_err());
    }
}
