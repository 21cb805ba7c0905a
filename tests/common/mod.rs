#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for persistent connection integration tests.
//!
//! Provides a channel-backed [`MockTransport`], the [`MockServer`] half that
//! feeds it, and helpers for building frames and reading events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use persistent_connection::error::Result;
use persistent_connection::{
    ClientTransport, ConnectionError, ConnectionEvent, ConnectionState, SessionSnapshot,
    StartMode, TransportHost,
};
use tokio::sync::mpsc;

/// How long tests wait for a single event before failing.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

// ── MockTransport ───────────────────────────────────────────────────

/// What a scripted `start` call does.
#[derive(Debug, Clone)]
pub enum StartBehavior {
    Succeed,
    Fail(String),
    /// Never completes; only a timeout or stop ends it.
    Hang,
}

/// One thing the server side pushes at the client.
#[derive(Debug)]
pub enum Step {
    Frame(String),
    /// `recv` reports loss with this error.
    Fail(String),
    /// `recv` reports the server closed the connection.
    Close,
}

/// Everything the mock observed.
#[derive(Debug, Default)]
pub struct MockLog {
    pub starts: StdMutex<Vec<(StartMode, SessionSnapshot)>>,
    pub sent: StdMutex<Vec<String>>,
    pub stops: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl MockLog {
    pub fn starts(&self) -> Vec<(StartMode, SessionSnapshot)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

/// A scripted transport for integration testing.
///
/// `start` results are consumed in order from the script, falling back to
/// `fallback` when it runs out. Frames come from the paired [`MockServer`];
/// with nothing queued, `recv` waits, like an idle connection.
pub struct MockTransport {
    name: &'static str,
    starts: VecDeque<StartBehavior>,
    fallback: StartBehavior,
    send_replies: VecDeque<Result<Option<String>>>,
    frames: mpsc::UnboundedReceiver<Step>,
    log: Arc<MockLog>,
}

/// Server half of a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockServer {
    tx: mpsc::UnboundedSender<Step>,
}

impl MockServer {
    pub fn frame(&self, frame: impl Into<String>) {
        self.tx.send(Step::Frame(frame.into())).unwrap();
    }

    pub fn fail(&self, reason: &str) {
        self.tx.send(Step::Fail(reason.to_string())).unwrap();
    }

    pub fn close(&self) {
        self.tx.send(Step::Close).unwrap();
    }

    /// Whether the transport half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl MockTransport {
    /// Create a transport named `name` whose starts all succeed.
    pub fn new(name: &'static str) -> (Self, MockServer, Arc<MockLog>) {
        let (tx, frames) = mpsc::unbounded_channel();
        let log = Arc::new(MockLog::default());
        let transport = Self {
            name,
            starts: VecDeque::new(),
            fallback: StartBehavior::Succeed,
            send_replies: VecDeque::new(),
            frames,
            log: Arc::clone(&log),
        };
        (transport, MockServer { tx }, log)
    }

    /// Script the outcome of the first `starts.len()` start calls.
    pub fn with_starts(mut self, starts: Vec<StartBehavior>) -> Self {
        self.starts = VecDeque::from(starts);
        self
    }

    /// Outcome of every start call past the script.
    pub fn with_fallback(mut self, fallback: StartBehavior) -> Self {
        self.fallback = fallback;
        self
    }

    /// Responses returned by successive sends; `Ok(None)` past the end.
    pub fn with_send_replies(mut self, replies: Vec<Result<Option<String>>>) -> Self {
        self.send_replies = VecDeque::from(replies);
        self
    }
}

#[async_trait]
impl ClientTransport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&mut self, host: Arc<dyn TransportHost>, mode: StartMode) -> Result<()> {
        self.log.starts.lock().unwrap().push((mode, host.session()));
        let behavior = self
            .starts
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match behavior {
            StartBehavior::Succeed => Ok(()),
            StartBehavior::Fail(reason) => Err(ConnectionError::TransportSend(reason)),
            StartBehavior::Hang => std::future::pending().await,
        }
    }

    async fn send(&mut self, data: String) -> Result<Option<String>> {
        self.log.sent.lock().unwrap().push(data);
        self.send_replies.pop_front().unwrap_or(Ok(None))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        match self.frames.recv().await? {
            Step::Frame(frame) => Some(Ok(frame)),
            Step::Fail(reason) => Some(Err(ConnectionError::TransportReceive(reason))),
            Step::Close => None,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.log.aborts.fetch_add(1, Ordering::SeqCst);
        self.stop().await
    }
}

// ── Frame helpers ───────────────────────────────────────────────────

/// Handshake frame assigning `connection_id`.
pub fn handshake(connection_id: &str) -> String {
    serde_json::json!({ "ConnectionId": connection_id }).to_string()
}

/// Frame carrying `messages` at `message_id`.
pub fn frame(message_id: u64, messages: &[&str]) -> String {
    serde_json::json!({
        "MessageId": message_id.to_string(),
        "Messages": messages,
    })
    .to_string()
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive the next event, failing the test after [`EVENT_TIMEOUT`].
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert the next event is `StateChanged(old -> new)`.
pub async fn expect_state(
    rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    old: ConnectionState,
    new: ConnectionState,
) {
    match next_event(rx).await {
        ConnectionEvent::StateChanged(change) => {
            assert_eq!(
                (change.old_state, change.new_state),
                (old, new),
                "unexpected transition"
            );
        }
        other => panic!("expected StateChanged({old} -> {new}), got {other:?}"),
    }
}

/// Assert the next event is `Received(text)`.
pub async fn expect_received(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>, text: &str) {
    match next_event(rx).await {
        ConnectionEvent::Received(got) => assert_eq!(got, text),
        other => panic!("expected Received({text}), got {other:?}"),
    }
}

/// Assert nothing else has been delivered.
pub fn expect_quiet(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
    if let Ok(event) = rx.try_recv() {
        panic!("expected no more events, got {event:?}");
    }
}

/// Install a test-writer tracing subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
