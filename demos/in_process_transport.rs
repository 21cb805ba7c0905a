//! # In-process Transport
//!
//! Shows how to implement [`ClientTransport`] with a simple in-process
//! channel pair. Handy for:
//!
//! - **Testing**: exercise your application logic without a real server
//! - **Custom backends**: adapt any I/O layer (TCP, QUIC, IPC)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example in_process_transport
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use persistent_connection::error::Result;
use persistent_connection::{
    ClientTransport, Connection, ConnectionError, ConnectionEvent, StartMode, TransportHost,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A transport over two channels
// ─────────────────────────────────────────────────────────────────────

/// The client half, handed to `Connection::start_with_transport`.
pub struct ChannelTransport {
    /// Payloads the client sends go here (the server reads the other end).
    outbound: mpsc::UnboundedSender<String>,
    /// Frames the server pushes arrive here.
    inbound: mpsc::UnboundedReceiver<String>,
}

/// The server end, driven by `main`.
pub struct FakeServer {
    pub received: mpsc::UnboundedReceiver<String>,
    pub push: mpsc::UnboundedSender<String>,
}

/// Create a connected `(transport, server)` pair.
fn channel_pair() -> (ChannelTransport, FakeServer) {
    let (outbound, received) = mpsc::unbounded_channel();
    let (push, inbound) = mpsc::unbounded_channel();
    (
        ChannelTransport { outbound, inbound },
        FakeServer { received, push },
    )
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the ClientTransport trait
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl ClientTransport for ChannelTransport {
    fn name(&self) -> &'static str {
        "inProcess"
    }

    /// Nothing to dial: the channels already exist.
    async fn start(&mut self, host: Arc<dyn TransportHost>, mode: StartMode) -> Result<()> {
        tracing::info!("{} {} as {:?}", mode.action(), host.url(), host.session());
        Ok(())
    }

    async fn send(&mut self, data: String) -> Result<Option<String>> {
        self.outbound
            .send(data)
            .map_err(|e| ConnectionError::TransportSend(e.to_string()))?;
        Ok(None)
    }

    /// `mpsc::UnboundedReceiver::recv` is cancel-safe, so this is too.
    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Wire together the connection and the fake server
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (transport, mut server) = channel_pair();
    let connection = Connection::new("memory://demo");
    let mut events = connection.events();

    // The handshake frame must assign a connection id.
    server
        .push
        .send(serde_json::json!({ "ConnectionId": "demo-1" }).to_string())?;
    connection.start_with_transport(transport).await?;

    // ── Fake server: echo one payload back inside an envelope ──────
    connection.send("hello from the client").await?;
    let Some(payload) = server.received.recv().await else {
        return Err("client went away before sending".into());
    };
    tracing::info!("Server received: {payload}");
    server.push.send(
        serde_json::json!({ "MessageId": "1", "Messages": [format!("echo: {payload}")] })
            .to_string(),
    )?;

    // ── Read events until the echo arrives ──────────────────────────
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Received(text) => {
                tracing::info!("Event: Received({text})");
                break;
            }
            other => tracing::info!("Event: {other:?}"),
        }
    }

    connection.stop().await;
    tracing::info!("Done. Custom transport works!");
    Ok(())
}
