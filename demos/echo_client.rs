//! # Echo Client Example
//!
//! Demonstrates a complete connection lifecycle:
//!
//! 1. Negotiate a transport (WebSockets first, then long polling)
//! 2. Send a line of text every few seconds
//! 3. Print everything the server pushes back
//! 4. Survive transport loss through automatic reconnection
//! 5. Stop gracefully on Ctrl+C or when the connection closes
//!
//! ## Running
//!
//! ```sh
//! # Start an echo server on localhost:8080, then:
//! cargo run --example echo_client
//!
//! # Override the server URL:
//! ECHO_URL=http://my-server:8080/echo cargo run --example echo_client
//! ```

use std::time::Duration;

use persistent_connection::{Connection, ConnectionConfig, ConnectionEvent, ReconnectPolicy};

/// Default server URL when `ECHO_URL` is not set.
const DEFAULT_URL: &str = "http://localhost:8080/echo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Initialize tracing. Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("ECHO_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    tracing::info!("Connecting to {url}");

    let config = ConnectionConfig::default()
        .with_keep_alive_timeout(Duration::from_secs(30))
        .with_reconnect_policy(ReconnectPolicy::default().with_window(Duration::from_secs(60)));
    let connection = Connection::builder(url)
        .query_string("client=echo-demo")
        .config(config)
        .build();
    let mut events = connection.events();

    // ── Connect ─────────────────────────────────────────────────────
    connection.start().await?;
    tracing::info!(
        "Connected with id {}",
        connection.connection_id().unwrap_or_default()
    );

    // ── Event loop ──────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut counter = 0_u32;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    ConnectionEvent::Received(text) => tracing::info!("Server said: {text}"),
                    ConnectionEvent::StateChanged(change) => tracing::info!("State: {change}"),
                    ConnectionEvent::Reconnected => tracing::info!("Reconnected, session resumed"),
                    ConnectionEvent::Error(e) => tracing::warn!("Error: {e}"),
                    ConnectionEvent::Closed => {
                        tracing::warn!("Connection closed");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                counter += 1;
                if let Err(e) = connection.send(format!("ping #{counter}")).await {
                    tracing::warn!("Send failed: {e}");
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    connection.stop().await;
    tracing::info!("Stopped");
    Ok(())
}
