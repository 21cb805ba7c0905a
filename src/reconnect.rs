//! Reconnection coordinator.
//!
//! When a connected transport reports loss, [`reconnect`] moves the
//! connection to `Reconnecting`, stops the transport, and then keeps
//! restarting the *same* transport in [`StartMode::Reconnect`] with the stored
//! session data until it succeeds, the policy's window runs out, or `stop`
//! is requested.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::Shared;
use crate::error::ConnectionError;
use crate::event::ConnectionEvent;
use crate::state::ConnectionState;
use crate::transport::{ClientTransport, StartMode};

/// Default delay before the first reconnect attempt.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default cap for exponential backoff.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default total time allowed in `Reconnecting`.
const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// Default timeout of a single reconnect attempt.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Spacing between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait the same delay before every attempt.
    Fixed(Duration),
    /// Wait `initial * multiplier^attempt`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: u32,
    },
}

impl Backoff {
    /// Delay before attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.max(1).saturating_pow(attempt);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            multiplier: 2,
        }
    }
}

/// Retry policy applied while `Reconnecting`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use persistent_connection::reconnect::{Backoff, ReconnectPolicy};
///
/// let policy = ReconnectPolicy::default()
///     .with_backoff(Backoff::Fixed(Duration::from_millis(250)))
///     .with_window(Duration::from_secs(10));
/// assert_eq!(policy.backoff.delay(3), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    /// Total time budget. No attempt is started once it has elapsed.
    pub window: Duration,
    /// Upper bound for a single `start` attempt.
    pub attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            window: DEFAULT_WINDOW,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// How a reconnect cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectOutcome {
    /// Back to `Connected`; `Reconnected` was emitted.
    Reconnected,
    /// The window elapsed; the connection is `Disconnected` and `Closed` was emitted.
    Exhausted,
    /// `stop` was requested or won the race for the state. The transport is aborted.
    Aborted,
}

/// Run one reconnect cycle for `transport`, which just reported loss.
pub(crate) async fn reconnect(
    shared: &Arc<Shared>,
    transport: &mut dyn ClientTransport,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> ReconnectOutcome {
    let name = transport.name();
    if !shared.transition(ConnectionState::Connected, ConnectionState::Reconnecting, None) {
        debug!(transport = name, "not connected anymore, skipping reconnect");
        abort_quietly(transport).await;
        return ReconnectOutcome::Aborted;
    }

    // The lost instance must be fully stopped before it is started again.
    stop_quietly(transport).await;

    let policy = shared.config.reconnect;
    let began = Instant::now();
    let deadline = began + policy.window;
    let mut attempt: u32 = 0;

    loop {
        let delay = policy.backoff.delay(attempt);
        let now = Instant::now();
        if now + delay >= deadline {
            break;
        }

        tokio::select! {
            signal = &mut *shutdown_rx => {
                debug!(transport = name, "stop requested during reconnect backoff");
                return abandon(shared, transport, signal.is_err()).await;
            }
            () = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        let budget = policy
            .attempt_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        debug!(transport = name, attempt, ?budget, "reconnect attempt");

        let host = shared.host();
        let result = tokio::select! {
            signal = &mut *shutdown_rx => {
                debug!(transport = name, "stop requested during reconnect attempt");
                return abandon(shared, transport, signal.is_err()).await;
            }
            res = tokio::time::timeout(budget, transport.start(host, StartMode::Reconnect)) => res,
        };

        match result {
            Ok(Ok(())) => {
                if shared.transition(
                    ConnectionState::Reconnecting,
                    ConnectionState::Connected,
                    Some(ConnectionEvent::Reconnected),
                ) {
                    info!(transport = name, attempt, "reconnected");
                    return ReconnectOutcome::Reconnected;
                }
                abort_quietly(transport).await;
                return ReconnectOutcome::Aborted;
            }
            Ok(Err(e)) => warn!(transport = name, attempt, error = %e, "reconnect attempt failed"),
            Err(_) => warn!(transport = name, attempt, "reconnect attempt timed out"),
        }
        stop_quietly(transport).await;
    }

    let elapsed = began.elapsed();
    warn!(transport = name, attempts = attempt, ?elapsed, "reconnect window exhausted");
    shared.emit(ConnectionEvent::error(ConnectionError::ReconnectExhausted {
        attempts: attempt,
        elapsed,
    }));
    if shared.transition(
        ConnectionState::Reconnecting,
        ConnectionState::Disconnected,
        Some(ConnectionEvent::Closed),
    ) {
        ReconnectOutcome::Exhausted
    } else {
        ReconnectOutcome::Aborted
    }
}

/// End the session on the caller's behalf while `Reconnecting`.
///
/// `handle_dropped` means nobody is left to run `stop`, so the driver settles
/// the state and emits `Closed` itself.
async fn abandon(
    shared: &Shared,
    transport: &mut dyn ClientTransport,
    handle_dropped: bool,
) -> ReconnectOutcome {
    let grace = shared.config.shutdown_timeout;
    if tokio::time::timeout(grace, abort_quietly(transport)).await.is_err() {
        warn!(?grace, "transport abort timed out");
    }
    if handle_dropped {
        shared.transition(
            ConnectionState::Reconnecting,
            ConnectionState::Disconnected,
            Some(ConnectionEvent::Closed),
        );
    }
    ReconnectOutcome::Aborted
}

pub(crate) async fn abort_quietly(transport: &mut dyn ClientTransport) {
    if let Err(e) = transport.abort().await {
        debug!(transport = transport.name(), error = %e, "transport abort failed");
    }
}

pub(crate) async fn stop_quietly(transport: &mut dyn ClientTransport) {
    if let Err(e) = transport.stop().await {
        debug!(transport = transport.name(), error = %e, "transport stop failed");
    }
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
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2,
        };
        let delays: Vec<_> = (0..5).map(|a| backoff.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn exponential_backoff_survives_huge_attempts() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn zero_multiplier_behaves_like_fixed() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 0,
        };
        assert_eq!(backoff.delay(4), Duration::from_millis(10));
    }

    #[test]
    fn policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.window, Duration::from_secs(30));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(5));
        assert_eq!(policy.backoff.delay(0), Duration::from_secs(1));
    }
}
