//! Connection state and the compare-and-swap transition primitive.
//!
//! [`StateMachine`] is the only place a [`ConnectionState`] is ever written.
//! Every write is a compare-and-swap against an expected prior state, so
//! concurrent `start`, `stop`, transport-loss and reconnect completions can
//! race freely: exactly one of them observes the state it expected.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

/// Lifecycle state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not started, or stopped. Initial and terminal state.
    #[default]
    Disconnected,
    /// Transport negotiation is in progress.
    Connecting,
    /// A transport is established and frames are flowing.
    Connected,
    /// The transport was lost and is being re-established.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` if `self → to` is an edge of the connection state graph.
    ///
    /// Any state other than `Disconnected` may move to `Disconnected`, since
    /// `stop` must always reach the terminal state.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Connecting | Connected | Reconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// A successfully applied state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub old_state: ConnectionState,
    /// State after the transition.
    pub new_state: ConnectionState,
}

impl StateChange {
    pub fn new(old_state: ConnectionState, new_state: ConnectionState) -> Self {
        Self {
            old_state,
            new_state,
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.old_state, self.new_state)
    }
}

/// Guarded [`ConnectionState`] with a compare-and-swap transition primitive.
///
/// There is no setter. [`transition_with`](Self::transition_with) runs its
/// callback while the guard is held, so notifications enqueued from it are
/// in the same order as the transitions that produced them.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: Mutex<ConnectionState>,
}

impl StateMachine {
    /// Create a machine in the `Disconnected` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn current(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `expected → new` if the current state equals `expected`.
    ///
    /// Returns `false`, without side effects, if the current state differs or
    /// the edge is not part of the state graph.
    pub fn try_transition(&self, expected: ConnectionState, new: ConnectionState) -> bool {
        self.transition_with(expected, new, |_| {})
    }

    /// Like [`try_transition`](Self::try_transition), invoking `applied` with
    /// the resulting [`StateChange`] before the guard is released.
    ///
    /// `applied` must not block or re-enter the machine.
    pub fn transition_with<F>(
        &self,
        expected: ConnectionState,
        new: ConnectionState,
        applied: F,
    ) -> bool
    where
        F: FnOnce(StateChange),
    {
        if !expected.can_transition_to(new) {
            warn!(%expected, %new, "rejected transition outside the state graph");
            return false;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            debug!(
                current = %*state,
                %expected,
                %new,
                "transition lost race, state already changed"
            );
            return false;
        }

        *state = new;
        applied(StateChange::new(expected, new));
        debug!(from = %expected, to = %new, "state changed");
        true
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use ConnectionState::*;

    #[test]
    fn starts_disconnected() {
        assert_eq!(StateMachine::new().current(), Disconnected);
    }

    #[test]
    fn valid_edges() {
        let valid = [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connecting, Disconnected),
            (Connected, Reconnecting),
            (Reconnecting, Connected),
            (Reconnecting, Disconnected),
            (Connected, Disconnected),
        ];
        let all = [Disconnected, Connecting, Connected, Reconnecting];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    valid.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn transition_applies_only_from_expected_state() {
        let machine = StateMachine::new();
        assert!(!machine.try_transition(Connecting, Connected));
        assert_eq!(machine.current(), Disconnected);

        assert!(machine.try_transition(Disconnected, Connecting));
        assert!(machine.try_transition(Connecting, Connected));
        assert_eq!(machine.current(), Connected);
    }

    #[test]
    fn invalid_edge_is_rejected_without_side_effects() {
        let machine = StateMachine::new();
        let mut called = false;
        assert!(!machine.transition_with(Disconnected, Connected, |_| called = true));
        assert!(!called);
        assert_eq!(machine.current(), Disconnected);
    }

    #[test]
    fn callback_sees_the_applied_change() {
        let machine = StateMachine::new();
        let mut seen = None;
        assert!(machine.transition_with(Disconnected, Connecting, |c| seen = Some(c)));
        assert_eq!(seen, Some(StateChange::new(Disconnected, Connecting)));
    }

    #[test]
    fn concurrent_transitions_have_one_winner() {
        let machine = Arc::new(StateMachine::new());
        assert!(machine.try_transition(Disconnected, Connecting));
        assert!(machine.try_transition(Connecting, Connected));

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let machine = Arc::clone(&machine);
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    let target = if i % 2 == 0 { Reconnecting } else { Disconnected };
                    barrier.wait();
                    if machine.try_transition(Connected, target) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        Some(target)
                    } else {
                        None
                    }
                })
            })
            .collect();

        let won: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(won.len(), 1);
        assert_eq!(machine.current(), won[0]);
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            StateChange::new(Reconnecting, Connected).to_string(),
            "reconnecting -> connected"
        );
    }
}
