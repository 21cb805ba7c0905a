//! Notifications emitted by a [`Connection`](crate::Connection).

use std::sync::Arc;

use crate::error::ConnectionError;
use crate::state::StateChange;

/// A notification delivered to connection subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// One application payload, in server send order.
    Received(String),
    /// A non-fatal or fatal error. Carries no ordering guarantee relative to
    /// `Received`.
    Error(Arc<ConnectionError>),
    /// The connection reached `Disconnected` for good. Always the last event
    /// of a session.
    Closed,
    /// The transport was re-established after a loss.
    Reconnected,
    /// A state transition was applied.
    StateChanged(StateChange),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Received(_) => EventKind::Received,
            ConnectionEvent::Error(_) => EventKind::Error,
            ConnectionEvent::Closed => EventKind::Closed,
            ConnectionEvent::Reconnected => EventKind::Reconnected,
            ConnectionEvent::StateChanged(_) => EventKind::StateChanged,
        }
    }

    pub(crate) fn error(err: ConnectionError) -> Self {
        ConnectionEvent::Error(Arc::new(err))
    }
}

/// Discriminant of [`ConnectionEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Received,
    Error,
    Closed,
    Reconnected,
    StateChanged,
}
