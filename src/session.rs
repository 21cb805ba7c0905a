//! Session resumption data: connection id, message id and groups.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::envelope::{Envelope, MessageId};

/// The data a server needs to resume a session after a reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_id: Option<String>,
    pub message_id: Option<MessageId>,
    pub groups: Vec<String>,
}

/// Mutable session state owned by a connection.
#[derive(Debug, Default)]
pub(crate) struct Session {
    pub(crate) connection_id: Option<String>,
    pub(crate) message_id: Option<MessageId>,
    pub(crate) groups: BTreeSet<String>,
}

impl Session {
    /// Forget the identity of the previous session. Groups are kept.
    pub(crate) fn reset(&mut self) {
        self.connection_id = None;
        self.message_id = None;
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            message_id: self.message_id,
            groups: self.groups.iter().cloned().collect(),
        }
    }

    /// Merge the metadata of a decoded frame.
    ///
    /// - a connection id is adopted only if none is set yet
    /// - group deltas are merged
    /// - the message id only ever moves forward
    ///
    /// Returns `false` when the frame carries a message id that is not newer
    /// than the stored one, i.e. its payloads were already delivered.
    pub(crate) fn apply(&mut self, envelope: &Envelope) -> bool {
        if let Some(id) = &envelope.connection_id {
            match &self.connection_id {
                None => {
                    debug!(connection_id = %id, "connection id assigned");
                    self.connection_id = Some(id.clone());
                }
                Some(current) if current == id => {}
                Some(current) => {
                    warn!(
                        current = %current,
                        received = %id,
                        "server tried to change the connection id, ignoring"
                    );
                }
            }
        }

        if let Some(delta) = &envelope.groups {
            delta.apply(&mut self.groups);
            debug!(groups = ?self.groups, "group membership updated");
        }

        match (envelope.message_id, self.message_id) {
            (Some(id), Some(current)) if id < current => {
                warn!(
                    current = %current,
                    received = %id,
                    "message id moved backwards, keeping the higher value"
                );
                false
            }
            (Some(id), Some(current)) if id == current => {
                debug!(message_id = %id, "message id already seen");
                false
            }
            (Some(id), _) => {
                self.message_id = Some(id);
                true
            }
            (None, _) => true,
        }
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
    use crate::envelope::GroupDelta;

    fn with_id(connection_id: Option<&str>, message_id: Option<u64>) -> Envelope {
        Envelope {
            connection_id: connection_id.map(String::from),
            message_id: message_id.map(MessageId::new),
            ..Default::default()
        }
    }

    #[test]
    fn first_connection_id_sticks() {
        let mut session = Session::default();
        session.apply(&with_id(Some("a"), None));
        session.apply(&with_id(Some("b"), None));
        assert_eq!(session.connection_id.as_deref(), Some("a"));
    }

    #[test]
    fn message_id_never_regresses() {
        let mut session = Session::default();
        assert!(session.apply(&with_id(None, Some(5))));
        assert!(!session.apply(&with_id(None, Some(3))));
        assert_eq!(session.message_id, Some(MessageId::new(5)));
        assert!(session.apply(&with_id(None, Some(8))));
        assert_eq!(session.message_id, Some(MessageId::new(8)));
        assert!(session.apply(&with_id(None, None)));
        assert_eq!(session.message_id, Some(MessageId::new(8)));
    }

    #[test]
    fn repeated_message_id_is_not_new() {
        let mut session = Session::default();
        assert!(session.apply(&with_id(Some("c"), Some(1))));
        assert!(!session.apply(&with_id(None, Some(1))));
        assert_eq!(session.message_id, Some(MessageId::new(1)));
    }

    #[test]
    fn groups_merge_and_snapshot_sorted() {
        let mut session = Session::default();
        session.groups.insert("z".into());
        session.apply(&Envelope {
            groups: Some(GroupDelta {
                added: vec!["b".into(), "a".into()],
                removed: vec![],
            }),
            ..Default::default()
        });
        assert_eq!(session.snapshot().groups, vec!["a", "b", "z"]);
    }

    #[test]
    fn reset_keeps_groups() {
        let mut session = Session::default();
        session.groups.insert("g".into());
        session.apply(&with_id(Some("c"), Some(1)));
        session.reset();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.connection_id, None);
        assert_eq!(snapshot.message_id, None);
        assert_eq!(snapshot.groups, vec!["g"]);
    }
}
