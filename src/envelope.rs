//! Envelope codec for inbound frames.
//!
//! Every frame a transport yields is a JSON object carrying zero or more
//! application payloads plus session metadata:
//!
//! ```json
//! {
//!   "ConnectionId": "c-17",
//!   "MessageId": "42",
//!   "Messages": ["hello", {"x": 1}],
//!   "Groups": { "Added": ["lobby"], "Removed": [] },
//!   "Disconnect": false
//! }
//! ```
//!
//! All fields are optional. An empty frame is a keep-alive.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{ConnectionError, Result};

/// Position of the last message processed by the client.
///
/// Sent back to the server on reconnect so delivery resumes after it. Accepts
/// either a JSON number or a numeric string on the wire and always serializes
/// as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(u64),
            Text(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Number(n) => Ok(Self(n)),
            Wire::Text(s) => s.parse().map_err(|e| {
                serde::de::Error::custom(format!("invalid message id {s:?}: {e}"))
            }),
        }
    }
}

/// Changes to the set of groups the session belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

impl GroupDelta {
    /// Apply the delta to `groups`. Removals are applied before additions.
    pub fn apply(&self, groups: &mut BTreeSet<String>) {
        for group in &self.removed {
            groups.remove(group);
        }
        groups.extend(self.added.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    /// Server-assigned connection id. Only meaningful on the handshake frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Id of the last message contained in this frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Application payloads, in server send order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    /// Group membership changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<GroupDelta>,
    /// The server asks the client to stop.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disconnect: bool,
}

impl Envelope {
    /// Payloads as the text delivered to `Received` subscribers.
    ///
    /// JSON strings are delivered unquoted; every other value as compact JSON.
    pub fn payloads(&self) -> impl Iterator<Item = String> + '_ {
        self.messages.iter().map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    /// Serialize to a frame. Mainly useful for servers and test doubles.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode one raw frame.
///
/// # Errors
///
/// Returns [`ConnectionError::Decode`] if the frame is not a JSON object of
/// the envelope shape.
pub fn decode(raw: &str) -> Result<Envelope> {
    if raw.trim().is_empty() {
        return Ok(Envelope::default());
    }
    serde_json::from_str(raw).map_err(|e| ConnectionError::Decode(e.to_string()))
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
    use serde_json::json;

    #[test]
    fn decodes_full_frame() {
        let raw = r#"{
            "ConnectionId": "c-1",
            "MessageId": "7",
            "Messages": ["a", {"b": 2}, 3],
            "Groups": {"Added": ["x"], "Removed": ["y"]}
        }"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.connection_id.as_deref(), Some("c-1"));
        assert_eq!(env.message_id, Some(MessageId::new(7)));
        assert_eq!(
            env.payloads().collect::<Vec<_>>(),
            vec!["a".to_string(), r#"{"b":2}"#.to_string(), "3".to_string()]
        );
        let groups = env.groups.unwrap();
        assert_eq!(groups.added, vec!["x"]);
        assert_eq!(groups.removed, vec!["y"]);
        assert!(!env.disconnect);
    }

    #[test]
    fn numeric_message_id_is_accepted() {
        let env = decode(r#"{"MessageId": 12}"#).unwrap();
        assert_eq!(env.message_id, Some(MessageId::new(12)));
    }

    #[test]
    fn empty_frame_is_keep_alive() {
        assert_eq!(decode("").unwrap(), Envelope::default());
        assert_eq!(decode("  \n").unwrap(), Envelope::default());
        assert_eq!(decode("{}").unwrap(), Envelope::default());
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        for raw in [
            "not json",
            "[1, 2]",
            r#"{"Messages": "nope"}"#,
            r#"{"MessageId": "abc"}"#,
            r#"{"MessageId": -1}"#,
        ] {
            let err = decode(raw).unwrap_err();
            assert!(matches!(err, ConnectionError::Decode(_)), "{raw}: {err:?}");
        }
    }

    #[test]
    fn message_id_serializes_as_string() {
        let env = Envelope {
            message_id: Some(MessageId::new(99)),
            ..Default::default()
        };
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"MessageId": "99"}));
    }

    #[test]
    fn encode_omits_defaults() {
        assert_eq!(Envelope::default().encode().unwrap(), "{}");
    }

    #[test]
    fn group_delta_removes_before_adding() {
        let mut groups: BTreeSet<String> = ["a", "b"].into_iter().map(String::from).collect();
        GroupDelta {
            added: vec!["b".into(), "c".into()],
            removed: vec!["a".into(), "b".into()],
        }
        .apply(&mut groups);
        assert_eq!(groups.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn message_ids_order_numerically() {
        assert!(MessageId::new(10) > MessageId::new(9));
        assert_eq!("  42 ".parse::<MessageId>().unwrap(), MessageId::new(42));
    }
}
