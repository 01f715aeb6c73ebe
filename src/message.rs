//! The hub's message record
//!
//! A message is created once, gets its id and timestamp at creation, and is
//! never mutated afterwards. The session layer is the only place that sets
//! `from`, which is what makes sender identity trustworthy downstream.

use crate::domain_types::{AgentId, MessageId, now_ms};
use serde::{Deserialize, Serialize};

/// Reserved `to` value addressing every connected agent.
pub const BROADCAST: &str = "broadcast";

/// Message kind, carried verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Chat,
    Request,
    Response,
    Status,
    Ping,
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from: AgentId,
    /// Recipient: an agent id, a channel name, or `None`/`"broadcast"` for
    /// fan-out to everyone.
    pub to: Option<String>,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub timestamp_ms: u64,
}

impl Message {
    /// Builds a fresh message, assigning id and timestamp.
    #[must_use]
    pub fn build(
        from: AgentId,
        to: Option<String>,
        kind: MessageKind,
        payload: serde_json::Value,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            from,
            to,
            kind,
            payload,
            reply_to,
            timestamp_ms: now_ms(),
        }
    }

    /// True when the message addresses every connected agent.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        match &self.to {
            None => true,
            Some(t) => t == BROADCAST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    #[test]
    fn build_assigns_id_and_timestamp() {
        let m = Message::build(
            agent("a1"),
            Some("a2".into()),
            MessageKind::Chat,
            serde_json::json!({"text": "hi"}),
            None,
        );
        assert_eq!(m.id.as_str().len(), 16);
        assert!(m.timestamp_ms > 0);
        assert!(!m.is_broadcast());
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let m = Message::build(
            agent("sender"),
            None,
            MessageKind::Request,
            serde_json::json!({"op": "sum", "args": [1, 2]}),
            Some(MessageId::new("aabbccddeeff0011")),
        );
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
        assert!(back.is_broadcast());
    }
}
