//! Strongly-typed domain values for the hub
//!
//! Identifier types are validated/sanitized at the boundary so the rest of
//! the crate can trust them. Wire-facing structs keep `String` fields where
//! the value is inherently polymorphic (e.g. a message `to` that may name an
//! agent, a channel, or the broadcast sink).

use nutype::nutype;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier of a worker agent. Non-empty, surrounding whitespace
/// stripped.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

/// Channel names are normalized: trimmed and lowercased. The normalized form
/// is the persistent key, so `" Dev "` and `"dev"` address the same channel.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct ChannelName(String);

/// Globally-unique message identifier, 16 lowercase hex characters.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRef,
    Deref,
    From,
    Into
))]
pub struct MessageId(String);

impl MessageId {
    /// Creates a fresh random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(random_hex16())
    }
}

/// Goal identifier, `goal-` followed by 16 hex characters.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRef,
    Deref,
    From,
    Into
))]
pub struct GoalId(String);

impl GoalId {
    /// Creates a fresh random goal id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(format!("goal-{}", random_hex16()))
    }
}

/// Task identifier, `task-` followed by 16 hex characters.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRef,
    Deref,
    From,
    Into
))]
pub struct TaskId(String);

impl TaskId {
    /// Creates a fresh random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(format!("task-{}", random_hex16()))
    }
}

/// Complexity class driving task routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Trivial,
    Standard,
    Complex,
    Unknown,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trivial => "trivial",
            Self::Standard => "standard",
            Self::Complex => "complex",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Priority 0 is urgent.
pub const PRIORITY_URGENT: u8 = 0;
/// Default priority assigned when a submitter does not specify one.
pub const PRIORITY_NORMAL: u8 = 2;
/// Lowest priority accepted by the backlog.
pub const PRIORITY_MAX: u8 = 3;

/// Clamps an optional wire priority to the valid range, defaulting to normal.
#[must_use]
pub fn clamp_priority(p: Option<u8>) -> u8 {
    p.unwrap_or(PRIORITY_NORMAL).min(PRIORITY_MAX)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn random_hex16() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_normalize() {
        let name = ChannelName::try_new("  Dev-Alerts ").unwrap();
        assert_eq!(name.as_str(), "dev-alerts");
    }

    #[test]
    fn empty_agent_id_rejected() {
        assert!(AgentId::try_new("   ").is_err());
    }

    #[test]
    fn message_ids_are_16_hex() {
        let id = MessageId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn goal_and_task_ids_carry_prefix() {
        assert!(GoalId::generate().as_str().starts_with("goal-"));
        assert!(TaskId::generate().as_str().starts_with("task-"));
    }

    #[test]
    fn priority_clamps() {
        assert_eq!(clamp_priority(None), 2);
        assert_eq!(clamp_priority(Some(9)), 3);
        assert_eq!(clamp_priority(Some(0)), 0);
    }
}
