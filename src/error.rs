//! Top-level error type and wire error slugs

use thiserror::Error;

/// Stable error slugs surfaced to clients over HTTP and the WebSocket
/// protocol.
pub mod slug {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const TOKEN_AGENT_MISMATCH: &str = "token_agent_mismatch";
    pub const NOT_IDENTIFIED: &str = "not_identified";
    pub const INVALID_JSON: &str = "invalid_json";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown_message_type";
    pub const AGENT_OFFLINE: &str = "agent_offline";
    pub const CHANNEL_NOT_FOUND: &str = "channel_not_found";
    pub const INVALID_TRANSITION: &str = "invalid_transition";
    pub const NOT_FOUND: &str = "not_found";
    pub const TABLE_CORRUPTED: &str = "table_corrupted";
    pub const TASK_COMPLETE_FAILED: &str = "task_complete_failed";
    pub const TASK_FAIL_FAILED: &str = "task_fail_failed";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const MISSING_FIELD: &str = "missing_field";
}

/// Aggregate error for hub start-up and cross-component operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),

    #[error(transparent)]
    Channel(#[from] crate::channels::ChannelError),

    #[error(transparent)]
    Goal(#[from] crate::goals::GoalError),

    #[error(transparent)]
    Task(#[from] crate::tasks::TaskError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
