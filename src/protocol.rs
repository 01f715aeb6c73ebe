//! WebSocket wire protocol
//!
//! UTF-8 JSON frames, dispatched on the `type` field. The identify frame
//! must come first on every connection; everything else is rejected with
//! `not_identified` until it does. Unknown types produce an
//! `unknown_message_type` error frame, malformed JSON an `invalid_json` one;
//! neither disconnects the session.

use crate::channels::{ChannelEntry, ChannelInfo};
use crate::dispatch::{Endpoint, RouteDecision};
use crate::message::{Message, MessageKind};
use crate::presence::PresenceEntry;
use serde::{Deserialize, Serialize};

/// Frames the client sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Mandatory first frame.
    Identify {
        agent_id: String,
        token: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Send a message; the hub injects `from`.
    Message {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        kind: Option<MessageKind>,
        payload: serde_json::Value,
        #[serde(default)]
        reply_to: Option<String>,
    },
    Status {
        status: String,
    },
    Ping,
    ListAgents,
    ListChannels,
    ChannelSubscribe {
        channel: String,
    },
    ChannelUnsubscribe {
        channel: String,
    },
    ChannelPublish {
        channel: String,
        payload: serde_json::Value,
        #[serde(default)]
        kind: Option<MessageKind>,
        #[serde(default)]
        reply_to: Option<String>,
    },
    ChannelHistory {
        channel: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        since: Option<u64>,
    },
    GetThread {
        message_id: String,
    },
    /// Worker pull: ask for the next assignable task.
    TaskRequest {
        #[serde(default)]
        capabilities: Vec<String>,
    },
    TaskAccepted {
        task_id: String,
        generation: u64,
    },
    TaskProgress {
        task_id: String,
    },
    TaskComplete {
        task_id: String,
        generation: u64,
        #[serde(default)]
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: String,
        generation: u64,
        #[serde(default)]
        error: String,
    },
    /// Reconnect probe: does the worker still own this task?
    TaskRecovering {
        task_id: String,
    },
    /// Sidecars report nearby inference endpoints they can see.
    EndpointReport {
        endpoint: Endpoint,
    },
}

/// Frames the hub pushes to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Identified {
        agent_id: String,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    Pong,
    MessageSent {
        id: String,
        result: String,
    },
    Message {
        message: Message,
    },
    AgentJoined {
        agent_id: String,
        name: String,
    },
    AgentLeft {
        agent_id: String,
    },
    StatusChanged {
        agent_id: String,
        status: String,
    },
    Agents {
        agents: Vec<PresenceEntry>,
    },
    Channels {
        channels: Vec<ChannelInfo>,
    },
    ChannelMessage {
        channel: String,
        seq: u64,
        message: Message,
    },
    ChannelSubscribed {
        channel: String,
        agent_id: String,
    },
    ChannelHistory {
        channel: String,
        entries: Vec<ChannelEntry>,
    },
    Thread {
        messages: Vec<Message>,
    },
    /// Hub-initiated assignment push. The carried generation fences every
    /// later lifecycle frame for this assignment.
    TaskAssign {
        task_id: String,
        description: String,
        metadata: serde_json::Value,
        priority: u8,
        generation: u64,
        decision: RouteDecision,
    },
    /// Nothing assignable right now.
    QueueEmpty,
    /// Ack for worker lifecycle frames, carrying the resulting status.
    TaskAck {
        task_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Answer to a recovery probe.
    TaskRecovery {
        task_id: String,
        /// `continue` or `reassign`.
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl ServerFrame {
    /// Error frame helper.
    #[must_use]
    pub fn error(slug: &str) -> Self {
        Self::Error {
            error: slug.to_string(),
            retry_after_ms: None,
        }
    }

    /// Rate-limit error frame with the back-off hint.
    #[must_use]
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::Error {
            error: crate::error::slug::RATE_LIMITED.to_string(),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}
