//! Presence registry
//!
//! Tracks currently-connected agents and the handle used to push frames to
//! their sessions. Joins, leaves and status changes are published on the
//! `presence` topic; broadcast fan-out rides the `messages` topic. Lookup is
//! a concurrent map so the read-hot paths (routing, reaping) never contend
//! with each other.

use crate::bus::{HubEvent, TopicBus, topic};
use crate::domain_types::{AgentId, now_ms};
use crate::protocol::ServerFrame;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Depth of each session's outbound frame queue. Pushes beyond this are
/// dropped (best-effort, bounded).
pub const SESSION_QUEUE_DEPTH: usize = 64;

/// Handle for pushing frames into a connected session.
pub type SessionHandle = mpsc::Sender<ServerFrame>;

/// Metadata supplied at identify time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMeta {
    pub name: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A currently-connected agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub agent_id: AgentId,
    pub name: String,
    pub status: String,
    pub capabilities: Vec<String>,
    pub connected_at: u64,
    pub last_seen_ms: u64,
}

struct Registered {
    entry: PresenceEntry,
    handle: SessionHandle,
}

/// Push failure: the recipient has no live session.
#[derive(Debug, thiserror::Error)]
#[error("agent is offline")]
pub struct Offline;

/// Registry of live sessions.
pub struct PresenceRegistry {
    agents: DashMap<AgentId, Registered>,
    bus: Arc<TopicBus>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(bus: Arc<TopicBus>) -> Self {
        Self {
            agents: DashMap::new(),
            bus,
        }
    }

    /// Registers (or re-registers) an agent. Idempotent: a second identify
    /// for a live agent replaces the session handle and metadata. Returns
    /// whether the agent was newly joined.
    pub fn register(&self, agent_id: AgentId, meta: AgentMeta, handle: SessionHandle) -> bool {
        let now = now_ms();
        let name = meta.name.unwrap_or_else(|| agent_id.to_string());
        let was_new = match self.agents.entry(agent_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let registered = slot.get_mut();
                registered.entry.name = name.clone();
                if let Some(status) = meta.status {
                    registered.entry.status = status;
                }
                registered.entry.capabilities = meta.capabilities;
                registered.entry.last_seen_ms = now;
                registered.handle = handle;
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Registered {
                    entry: PresenceEntry {
                        agent_id: agent_id.clone(),
                        name: name.clone(),
                        status: meta.status.unwrap_or_else(|| "online".to_string()),
                        capabilities: meta.capabilities,
                        connected_at: now,
                        last_seen_ms: now,
                    },
                    handle,
                });
                true
            }
        };
        if was_new {
            info!(agent_id = %agent_id, "agent joined");
            self.bus
                .publish(topic::PRESENCE, HubEvent::AgentJoined { agent_id, name });
        } else {
            debug!(agent_id = %agent_id, "agent re-identified, metadata updated");
        }
        was_new
    }

    /// Removes an agent and announces the leave.
    pub fn unregister(&self, agent_id: &AgentId) {
        if self.agents.remove(agent_id).is_some() {
            info!(agent_id = %agent_id, "agent left");
            self.bus.publish(
                topic::PRESENCE,
                HubEvent::AgentLeft {
                    agent_id: agent_id.clone(),
                },
            );
        }
    }

    /// Removes an agent only when the registered handle is the given one.
    /// A replaced session calling this on disconnect leaves the replacement
    /// registration intact.
    pub fn unregister_handle(&self, agent_id: &AgentId, handle: &SessionHandle) {
        let removed = self
            .agents
            .remove_if(agent_id, |_, registered| {
                registered.handle.same_channel(handle)
            })
            .is_some();
        if removed {
            info!(agent_id = %agent_id, "agent left");
            self.bus.publish(
                topic::PRESENCE,
                HubEvent::AgentLeft {
                    agent_id: agent_id.clone(),
                },
            );
        }
    }

    /// Refreshes `last_seen_ms`.
    pub fn touch(&self, agent_id: &AgentId) {
        if let Some(mut registered) = self.agents.get_mut(agent_id) {
            registered.entry.last_seen_ms = now_ms();
        }
    }

    /// Updates the agent's advertised status and announces the change.
    pub fn update_status(&self, agent_id: &AgentId, status: String) {
        let updated = match self.agents.get_mut(agent_id) {
            Some(mut registered) => {
                registered.entry.status = status.clone();
                registered.entry.last_seen_ms = now_ms();
                true
            }
            None => false,
        };
        if updated {
            self.bus.publish(
                topic::PRESENCE,
                HubEvent::StatusChanged {
                    agent_id: agent_id.clone(),
                    status,
                },
            );
        }
    }

    /// Snapshot of all present agents.
    pub fn list(&self) -> Vec<PresenceEntry> {
        let mut out: Vec<PresenceEntry> = self
            .agents
            .iter()
            .map(|item| item.value().entry.clone())
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// The session handle for a connected agent, if any.
    pub fn lookup(&self, agent_id: &AgentId) -> Option<SessionHandle> {
        self.agents.get(agent_id).map(|r| r.handle.clone())
    }

    /// Whether the agent currently has a session.
    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Number of connected agents.
    pub fn count(&self) -> usize {
        self.agents.len()
    }

    /// Pushes a frame to a connected agent's session. Best-effort: a full
    /// outbound queue drops the frame with a warning rather than blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Offline`] when the agent has no live session.
    pub fn send(&self, agent_id: &AgentId, frame: ServerFrame) -> Result<(), Offline> {
        let handle = self.lookup(agent_id).ok_or(Offline)?;
        match handle.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(agent_id = %agent_id, "session outbound queue full, frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The session is gone but has not unregistered yet.
                Err(Offline)
            }
        }
    }

    /// Agents whose `last_seen_ms` is older than `idle_ms`.
    pub fn stale(&self, now: u64, idle_ms: u64) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|item| now.saturating_sub(item.value().entry.last_seen_ms) > idle_ms)
            .map(|item| item.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    fn registry() -> (PresenceRegistry, Arc<TopicBus>) {
        let bus = Arc::new(TopicBus::new());
        (PresenceRegistry::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn register_announces_join_once() {
        let (registry, bus) = registry();
        let mut rx = bus.subscribe(topic::PRESENCE);
        let (tx, _keep) = mpsc::channel(4);

        assert!(registry.register(agent("w1"), AgentMeta::default(), tx.clone()));
        assert!(!registry.register(agent("w1"), AgentMeta::default(), tx));
        assert!(matches!(
            rx.recv().await.unwrap(),
            HubEvent::AgentJoined { .. }
        ));
        assert!(rx.try_recv().is_err(), "re-identify must not re-announce");
    }

    #[tokio::test]
    async fn send_reaches_live_session() {
        let (registry, _bus) = registry();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(agent("w1"), AgentMeta::default(), tx);

        registry.send(&agent("w1"), ServerFrame::Pong).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), ServerFrame::Pong));
        assert!(registry.send(&agent("nobody"), ServerFrame::Pong).is_err());
    }

    #[tokio::test]
    async fn replaced_session_cannot_unregister_successor() {
        let (registry, _bus) = registry();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        registry.register(agent("w1"), AgentMeta::default(), old_tx.clone());
        registry.register(agent("w1"), AgentMeta::default(), new_tx);

        registry.unregister_handle(&agent("w1"), &old_tx);
        assert!(registry.contains(&agent("w1")));
        registry.send(&agent("w1"), ServerFrame::Pong).unwrap();
        assert!(matches!(new_rx.recv().await.unwrap(), ServerFrame::Pong));
    }

    #[tokio::test]
    async fn stale_finds_idle_agents() {
        let (registry, _bus) = registry();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(agent("w1"), AgentMeta::default(), tx);
        let now = now_ms();
        assert!(registry.stale(now, 60_000).is_empty());
        assert_eq!(registry.stale(now + 120_000, 60_000).len(), 1);
    }

    #[tokio::test]
    async fn status_update_publishes_change() {
        let (registry, bus) = registry();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(agent("w1"), AgentMeta::default(), tx);
        let mut events = bus.subscribe(topic::PRESENCE);
        registry.update_status(&agent("w1"), "busy".into());
        match events.recv().await.unwrap() {
            HubEvent::StatusChanged { status, .. } => assert_eq!(status, "busy"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
