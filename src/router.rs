//! Message router
//!
//! Maps a fresh message to broadcast fan-out, direct push, or an offline
//! result. Every routed message is indexed into the thread store first, so
//! reply chains stay walkable regardless of delivery outcome. The router does
//! not enqueue to the mailbox itself; callers that want offline fallback (the
//! session handler does) perform it on [`RouterError::AgentOffline`].

use crate::bus::{HubEvent, TopicBus, topic};
use crate::domain_types::AgentId;
use crate::message::Message;
use crate::presence::PresenceRegistry;
use crate::protocol::ServerFrame;
use crate::storage::StoreError;
use crate::threads::ThreadIndex;
use std::sync::Arc;
use tracing::debug;

/// Where a routed message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Published on the `messages` topic for every connected agent.
    Broadcast,
    /// Pushed to the recipient's live session.
    Delivered,
}

impl RouteOutcome {
    /// Wire slug for acks.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Delivered => "delivered",
        }
    }
}

/// Routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("agent is offline: {0}")]
    AgentOffline(AgentId),

    #[error("recipient is not a valid agent id")]
    InvalidRecipient,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stateless-ish router over presence, bus and thread index.
pub struct MessageRouter {
    presence: Arc<PresenceRegistry>,
    bus: Arc<TopicBus>,
    threads: Arc<ThreadIndex>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        presence: Arc<PresenceRegistry>,
        bus: Arc<TopicBus>,
        threads: Arc<ThreadIndex>,
    ) -> Self {
        Self {
            presence,
            bus,
            threads,
        }
    }

    /// Routes one message.
    ///
    /// # Errors
    ///
    /// [`RouterError::AgentOffline`] when the recipient names an agent with
    /// no live session; storage errors from thread indexing.
    pub async fn route(&self, message: &Message) -> Result<RouteOutcome, RouterError> {
        self.threads.index(message).await?;

        if message.is_broadcast() {
            let receivers = self
                .bus
                .publish(topic::MESSAGES, HubEvent::Broadcast(message.clone()));
            debug!(message_id = %message.id, receivers, "message broadcast");
            return Ok(RouteOutcome::Broadcast);
        }

        // `is_broadcast` leaves only the Some(recipient) shape here.
        let Some(recipient) = message.to.as_deref() else {
            return Ok(RouteOutcome::Broadcast);
        };
        let Ok(agent_id) = AgentId::try_new(recipient) else {
            return Err(RouterError::InvalidRecipient);
        };
        match self.presence.send(
            &agent_id,
            ServerFrame::Message {
                message: message.clone(),
            },
        ) {
            Ok(()) => {
                debug!(message_id = %message.id, to = %agent_id, "message delivered");
                Ok(RouteOutcome::Delivered)
            }
            Err(_) => Err(RouterError::AgentOffline(agent_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::presence::AgentMeta;
    use crate::storage::KvTable;
    use tokio::sync::mpsc;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    async fn router(dir: &std::path::Path) -> (MessageRouter, Arc<PresenceRegistry>, Arc<TopicBus>) {
        let bus = Arc::new(TopicBus::new());
        let presence = Arc::new(PresenceRegistry::new(bus.clone()));
        let threads = Arc::new(ThreadIndex::new(Arc::new(
            KvTable::open(dir, "threads", None).await.unwrap(),
        )));
        (
            MessageRouter::new(presence.clone(), bus.clone(), threads),
            presence,
            bus,
        )
    }

    fn msg(from: &str, to: Option<&str>) -> Message {
        Message::build(
            agent(from),
            to.map(str::to_string),
            MessageKind::Chat,
            serde_json::json!({ "text": "hi" }),
            None,
        )
    }

    #[tokio::test]
    async fn direct_message_reaches_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let (router, presence, _bus) = router(dir.path()).await;
        let (tx, mut rx) = mpsc::channel(8);
        presence.register(agent("b"), AgentMeta::default(), tx);

        let outcome = router.route(&msg("a", Some("b"))).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered);
        match rx.recv().await.unwrap() {
            ServerFrame::Message { message } => assert_eq!(message.from, agent("a")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_goes_to_messages_topic() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _presence, bus) = router(dir.path()).await;
        let mut rx = bus.subscribe(topic::MESSAGES);
        assert_eq!(
            router.route(&msg("a", None)).await.unwrap(),
            RouteOutcome::Broadcast
        );
        assert_eq!(
            router.route(&msg("a", Some("broadcast"))).await.unwrap(),
            RouteOutcome::Broadcast
        );
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::Broadcast(_)));
    }

    #[tokio::test]
    async fn offline_recipient_is_an_error_but_still_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _presence, _bus) = router(dir.path()).await;
        let m = msg("a", Some("ghost"));
        let err = router.route(&m).await.unwrap_err();
        assert!(matches!(err, RouterError::AgentOffline(_)));
    }
}
