//! In-process topic bus
//!
//! A thin pub/sub layer: one `tokio::sync::broadcast` channel per topic.
//! Publish never blocks; subscribers that fall behind lose the oldest events
//! (the channel's lag policy), which is the intended drop-as-policy behavior
//! for presence and fan-out traffic.

use crate::domain_types::{AgentId, ChannelName, GoalId, TaskId};
use crate::goals::GoalStatus;
use crate::message::Message;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Well-known topic names.
pub mod topic {
    /// Broadcast message fan-out.
    pub const MESSAGES: &str = "messages";
    /// Agent joins/leaves and status changes.
    pub const PRESENCE: &str = "presence";
    /// Goal lifecycle events.
    pub const GOALS: &str = "goals";
    /// Task lifecycle events.
    pub const TASKS: &str = "tasks";

    /// Per-channel fan-out topic.
    #[must_use]
    pub fn channel(name: &crate::domain_types::ChannelName) -> String {
        format!("channel:{name}")
    }
}

/// Task lifecycle event kinds published on the `tasks` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEventKind {
    Queued,
    Assigned { agent_id: AgentId },
    Progress,
    Completed,
    Retry,
    DeadLetter,
    Reclaimed,
}

/// Events flowing over the bus.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A broadcast message for every connected agent.
    Broadcast(Message),
    AgentJoined {
        agent_id: AgentId,
        name: String,
    },
    AgentLeft {
        agent_id: AgentId,
    },
    StatusChanged {
        agent_id: AgentId,
        status: String,
    },
    ChannelMessage {
        channel: ChannelName,
        seq: u64,
        message: Message,
    },
    ChannelSubscribed {
        channel: ChannelName,
        agent_id: AgentId,
    },
    Goal {
        goal_id: GoalId,
        status: GoalStatus,
    },
    Task {
        task_id: TaskId,
        kind: TaskEventKind,
    },
}

const TOPIC_CAPACITY: usize = 256;

/// String-keyed topic bus.
#[derive(Default)]
pub struct TopicBus {
    topics: DashMap<String, broadcast::Sender<HubEvent>>,
}

impl TopicBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<HubEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Subscribes to a topic, creating it on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<HubEvent> {
        self.sender(topic).subscribe()
    }

    /// Publishes an event, returning how many subscribers received it.
    /// Publishing to a topic with no subscribers is not an error.
    pub fn publish(&self, topic: &str, event: HubEvent) -> usize {
        self.sender(topic).send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = TopicBus::new();
        let mut rx = bus.subscribe(topic::PRESENCE);
        let delivered = bus.publish(
            topic::PRESENCE,
            HubEvent::AgentJoined {
                agent_id: agent("w1"),
                name: "worker one".into(),
            },
        );
        assert_eq!(delivered, 1);
        match rx.recv().await.unwrap() {
            HubEvent::AgentJoined { agent_id, .. } => assert_eq!(agent_id.as_str(), "w1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = TopicBus::new();
        let delivered = bus.publish(
            "channel:dev",
            HubEvent::AgentLeft {
                agent_id: agent("w1"),
            },
        );
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = TopicBus::new();
        let mut a = bus.subscribe("channel:a");
        let _b = bus.subscribe("channel:b");
        bus.publish(
            "channel:b",
            HubEvent::AgentLeft {
                agent_id: agent("w2"),
            },
        );
        assert!(a.try_recv().is_err());
    }
}
