//! Named channels with durable history
//!
//! A channel is a multi-subscriber topic whose recent history survives
//! restarts. Names are normalized (trimmed, lowercased) by [`ChannelName`];
//! the normalized form is the persistent key. Every publication gets the
//! channel's next monotonic seq and fans out over the `channel:<name>` bus
//! topic. Subscribers do not receive echoes of their own publications; the
//! session layer enforces that on delivery.

use crate::bus::{HubEvent, TopicBus, topic};
use crate::domain_types::{AgentId, ChannelName, now_ms};
use crate::message::Message;
use crate::storage::{KvTable, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Retained history depth per channel.
pub const HISTORY_MAX: usize = 100;

/// Channel operation errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not found: {0}")]
    NotFound(ChannelName),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One history slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub seq: u64,
    pub message: Message,
}

/// Persistent channel state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelRecord {
    name: ChannelName,
    subscribers: BTreeSet<AgentId>,
    next_seq: u64,
    history: Vec<ChannelEntry>,
    created_at: u64,
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: ChannelName,
    pub subscribers: usize,
    pub created_at: u64,
}

/// History query options.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub since: Option<u64>,
}

/// Channel store.
pub struct Channels {
    table: Arc<KvTable>,
    bus: Arc<TopicBus>,
    // Serializes read-modify-write cycles on channel records.
    write: Mutex<()>,
}

impl Channels {
    #[must_use]
    pub fn new(table: Arc<KvTable>, bus: Arc<TopicBus>) -> Self {
        Self {
            table,
            bus,
            write: Mutex::new(()),
        }
    }

    async fn load(&self, name: &ChannelName) -> Result<Option<ChannelRecord>, StoreError> {
        self.table.get(name.as_str()).await
    }

    /// Adds `agent` to the channel, creating the channel on first subscribe.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn subscribe(&self, name: &ChannelName, agent: &AgentId) -> Result<(), ChannelError> {
        let _guard = self.write.lock().await;
        let mut record = self.load(name).await?.unwrap_or_else(|| ChannelRecord {
            name: name.clone(),
            subscribers: BTreeSet::new(),
            next_seq: 1,
            history: Vec::new(),
            created_at: now_ms(),
        });
        let added = record.subscribers.insert(agent.clone());
        self.table.put(name.as_str(), &record).await?;
        if added {
            debug!(channel = %name, agent_id = %agent, "channel subscription added");
            self.bus.publish(
                &topic::channel(name),
                HubEvent::ChannelSubscribed {
                    channel: name.clone(),
                    agent_id: agent.clone(),
                },
            );
        }
        Ok(())
    }

    /// Removes `agent` from the channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] for unknown channels.
    pub async fn unsubscribe(
        &self,
        name: &ChannelName,
        agent: &AgentId,
    ) -> Result<(), ChannelError> {
        let _guard = self.write.lock().await;
        let mut record = self
            .load(name)
            .await?
            .ok_or_else(|| ChannelError::NotFound(name.clone()))?;
        record.subscribers.remove(agent);
        self.table.put(name.as_str(), &record).await?;
        Ok(())
    }

    /// Appends a message to the channel and fans it out, returning the seq.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] for unknown channels.
    pub async fn publish(
        &self,
        name: &ChannelName,
        message: Message,
    ) -> Result<u64, ChannelError> {
        let seq = {
            let _guard = self.write.lock().await;
            let mut record = self
                .load(name)
                .await?
                .ok_or_else(|| ChannelError::NotFound(name.clone()))?;
            let seq = record.next_seq;
            record.next_seq += 1;
            record.history.push(ChannelEntry {
                seq,
                message: message.clone(),
            });
            if record.history.len() > HISTORY_MAX {
                let excess = record.history.len() - HISTORY_MAX;
                record.history.drain(..excess);
            }
            self.table.put(name.as_str(), &record).await?;
            seq
        };
        self.bus.publish(
            &topic::channel(name),
            HubEvent::ChannelMessage {
                channel: name.clone(),
                seq,
                message,
            },
        );
        Ok(seq)
    }

    /// Recent history, oldest first. `since` filters to `seq > since`;
    /// `limit` keeps only the newest N of the filtered set.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotFound`] for unknown channels.
    pub async fn history(
        &self,
        name: &ChannelName,
        query: HistoryQuery,
    ) -> Result<Vec<ChannelEntry>, ChannelError> {
        let record = self
            .load(name)
            .await?
            .ok_or_else(|| ChannelError::NotFound(name.clone()))?;
        let since = query.since.unwrap_or(0);
        let mut entries: Vec<ChannelEntry> = record
            .history
            .into_iter()
            .filter(|entry| entry.seq > since)
            .collect();
        if let Some(limit) = query.limit {
            if entries.len() > limit {
                let excess = entries.len() - limit;
                entries.drain(..excess);
            }
        }
        Ok(entries)
    }

    /// All channels with subscriber counts.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list(&self) -> Result<Vec<ChannelInfo>, ChannelError> {
        let out = self
            .table
            .fold::<ChannelRecord, Vec<ChannelInfo>, _>(Vec::new(), |mut acc, _k, record| {
                acc.push(ChannelInfo {
                    name: record.name,
                    subscribers: record.subscribers.len(),
                    created_at: record.created_at,
                });
                acc
            })
            .await?;
        Ok(out)
    }

    /// Channels the agent is a member of; used to re-subscribe its session
    /// topics at identify time.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn channels_of(&self, agent: &AgentId) -> Result<Vec<ChannelName>, ChannelError> {
        let out = self
            .table
            .fold::<ChannelRecord, Vec<ChannelName>, _>(Vec::new(), |mut acc, _k, record| {
                if record.subscribers.contains(agent) {
                    acc.push(record.name);
                }
                acc
            })
            .await?;
        Ok(out)
    }

    /// Whether `agent` subscribes to `name`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn is_member(&self, name: &ChannelName, agent: &AgentId) -> Result<bool, ChannelError> {
        Ok(self
            .load(name)
            .await?
            .is_some_and(|record| record.subscribers.contains(agent)))
    }
}
