//! Durable per-agent mailbox
//!
//! Messages for offline recipients are stored under `(agent, seq)` keys and
//! consumed by HTTP polling with a monotonic cursor. The sequence counter is
//! hub-global and recovered at start-up by scanning for the maximum stored
//! seq. Per-agent depth is capped: the oldest entries are trimmed past
//! [`MAX_MAILBOX`]. Expired entries are evicted by the reaper through the
//! single [`Mailbox::evict_expired`] entrypoint.

use crate::domain_types::{AgentId, now_ms};
use crate::message::Message;
use crate::storage::kv::{KEY_SEP, seq_segment};
use crate::storage::{KvTable, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Maximum queued entries per agent; the oldest beyond this are trimmed.
pub const MAX_MAILBOX: usize = 100;

/// One stored mailbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxEntry {
    pub seq: u64,
    pub message: Message,
    pub stored_at: u64,
}

/// Result of a poll: entries after the cursor plus the new cursor value.
#[derive(Debug, Clone, Serialize)]
pub struct PollBatch {
    pub messages: Vec<MailboxEntry>,
    pub last_seq: u64,
}

/// Durable offline-message queue.
pub struct Mailbox {
    table: Arc<KvTable>,
    seq: AtomicU64,
}

fn entry_key(agent: &AgentId, seq: u64) -> String {
    format!("{agent}{KEY_SEP}{}", seq_segment(seq))
}

fn agent_prefix(agent: &AgentId) -> String {
    format!("{agent}{KEY_SEP}")
}

impl Mailbox {
    /// Opens the mailbox over its table, recovering the global sequence
    /// counter from stored entries.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the recovery scan.
    pub async fn open(table: Arc<KvTable>) -> Result<Self, StoreError> {
        let max_seq = table
            .fold::<MailboxEntry, u64, _>(0, |acc, _k, entry| acc.max(entry.seq))
            .await?;
        Ok(Self {
            table,
            seq: AtomicU64::new(max_seq),
        })
    }

    /// Queues a message for an offline agent, returning its seq. Trims the
    /// agent's queue to [`MAX_MAILBOX`] by deleting the lowest seqs.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn enqueue(&self, agent: &AgentId, message: Message) -> Result<u64, StoreError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = MailboxEntry {
            seq,
            message,
            stored_at: now_ms(),
        };
        self.table.put(&entry_key(agent, seq), &entry).await?;

        let keys = self.table.keys_prefix(&agent_prefix(agent)).await?;
        if keys.len() > MAX_MAILBOX {
            for key in &keys[..keys.len() - MAX_MAILBOX] {
                self.table.delete(key).await?;
            }
            debug!(agent_id = %agent, trimmed = keys.len() - MAX_MAILBOX, "mailbox trimmed");
        }
        Ok(seq)
    }

    /// Entries with `seq > since`, ascending, plus the new cursor.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn poll(&self, agent: &AgentId, since: u64) -> Result<PollBatch, StoreError> {
        let rows = self
            .table
            .select_prefix::<MailboxEntry>(&agent_prefix(agent))
            .await?;
        let messages: Vec<MailboxEntry> = rows
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.seq > since)
            .collect();
        let last_seq = messages.last().map_or(since, |entry| entry.seq);
        Ok(PollBatch { messages, last_seq })
    }

    /// Deletes every entry with `seq <= up_to`, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn ack(&self, agent: &AgentId, up_to: u64) -> Result<usize, StoreError> {
        let rows = self
            .table
            .select_prefix::<MailboxEntry>(&agent_prefix(agent))
            .await?;
        let mut removed = 0;
        for (key, entry) in rows {
            if entry.seq <= up_to {
                self.table.delete(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Evicts entries stored before `now - ttl_ms`. Called by the reaper.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn evict_expired(&self, now: u64, ttl_ms: u64) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(ttl_ms);
        let expired = self
            .table
            .fold::<MailboxEntry, Vec<String>, _>(Vec::new(), |mut acc, k, entry| {
                if entry.stored_at < cutoff {
                    acc.push(k.to_string());
                }
                acc
            })
            .await?;
        let count = expired.len();
        for key in expired {
            self.table.delete(&key).await?;
        }
        if count > 0 {
            debug!(evicted = count, "expired mailbox entries removed");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    fn msg(from: &str, text: &str) -> Message {
        Message::build(
            agent(from),
            Some("c".into()),
            MessageKind::Chat,
            serde_json::json!({ "text": text }),
            None,
        )
    }

    async fn mailbox(dir: &std::path::Path) -> Mailbox {
        let table = Arc::new(KvTable::open(dir, "mailbox", None).await.unwrap());
        Mailbox::open(table).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_poll_ack_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox(dir.path()).await;
        let c = agent("c");

        let seq = mb.enqueue(&c, msg("a", "hi")).await.unwrap();
        assert_eq!(seq, 1);

        let batch = mb.poll(&c, 0).await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.last_seq, 1);

        assert_eq!(mb.ack(&c, 1).await.unwrap(), 1);
        let empty = mb.poll(&c, 1).await.unwrap();
        assert!(empty.messages.is_empty());
        assert_eq!(empty.last_seq, 1);
    }

    #[tokio::test]
    async fn seqs_are_globally_monotonic_across_agents() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox(dir.path()).await;
        let s1 = mb.enqueue(&agent("x"), msg("a", "1")).await.unwrap();
        let s2 = mb.enqueue(&agent("y"), msg("a", "2")).await.unwrap();
        let s3 = mb.enqueue(&agent("x"), msg("a", "3")).await.unwrap();
        assert!(s1 < s2 && s2 < s3);
    }

    #[tokio::test]
    async fn counter_recovers_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mb = mailbox(dir.path()).await;
            mb.enqueue(&agent("c"), msg("a", "one")).await.unwrap();
            mb.enqueue(&agent("c"), msg("a", "two")).await.unwrap();
        }
        let mb = mailbox(dir.path()).await;
        let seq = mb.enqueue(&agent("c"), msg("a", "three")).await.unwrap();
        assert_eq!(seq, 3, "sequence resumes past the stored maximum");
    }

    #[tokio::test]
    async fn per_agent_depth_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox(dir.path()).await;
        let c = agent("c");
        for i in 0..(MAX_MAILBOX + 5) {
            mb.enqueue(&c, msg("a", &format!("m{i}"))).await.unwrap();
        }
        let batch = mb.poll(&c, 0).await.unwrap();
        assert_eq!(batch.messages.len(), MAX_MAILBOX);
        // The oldest five were trimmed.
        assert_eq!(batch.messages[0].seq, 6);
    }

    #[tokio::test]
    async fn poll_respects_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox(dir.path()).await;
        let c = agent("c");
        for i in 0..4 {
            mb.enqueue(&c, msg("a", &format!("m{i}"))).await.unwrap();
        }
        let batch = mb.poll(&c, 2).await.unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].seq, 3);
        assert_eq!(batch.last_seq, 4);
    }

    #[tokio::test]
    async fn eviction_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox(dir.path()).await;
        let c = agent("c");
        mb.enqueue(&c, msg("a", "old")).await.unwrap();
        let now = now_ms();
        // TTL of zero ages out everything stored before `now`.
        let evicted = mb.evict_expired(now + 10, 0).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(mb.poll(&c, 0).await.unwrap().messages.is_empty());
    }
}
