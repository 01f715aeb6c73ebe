//! Reply-thread index
//!
//! Two key spaces over one table: `msg\x1f<id>` holds the message itself,
//! `kids\x1f<id>` the ordered, deduplicated list of direct reply ids. Thread
//! walks follow `reply_to` pointers up to the root, then collect the subtree
//! depth-first and sort by timestamp.

use crate::domain_types::MessageId;
use crate::message::Message;
use crate::storage::kv::KEY_SEP;
use crate::storage::{KvTable, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

fn msg_key(id: &MessageId) -> String {
    format!("msg{KEY_SEP}{id}")
}

fn kids_key(id: &MessageId) -> String {
    format!("kids{KEY_SEP}{id}")
}

/// Message and reply-chain index.
pub struct ThreadIndex {
    table: Arc<KvTable>,
    // Serializes read-modify-write on children lists.
    write: Mutex<()>,
}

impl ThreadIndex {
    #[must_use]
    pub fn new(table: Arc<KvTable>) -> Self {
        Self {
            table,
            write: Mutex::new(()),
        }
    }

    /// Records a routed message and, when it replies to another, links it
    /// into the parent's children list (deduplicated).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn index(&self, message: &Message) -> Result<(), StoreError> {
        let _guard = self.write.lock().await;
        self.table.put(&msg_key(&message.id), message).await?;
        if let Some(parent) = &message.reply_to {
            let key = kids_key(parent);
            let mut kids: Vec<MessageId> = self.table.get(&key).await?.unwrap_or_default();
            if !kids.contains(&message.id) {
                kids.push(message.id.clone());
                self.table.put(&key, &kids).await?;
            }
        }
        Ok(())
    }

    /// Fetches a single indexed message.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        self.table.get(&msg_key(id)).await
    }

    /// Direct replies to a message, in index order.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_replies(&self, id: &MessageId) -> Result<Vec<Message>, StoreError> {
        let kids: Vec<MessageId> = self.table.get(&kids_key(id)).await?.unwrap_or_default();
        let mut out = Vec::with_capacity(kids.len());
        for kid in kids {
            if let Some(message) = self.get(&kid).await? {
                out.push(message);
            }
        }
        Ok(out)
    }

    /// Walks `reply_to` pointers to the thread root. A dangling parent stops
    /// the walk at the last resolvable message; a cycle stops at the first
    /// revisit.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_root(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let Some(mut current) = self.get(id).await? else {
            return Ok(None);
        };
        let mut seen: HashSet<MessageId> = HashSet::new();
        seen.insert(current.id.clone());
        while let Some(parent_id) = current.reply_to.clone() {
            if !seen.insert(parent_id.clone()) {
                break;
            }
            match self.get(&parent_id).await? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(Some(current))
    }

    /// The whole thread containing `id`: root plus transitive replies,
    /// sorted by timestamp.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_thread(&self, id: &MessageId) -> Result<Vec<Message>, StoreError> {
        let Some(root) = self.get_root(id).await? else {
            return Ok(Vec::new());
        };
        let mut collected = Vec::new();
        let mut seen: HashSet<MessageId> = HashSet::new();
        let mut stack = vec![root];
        while let Some(message) = stack.pop() {
            if !seen.insert(message.id.clone()) {
                continue;
            }
            let kids: Vec<MessageId> = self
                .table
                .get(&kids_key(&message.id))
                .await?
                .unwrap_or_default();
            for kid in kids {
                if let Some(child) = self.get(&kid).await? {
                    stack.push(child);
                }
            }
            collected.push(message);
        }
        collected.sort_by_key(|m| m.timestamp_ms);
        Ok(collected)
    }
}
