//! Durable process-wide settings
//!
//! A thin typed wrapper over a KV table for key/value settings that must
//! survive restarts (operator-set toggles, rate-limit overrides pushed at
//! runtime). Boot-time configuration lives in [`crate::config`].

use crate::storage::{KvTable, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Durable settings store.
pub struct Settings {
    table: Arc<KvTable>,
}

impl Settings {
    #[must_use]
    pub fn new(table: Arc<KvTable>) -> Self {
        Self { table }
    }

    /// Fetches a setting.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.table.get(key).await
    }

    /// Stores a setting durably.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.table.put(key, value).await
    }

    /// Removes a setting, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn unset(&self, key: &str) -> Result<bool, StoreError> {
        self.table.delete(key).await
    }

    /// All settings as `(key, value)` pairs.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn all(&self) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        self.table
            .fold(Vec::new(), |mut acc, k: &str, v: serde_json::Value| {
                acc.push((k.to_string(), v));
                acc
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_round_trip_and_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = Arc::new(KvTable::open(dir.path(), "config", None).await.unwrap());
            let settings = Settings::new(table.clone());
            settings.set("motd", &"welcome".to_string()).await.unwrap();
            settings.set("max_workers", &8u32).await.unwrap();
            table.close().await;
        }
        let table = Arc::new(KvTable::open(dir.path(), "config", None).await.unwrap());
        let settings = Settings::new(table);
        assert_eq!(
            settings.get::<String>("motd").await.unwrap().as_deref(),
            Some("welcome")
        );
        assert_eq!(settings.get::<u32>("max_workers").await.unwrap(), Some(8));
        assert_eq!(settings.all().await.unwrap().len(), 2);
        assert!(settings.unset("motd").await.unwrap());
        assert_eq!(settings.get::<String>("motd").await.unwrap(), None);
    }
}
