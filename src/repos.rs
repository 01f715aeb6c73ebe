//! Repository registry
//!
//! Durable map of repo name to checkout metadata. Goals may reference a repo
//! by name; an unknown reference is allowed but logged so operators notice
//! the gap.

use crate::storage::{KvTable, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// A registered repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    pub path: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Durable repo registry.
pub struct RepoRegistry {
    table: Arc<KvTable>,
}

impl RepoRegistry {
    #[must_use]
    pub fn new(table: Arc<KvTable>) -> Self {
        Self { table }
    }

    /// Registers or updates a repo.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn register(&self, entry: RepoEntry) -> Result<(), StoreError> {
        self.table.put(&entry.name, &entry).await
    }

    /// Fetches a repo by name.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get(&self, name: &str) -> Result<Option<RepoEntry>, StoreError> {
        self.table.get(name).await
    }

    /// All registered repos, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list(&self) -> Result<Vec<RepoEntry>, StoreError> {
        self.table
            .fold::<RepoEntry, Vec<RepoEntry>, _>(Vec::new(), |mut acc, _k, entry| {
                acc.push(entry);
                acc
            })
            .await
    }

    /// Warns when a goal references a repo nobody registered.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn check_reference(&self, name: &str) -> Result<(), StoreError> {
        if self.get(name).await?.is_none() {
            warn!(repo = name, "goal references unregistered repo");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(KvTable::open(dir.path(), "repo_registry", None).await.unwrap());
        let repos = RepoRegistry::new(table);

        repos
            .register(RepoEntry {
                name: "hub".into(),
                path: "/srv/checkouts/hub".into(),
                default_branch: "main".into(),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();

        assert!(repos.get("hub").await.unwrap().is_some());
        assert!(repos.get("ghost").await.unwrap().is_none());
        assert_eq!(repos.list().await.unwrap().len(), 1);
        repos.check_reference("ghost").await.unwrap();
    }
}
