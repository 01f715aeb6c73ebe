//! Backup and corruption supervisor
//!
//! Runs a timer loop copying every registered table file into a rotating
//! backup set, and reacts to asynchronous corruption reports: first a forced
//! repair (`compact(force_repair=true)`), then a restore from the newest
//! backup when the repair fails. Background failures are logged, never
//! surfaced to users.

use crate::domain_types::now_ms;
use crate::storage::kv::{CorruptionReport, KvTable, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Rotating-backup supervisor for the persistent tables.
pub struct BackupSupervisor {
    backup_dir: PathBuf,
    keep: usize,
    interval: Duration,
    tables: Mutex<Vec<Arc<KvTable>>>,
    corruption_tx: mpsc::UnboundedSender<CorruptionReport>,
    corruption_rx: Mutex<Option<mpsc::UnboundedReceiver<CorruptionReport>>>,
}

impl BackupSupervisor {
    #[must_use]
    pub fn new(backup_dir: PathBuf, keep: usize, interval: Duration) -> Self {
        let (corruption_tx, corruption_rx) = mpsc::unbounded_channel();
        Self {
            backup_dir,
            keep: keep.max(1),
            interval,
            tables: Mutex::new(Vec::new()),
            corruption_tx,
            corruption_rx: Mutex::new(Some(corruption_rx)),
        }
    }

    /// Sender handed to tables so they can report corruption asynchronously.
    #[must_use]
    pub fn corruption_sender(&self) -> mpsc::UnboundedSender<CorruptionReport> {
        self.corruption_tx.clone()
    }

    /// Registers a table for periodic backup and corruption handling.
    pub async fn register_table(&self, table: Arc<KvTable>) {
        self.tables.lock().await.push(table);
    }

    /// Backs up every registered table immediately.
    pub async fn force_backup(&self) {
        let tables = self.tables.lock().await.clone();
        for table in tables {
            if let Err(err) = self.backup_table(&table).await {
                warn!(table = table.name(), %err, "table backup failed");
            }
        }
    }

    async fn backup_table(&self, table: &KvTable) -> Result<PathBuf, std::io::Error> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        // Checkpoint first so the main file carries the full state.
        if let Err(err) = table.sync().await {
            warn!(table = table.name(), %err, "checkpoint before backup failed");
        }
        let dest = self
            .backup_dir
            .join(format!("{}.{:013}.db", table.name(), now_ms()));
        tokio::fs::copy(table.file_path(), &dest).await?;
        self.prune(table.name()).await?;
        info!(table = table.name(), backup = %dest.display(), "table backed up");
        Ok(dest)
    }

    async fn prune(&self, name: &str) -> Result<(), std::io::Error> {
        let mut backups = self.backups_for(name).await?;
        while backups.len() > self.keep {
            let oldest = backups.remove(0);
            if let Err(err) = tokio::fs::remove_file(&oldest).await {
                warn!(backup = %oldest.display(), %err, "failed to prune old backup");
            }
        }
        Ok(())
    }

    async fn backups_for(&self, name: &str) -> Result<Vec<PathBuf>, std::io::Error> {
        let prefix = format!("{name}.");
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with(&prefix) && file_name.ends_with(".db") {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Restores a table from its most recent backup, replacing the live file.
    ///
    /// # Errors
    ///
    /// Returns an error when no backup exists or the copy/reopen fails.
    pub async fn restore(&self, name: &str) -> Result<(), StoreError> {
        let table = self
            .table_by_name(name)
            .await
            .ok_or_else(|| StoreError::Io {
                table: name.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "table not registered with supervisor",
                ),
            })?;
        let backups = self
            .backups_for(name)
            .await
            .map_err(|source| StoreError::Io {
                table: name.to_string(),
                source,
            })?;
        let newest = backups.last().cloned().ok_or_else(|| StoreError::Io {
            table: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no backup available"),
        })?;

        table.close().await;
        tokio::fs::copy(&newest, table.file_path())
            .await
            .map_err(|source| StoreError::Io {
                table: name.to_string(),
                source,
            })?;
        // Stale WAL/SHM sidecars would shadow the restored file.
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = table.file_path().as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = tokio::fs::remove_file(PathBuf::from(sidecar)).await;
        }
        table.reopen().await?;
        info!(table = name, backup = %newest.display(), "table restored from backup");
        Ok(())
    }

    async fn table_by_name(&self, name: &str) -> Option<Arc<KvTable>> {
        self.tables
            .lock()
            .await
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    async fn handle_corruption(&self, report: CorruptionReport) {
        error!(table = %report.table, reason = %report.reason, "corruption reported, attempting repair");
        let Some(table) = self.table_by_name(&report.table).await else {
            warn!(table = %report.table, "corruption report for unregistered table");
            return;
        };
        match table.compact(true).await {
            Ok(()) => info!(table = %report.table, "repair succeeded"),
            Err(err) => {
                warn!(table = %report.table, %err, "repair failed, restoring from backup");
                if let Err(err) = self.restore(&report.table).await {
                    error!(table = %report.table, %err, "restore failed; table left as-is");
                }
            }
        }
    }

    /// Supervisor loop: periodic backups plus corruption handling. Runs until
    /// `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = match self.corruption_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("backup supervisor started twice; second start ignored");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so start-up stays fast.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.force_backup().await,
                report = rx.recv() => match report {
                    Some(report) => self.handle_corruption(report).await,
                    None => break,
                },
            }
        }
        info!("backup supervisor stopped");
    }
}
