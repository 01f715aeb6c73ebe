//! Typed key/value table over SQLite
//!
//! One table per logical store, one database file per table, each in its own
//! directory. Writes go through a single connection so there is exactly one
//! writer per table; `synchronous=FULL` makes every committed `put` durable
//! before the call returns.
//!
//! Any operation that trips a corruption signal logs it, dispatches an async
//! report to the backup supervisor, and surfaces
//! [`StoreError::TableCorrupted`] to the caller. There are no hidden retries.
//!
//! Not safe to `open` the same path twice concurrently.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};

/// Asynchronous corruption notification for the backup supervisor.
#[derive(Debug, Clone)]
pub struct CorruptionReport {
    pub table: String,
    pub reason: String,
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("table {table} is corrupted: {reason}")]
    TableCorrupted { table: String, reason: String },

    #[error("database error on table {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("codec error on table {table}: {source}")]
    Codec {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on table {table}: {source}")]
    Io {
        table: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// True for errors the caller must treat as a corrupted table.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::TableCorrupted { .. })
    }
}

/// A disk-backed keyed map holding JSON values.
///
/// Composite keys join segments with `\x1f` and zero-pad numeric segments to
/// 20 digits, so lexicographic key order equals numeric order and range scans
/// stay cheap.
pub struct KvTable {
    name: String,
    path: PathBuf,
    pool: RwLock<SqlitePool>,
    corruption: Option<mpsc::UnboundedSender<CorruptionReport>>,
}

/// Key-segment separator for composite keys.
pub const KEY_SEP: char = '\x1f';

/// Renders a numeric key segment so lexicographic order matches numeric order.
#[must_use]
pub fn seq_segment(seq: u64) -> String {
    format!("{seq:020}")
}

impl KvTable {
    /// Opens (creating if needed) the table `name` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or the database
    /// cannot be opened or initialized.
    pub async fn open(
        dir: &Path,
        name: &str,
        corruption: Option<mpsc::UnboundedSender<CorruptionReport>>,
    ) -> Result<Self, StoreError> {
        let table_dir = dir.join(name);
        tokio::fs::create_dir_all(&table_dir)
            .await
            .map_err(|source| StoreError::Io {
                table: name.to_string(),
                source,
            })?;
        let path = table_dir.join(format!("{name}.db"));
        let pool = Self::connect(&path).await.map_err(|source| StoreError::Database {
            table: name.to_string(),
            source,
        })?;

        let table = Self {
            name: name.to_string(),
            path,
            pool: RwLock::new(pool),
            corruption,
        };
        table
            .execute("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT NOT NULL)")
            .await?;
        info!(table = %table.name, path = %table.path.display(), "table opened");
        Ok(table)
    }

    async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "FULL")
            .disable_statement_logging();
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
    }

    /// The table's logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.path
    }

    async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        let pool = self.pool().await;
        sqlx::query(sql)
            .execute(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        Ok(())
    }

    /// Fetches and decodes the value at `k`.
    ///
    /// # Errors
    ///
    /// Returns a database or codec error; corruption is escalated.
    pub async fn get<T: DeserializeOwned>(&self, k: &str) -> Result<Option<T>, StoreError> {
        let pool = self.pool().await;
        let row = sqlx::query("SELECT v FROM kv WHERE k = ?1")
            .bind(k)
            .fetch_optional(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.try_get(0).map_err(|e| self.escalate(e))?;
                let value = serde_json::from_str(&raw).map_err(|source| StoreError::Codec {
                    table: self.name.clone(),
                    source,
                })?;
                Ok(Some(value))
            }
        }
    }

    /// Stores `v` at `k`, replacing any previous value. The write is durable
    /// when this returns.
    ///
    /// # Errors
    ///
    /// Returns a database or codec error; corruption is escalated.
    pub async fn put<T: Serialize>(&self, k: &str, v: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(v).map_err(|source| StoreError::Codec {
            table: self.name.clone(),
            source,
        })?;
        let pool = self.pool().await;
        sqlx::query("INSERT OR REPLACE INTO kv (k, v) VALUES (?1, ?2)")
            .bind(k)
            .bind(raw)
            .execute(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        Ok(())
    }

    /// Deletes `k`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a database error; corruption is escalated.
    pub async fn delete(&self, k: &str) -> Result<bool, StoreError> {
        let pool = self.pool().await;
        let result = sqlx::query("DELETE FROM kv WHERE k = ?1")
            .bind(k)
            .execute(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Folds every entry in key order through `f`.
    ///
    /// # Errors
    ///
    /// Returns a database or codec error; corruption is escalated.
    pub async fn fold<T, A, F>(&self, init: A, mut f: F) -> Result<A, StoreError>
    where
        T: DeserializeOwned,
        F: FnMut(A, &str, T) -> A,
    {
        let pool = self.pool().await;
        let rows = sqlx::query("SELECT k, v FROM kv ORDER BY k")
            .fetch_all(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        let mut acc = init;
        for row in rows {
            let k: String = row.try_get(0).map_err(|e| self.escalate(e))?;
            let raw: String = row.try_get(1).map_err(|e| self.escalate(e))?;
            let v = serde_json::from_str(&raw).map_err(|source| StoreError::Codec {
                table: self.name.clone(),
                source,
            })?;
            acc = f(acc, &k, v);
        }
        Ok(acc)
    }

    /// Returns every `(key, value)` whose key starts with `prefix`, in key
    /// order.
    ///
    /// # Errors
    ///
    /// Returns a database or codec error; corruption is escalated.
    pub async fn select_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let pool = self.pool().await;
        let rows = sqlx::query("SELECT k, v FROM kv WHERE k LIKE ?1 ESCAPE '\\' ORDER BY k")
            .bind(pattern)
            .fetch_all(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let k: String = row.try_get(0).map_err(|e| self.escalate(e))?;
            let raw: String = row.try_get(1).map_err(|e| self.escalate(e))?;
            let v = serde_json::from_str(&raw).map_err(|source| StoreError::Codec {
                table: self.name.clone(),
                source,
            })?;
            out.push((k, v));
        }
        Ok(out)
    }

    /// Returns every key starting with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns a database error; corruption is escalated.
    pub async fn keys_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let pool = self.pool().await;
        let rows = sqlx::query("SELECT k FROM kv WHERE k LIKE ?1 ESCAPE '\\' ORDER BY k")
            .bind(pattern)
            .fetch_all(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get(0).map_err(|e| self.escalate(e))?);
        }
        Ok(out)
    }

    /// Number of keys starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns a database error; corruption is escalated.
    pub async fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let pool = self.pool().await;
        let row = sqlx::query("SELECT COUNT(*) FROM kv WHERE k LIKE ?1 ESCAPE '\\'")
            .bind(pattern)
            .fetch_one(&pool)
            .await
            .map_err(|e| self.escalate(e))?;
        let count: i64 = row.try_get(0).map_err(|e| self.escalate(e))?;
        Ok(count.max(0) as u64)
    }

    /// Checkpoints the WAL into the main database file.
    ///
    /// # Errors
    ///
    /// Returns a database error; corruption is escalated.
    pub async fn sync(&self) -> Result<(), StoreError> {
        self.execute("PRAGMA wal_checkpoint(FULL)").await
    }

    /// Compacts the table. With `force_repair`, an integrity check runs first
    /// and a failed check is escalated as corruption.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableCorrupted`] when the integrity check fails,
    /// otherwise a database error.
    pub async fn compact(&self, force_repair: bool) -> Result<(), StoreError> {
        if force_repair {
            let pool = self.pool().await;
            let rows = sqlx::query("PRAGMA integrity_check")
                .fetch_all(&pool)
                .await
                .map_err(|e| self.escalate(e))?;
            let verdict: String = rows
                .first()
                .and_then(|r| r.try_get::<String, _>(0).ok())
                .unwrap_or_else(|| "no integrity result".to_string());
            if verdict != "ok" {
                return Err(self.report_corruption(verdict));
            }
        }
        self.execute("PRAGMA wal_checkpoint(TRUNCATE)").await?;
        self.execute("VACUUM").await
    }

    /// Closes the connection pool. The table is unusable until [`Self::reopen`].
    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    /// Re-establishes the connection pool, e.g. after a restore replaced the
    /// backing file.
    ///
    /// # Errors
    ///
    /// Returns a database error when the file cannot be reopened.
    pub async fn reopen(&self) -> Result<(), StoreError> {
        let mut guard = self.pool.write().await;
        guard.close().await;
        *guard = Self::connect(&self.path)
            .await
            .map_err(|source| StoreError::Database {
                table: self.name.clone(),
                source,
            })?;
        drop(guard);
        self.execute("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT NOT NULL)")
            .await?;
        info!(table = %self.name, "table reopened");
        Ok(())
    }

    fn escalate(&self, source: sqlx::Error) -> StoreError {
        if let Some(reason) = corruption_reason(&source) {
            self.report_corruption(reason)
        } else {
            StoreError::Database {
                table: self.name.clone(),
                source,
            }
        }
    }

    fn report_corruption(&self, reason: String) -> StoreError {
        error!(table = %self.name, %reason, "table corruption detected");
        if let Some(tx) = &self.corruption {
            let report = CorruptionReport {
                table: self.name.clone(),
                reason: reason.clone(),
            };
            if tx.send(report).is_err() {
                warn!(table = %self.name, "backup supervisor unavailable for corruption report");
            }
        }
        StoreError::TableCorrupted {
            table: self.name.clone(),
            reason,
        }
    }
}

fn corruption_reason(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db) = err {
        let message = db.message().to_string();
        let lowered = message.to_lowercase();
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        // SQLITE_CORRUPT (11) / SQLITE_NOTADB (26)
        if code == "11"
            || code == "26"
            || lowered.contains("malformed")
            || lowered.contains("not a database")
        {
            return Some(message);
        }
    }
    None
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
