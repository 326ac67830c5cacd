//! SQLite checkpoint saver built on `sqlx`.
//!
//! Two tables mirror the persisted layout of the engine:
//!
//! - `checkpoints(thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id,
//!   checkpoint, metadata, created_at)` with a unique key on
//!   `(thread_id, checkpoint_ns, checkpoint_id)` enforcing write-once saves;
//! - `checkpoint_writes(thread_id, checkpoint_ns, checkpoint_id, task_id, idx,
//!   channel, value)` holding pending writes.
//!
//! Checkpoint and metadata blobs go through the configured
//! [`SerializerProtocol`], so an encrypting serializer keeps both opaque in the
//! database file.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::CheckpointSaver,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

const CREATE_CHECKPOINTS: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL DEFAULT '',
    checkpoint_id TEXT NOT NULL,
    parent_checkpoint_id TEXT,
    checkpoint BLOB NOT NULL,
    metadata BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
)";

const CREATE_WRITES: &str = "CREATE TABLE IF NOT EXISTS checkpoint_writes (
    thread_id TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL DEFAULT '',
    checkpoint_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    channel TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, idx)
)";

/// Checkpoint saver storing checkpoints in SQLite
#[derive(Debug, Clone)]
pub struct SqliteCheckpointSaver<S = JsonSerializer> {
    pool: SqlitePool,
    serializer: S,
}

impl SqliteCheckpointSaver<JsonSerializer> {
    /// Connect to a database URL such as `sqlite://checkpoints.db`, creating
    /// the file and tables if needed
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_serializer(database_url, JsonSerializer::new()).await
    }

    /// Private in-memory database, useful for tests
    pub async fn in_memory() -> Result<Self> {
        Self::in_memory_with_serializer(JsonSerializer::new()).await
    }
}

impl<S: SerializerProtocol> SqliteCheckpointSaver<S> {
    /// Connect with a custom serializer
    pub async fn connect_with_serializer(database_url: &str, serializer: S) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, serializer).await
    }

    /// In-memory database with a custom serializer
    ///
    /// A single connection that never expires keeps the database alive for
    /// the lifetime of the saver.
    pub async fn in_memory_with_serializer(serializer: S) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, serializer).await
    }

    /// Use an existing pool, creating the tables if needed
    pub async fn from_pool(pool: SqlitePool, serializer: S) -> Result<Self> {
        sqlx::query(CREATE_CHECKPOINTS).execute(&pool).await?;
        sqlx::query(CREATE_WRITES).execute(&pool).await?;
        Ok(Self { pool, serializer })
    }

    async fn load_writes(&self, thread_id: &str, ns: &str, checkpoint_id: &str) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            "SELECT task_id, channel, value FROM checkpoint_writes
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?
             ORDER BY task_id, idx",
        )
        .bind(thread_id)
        .bind(ns)
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let value: Vec<u8> = row.try_get("value")?;
                Ok(PendingWrite {
                    task_id: row.try_get("task_id")?,
                    channel: row.try_get("channel")?,
                    value: self.serializer.loads(&value)?,
                })
            })
            .collect()
    }

    async fn row_to_tuple(&self, row: &SqliteRow) -> Result<CheckpointTuple> {
        let thread_id: String = row.try_get("thread_id")?;
        let ns: String = row.try_get("checkpoint_ns")?;
        let checkpoint_id: String = row.try_get("checkpoint_id")?;
        let parent_id: Option<String> = row.try_get("parent_checkpoint_id")?;
        let checkpoint_bytes: Vec<u8> = row.try_get("checkpoint")?;
        let metadata_bytes: Vec<u8> = row.try_get("metadata")?;

        let checkpoint: Checkpoint = self.serializer.loads(&checkpoint_bytes)?;
        let metadata: CheckpointMetadata = self.serializer.loads(&metadata_bytes)?;
        let pending_writes = self.load_writes(&thread_id, &ns, &checkpoint_id).await?;

        let base = CheckpointConfig::new()
            .with_thread_id(thread_id)
            .with_checkpoint_ns(ns);
        Ok(CheckpointTuple {
            config: base.clone().with_checkpoint_id(checkpoint_id),
            checkpoint,
            metadata,
            parent_config: parent_id.map(|parent| base.with_checkpoint_id(parent)),
            pending_writes,
        })
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for SqliteCheckpointSaver<S> {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = config.require_thread_id()?;
        let row = match &config.checkpoint_id {
            Some(checkpoint_id) => {
                sqlx::query(
                    "SELECT * FROM checkpoints
                     WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
                )
                .bind(thread_id)
                .bind(config.ns())
                .bind(checkpoint_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM checkpoints
                     WHERE thread_id = ? AND checkpoint_ns = ?
                     ORDER BY checkpoint_id DESC LIMIT 1",
                )
                .bind(thread_id)
                .bind(config.ns())
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(self.row_to_tuple(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let thread_id = config.and_then(|c| c.thread_id.clone());
        let ns = config.map(|c| c.ns().to_string()).unwrap_or_default();
        let before_id = before.and_then(|b| b.checkpoint_id.clone());

        let rows = sqlx::query(
            "SELECT * FROM checkpoints
             WHERE (?1 IS NULL OR thread_id = ?1)
               AND checkpoint_ns = ?2
               AND (?3 IS NULL OR checkpoint_id < ?3)
             ORDER BY checkpoint_id DESC",
        )
        .bind(thread_id)
        .bind(ns)
        .bind(before_id)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in &rows {
            let tuple = self.row_to_tuple(row).await?;
            if filter.as_ref().map_or(true, |f| tuple.metadata.matches(f)) {
                results.push(tuple);
                if limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }
        Ok(results)
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let thread_id = config.require_thread_id()?.to_string();
        let checkpoint_bytes = self.serializer.dumps(&checkpoint)?;
        let metadata_bytes = self.serializer.dumps(&metadata)?;

        let inserted = sqlx::query(
            "INSERT INTO checkpoints
             (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&thread_id)
        .bind(config.ns())
        .bind(&checkpoint.id)
        .bind(config.checkpoint_id.clone())
        .bind(checkpoint_bytes)
        .bind(metadata_bytes)
        .bind(checkpoint.ts.to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(CheckpointError::AlreadyExists {
                    thread_id,
                    checkpoint_id: checkpoint.id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        Ok(CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint.id),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: config.extra.clone(),
        })
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
    ) -> Result<()> {
        let thread_id = config.require_thread_id()?;
        let checkpoint_id = config
            .checkpoint_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let exists = sqlx::query(
            "SELECT 1 FROM checkpoints WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(thread_id)
        .bind(config.ns())
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_none() {
            return Err(CheckpointError::NotFound(checkpoint_id.clone()));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM checkpoint_writes
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ? AND task_id = ?",
        )
        .bind(thread_id)
        .bind(config.ns())
        .bind(checkpoint_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        for (idx, (channel, value)) in writes.into_iter().enumerate() {
            let value = self.serializer.dumps(&value)?;
            sqlx::query(
                "INSERT INTO checkpoint_writes
                 (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, value)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(thread_id)
            .bind(config.ns())
            .bind(checkpoint_id)
            .bind(task_id)
            .bind(idx as i64)
            .bind(channel)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn prune(&self, config: &CheckpointConfig, keep_last: usize) -> Result<usize> {
        let thread_id = config.require_thread_id()?;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM checkpoints
             WHERE thread_id = ?1 AND checkpoint_ns = ?2
               AND checkpoint_id NOT IN (
                   SELECT checkpoint_id FROM checkpoints
                   WHERE thread_id = ?1 AND checkpoint_ns = ?2
                   ORDER BY checkpoint_id DESC LIMIT ?3
               )",
        )
        .bind(thread_id)
        .bind(config.ns())
        .bind(keep_last as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM checkpoint_writes
             WHERE thread_id = ?1 AND checkpoint_ns = ?2
               AND checkpoint_id NOT IN (
                   SELECT checkpoint_id FROM checkpoints
                   WHERE thread_id = ?1 AND checkpoint_ns = ?2
               )",
        )
        .bind(thread_id)
        .bind(config.ns())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed as usize)
    }
}
