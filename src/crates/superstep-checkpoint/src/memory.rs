//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointSaver`] keeps every checkpoint of every thread in a
//! `tokio::sync::RwLock`-guarded map. It implements the full
//! [`CheckpointSaver`] contract (write-once checkpoints, pending writes,
//! retention) and is the saver a compiled graph falls back to when none is
//! configured. Data is lost when the process exits; use
//! [`FileCheckpointSaver`](crate::file::FileCheckpointSaver) or the SQLite
//! saver for durability.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
    traits::CheckpointSaver,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage entry for in-memory checkpoints
#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<PendingWrite>,
}

impl CheckpointEntry {
    fn to_tuple(&self) -> CheckpointTuple {
        CheckpointTuple {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_config.clone(),
            pending_writes: self.writes.clone(),
        }
    }
}

/// (thread_id, checkpoint_ns)
type StorageKey = (String, String);

/// Thread-safe in-memory checkpoint storage, entries in insertion order
type CheckpointStorage = Arc<RwLock<HashMap<StorageKey, Vec<CheckpointEntry>>>>;

/// In-memory checkpoint saver implementation
///
/// Cloning the saver shares the underlying storage.
///
/// ```rust
/// use superstep_checkpoint::{CheckpointConfig, CheckpointSaver, InMemoryCheckpointSaver};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let saver = InMemoryCheckpointSaver::new();
/// let thread = CheckpointConfig::new().with_thread_id("thread-1");
/// assert!(saver.get_tuple(&thread).await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointSaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the number of distinct threads being tracked
    pub async fn thread_count(&self) -> usize {
        let storage = self.storage.read().await;
        let mut threads: Vec<&String> = storage.keys().map(|(thread, _)| thread).collect();
        threads.sort();
        threads.dedup();
        threads.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    fn key(config: &CheckpointConfig) -> Result<StorageKey> {
        Ok((config.require_thread_id()?.to_string(), config.ns().to_string()))
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let key = Self::key(config)?;
        let storage = self.storage.read().await;

        let Some(entries) = storage.get(&key) else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(checkpoint_id) => entries.iter().find(|e| &e.checkpoint.id == checkpoint_id),
            None => entries.last(),
        };

        Ok(entry.map(CheckpointEntry::to_tuple))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let storage = self.storage.read().await;
        let before_id = before.and_then(|b| b.checkpoint_id.as_ref());

        let mut keys: Vec<&StorageKey> = storage
            .keys()
            .filter(|(thread, ns)| match config {
                Some(cfg) => {
                    cfg.thread_id.as_ref().map_or(true, |t| t == thread) && ns.as_str() == cfg.ns()
                }
                None => true,
            })
            .collect();
        keys.sort();

        let mut results: Vec<CheckpointTuple> = keys
            .into_iter()
            .filter_map(|key| storage.get(key))
            .flat_map(|entries| entries.iter())
            .filter(|entry| before_id.map_or(true, |id| entry.checkpoint.id < *id))
            .filter(|entry| filter.as_ref().map_or(true, |f| entry.metadata.matches(f)))
            .map(CheckpointEntry::to_tuple)
            .collect();

        results.sort_by(|a, b| b.checkpoint.id.cmp(&a.checkpoint.id));
        if let Some(limit) = limit {
            results.truncate(limit);
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
        let key = Self::key(config)?;
        let mut storage = self.storage.write().await;
        let entries = storage.entry(key.clone()).or_default();

        if entries.iter().any(|e| e.checkpoint.id == checkpoint.id) {
            return Err(CheckpointError::AlreadyExists {
                thread_id: key.0,
                checkpoint_id: checkpoint.id,
            });
        }

        let checkpoint_config = CheckpointConfig {
            thread_id: Some(key.0.clone()),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
            extra: config.extra.clone(),
        };

        entries.push(CheckpointEntry {
            checkpoint,
            metadata,
            config: checkpoint_config.clone(),
            parent_config: config.checkpoint_id.as_ref().map(|_| config.clone()),
            writes: Vec::new(),
        });

        Ok(checkpoint_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
    ) -> Result<()> {
        let key = Self::key(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&key)
            .and_then(|entries| entries.iter_mut().find(|e| &e.checkpoint.id == checkpoint_id))
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        entry.writes.retain(|w| w.task_id != task_id);
        entry.writes.extend(
            writes
                .into_iter()
                .map(|(channel, value)| PendingWrite::new(task_id, channel, value)),
        );
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.retain(|(thread, _), _| thread != thread_id);
        Ok(())
    }

    async fn prune(&self, config: &CheckpointConfig, keep_last: usize) -> Result<usize> {
        let key = Self::key(config)?;
        let mut storage = self.storage.write().await;
        let Some(entries) = storage.get_mut(&key) else {
            return Ok(0);
        };
        let excess = entries.len().saturating_sub(keep_last);
        entries.drain(..excess);
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use serde_json::json;

    fn thread(id: &str) -> CheckpointConfig {
        CheckpointConfig::new().with_thread_id(id)
    }

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let checkpoint = Checkpoint::empty();
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Input);

        let saved_config = saver
            .put(&thread("thread-1"), checkpoint.clone(), metadata, HashMap::new())
            .await
            .unwrap();
        assert_eq!(saved_config.checkpoint_id.as_ref(), Some(&checkpoint.id));

        let tuple = saver.get_tuple(&saved_config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint, checkpoint);
        assert!(tuple.parent_config.is_none());
    }

    #[tokio::test]
    async fn test_put_is_write_once() {
        let saver = InMemoryCheckpointSaver::new();
        let checkpoint = Checkpoint::empty();

        saver
            .put(&thread("t"), checkpoint.clone(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        let second = saver
            .put(&thread("t"), checkpoint, CheckpointMetadata::new(), HashMap::new())
            .await;
        assert!(matches!(second, Err(CheckpointError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let saver = InMemoryCheckpointSaver::new();
        let child = thread("t").with_checkpoint_ns("child:1");

        saver
            .put(&child, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        assert!(saver.get_tuple(&thread("t")).await.unwrap().is_none());
        assert!(saver.get_tuple(&child).await.unwrap().is_some());
        assert_eq!(saver.thread_count().await, 1);

        saver.delete_thread("t").await.unwrap();
        assert_eq!(saver.checkpoint_count().await, 0);
    }

    #[tokio::test]
    async fn test_put_writes_replaces_task_writes() {
        let saver = InMemoryCheckpointSaver::new();
        let saved = saver
            .put(&thread("t"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        saver
            .put_writes(&saved, vec![("a".into(), json!(1)), ("b".into(), json!(2))], "task-1")
            .await
            .unwrap();
        saver
            .put_writes(&saved, vec![("a".into(), json!(3))], "task-1")
            .await
            .unwrap();
        saver
            .put_writes(&saved, vec![("c".into(), json!(4))], "task-2")
            .await
            .unwrap();

        let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
        assert_eq!(
            tuple.pending_writes,
            vec![
                PendingWrite::new("task-1", "a", json!(3)),
                PendingWrite::new("task-2", "c", json!(4)),
            ]
        );
    }

    #[tokio::test]
    async fn test_put_writes_unknown_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let missing = thread("t").with_checkpoint_id("nope");
        let result = saver.put_writes(&missing, vec![], "task").await;
        assert!(matches!(result, Err(CheckpointError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear() {
        let saver = InMemoryCheckpointSaver::new();
        saver
            .put(&thread("t"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(saver.checkpoint_count().await, 1);
        saver.clear().await;
        assert_eq!(saver.checkpoint_count().await, 0);
    }
}
