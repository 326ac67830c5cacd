//! The [`CheckpointSaver`] trait implemented by every storage backend.
//!
//! A saver stores two things per thread and namespace:
//!
//! 1. **Checkpoints**, write-once, chained to their parent. Saving a
//!    checkpoint id that already exists fails with
//!    [`CheckpointError::AlreadyExists`](crate::CheckpointError::AlreadyExists).
//! 2. **Pending writes**, keyed by `(checkpoint, task_id)`. They hold the
//!    outputs of tasks whose superstep has not committed yet (for example
//!    because another task of the same step was interrupted), so those tasks
//!    are not re-run when the thread resumes.
//!
//! `put` receives the config of the *parent* checkpoint (the one the new
//! checkpoint was derived from) and returns the config of the new one.
//!
//! ```rust,ignore
//! let parent = saver.get_tuple(&thread).await?;
//! let saved = saver
//!     .put(&parent.config, next_checkpoint, metadata, new_versions)
//!     .await?;
//! saver.put_writes(&saved, vec![("b".into(), json!(1))], "task-1").await?;
//! ```

use crate::checkpoint::{ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Storage backend for checkpoints and pending writes
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint using the given configuration
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Fetch a checkpoint tuple, including its pending writes
    ///
    /// With `checkpoint_id` set, returns that checkpoint; otherwise the latest
    /// checkpoint of the thread and namespace.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints newest first
    ///
    /// `config` selects the thread (and namespace); without a thread id all
    /// threads are listed. `filter` matches against metadata `extra` entries,
    /// `before` keeps only checkpoints older than the given checkpoint id.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>>;

    /// Store a checkpoint derived from the checkpoint addressed by `config`
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Record the writes of one task against the checkpoint addressed by
    /// `config`, replacing anything previously recorded for `task_id`
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
    ) -> Result<()>;

    /// Delete all checkpoints and writes associated with a thread, across
    /// namespaces
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Keep only the newest `keep_last` checkpoints of a thread and namespace
    ///
    /// Returns the number of checkpoints removed.
    async fn prune(&self, config: &CheckpointConfig, keep_last: usize) -> Result<usize>;
}
