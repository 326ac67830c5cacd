//! Filesystem-backed checkpoint saver.
//!
//! Layout under the base directory:
//!
//! ```text
//! {base}/t-{thread}/ns-{namespace}/{checkpoint_id}/checkpoint.bin
//! {base}/t-{thread}/ns-{namespace}/{checkpoint_id}/writes/{task_id}.bin
//! ```
//!
//! Thread, namespace and task ids are percent-encoded so any string is a
//! valid key. Checkpoint ids sort in creation order, so the latest checkpoint
//! is the greatest directory name. Every file is written to a temporary path
//! and renamed into place, so readers never observe a partial checkpoint.

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
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const CHECKPOINT_FILE: &str = "checkpoint.bin";
const WRITES_DIR: &str = "writes";

/// What is stored in `checkpoint.bin`
#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_checkpoint_id: Option<String>,
}

/// Checkpoint saver writing one directory per checkpoint
#[derive(Debug, Clone)]
pub struct FileCheckpointSaver<S = JsonSerializer> {
    base_dir: PathBuf,
    serializer: S,
    max_retained: Option<usize>,
}

impl FileCheckpointSaver<JsonSerializer> {
    /// Create a JSON-encoded saver rooted at `base_dir`
    ///
    /// The directory is created lazily on first save.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_serializer(base_dir, JsonSerializer::new())
    }
}

impl<S: SerializerProtocol> FileCheckpointSaver<S> {
    /// Create a saver with a custom serializer (for example an encrypting one)
    pub fn with_serializer(base_dir: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            base_dir: base_dir.into(),
            serializer,
            max_retained: None,
        }
    }

    /// Keep at most `max_retained` checkpoints per thread and namespace,
    /// pruning the oldest after every save
    pub fn with_max_retained(mut self, max_retained: usize) -> Self {
        self.max_retained = Some(max_retained);
        self
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.base_dir.join(format!("t-{}", encode_component(thread_id)))
    }

    fn namespace_dir(&self, thread_id: &str, ns: &str) -> PathBuf {
        self.thread_dir(thread_id)
            .join(format!("ns-{}", encode_component(ns)))
    }

    fn checkpoint_dir(&self, thread_id: &str, ns: &str, checkpoint_id: &str) -> PathBuf {
        self.namespace_dir(thread_id, ns)
            .join(encode_component(checkpoint_id))
    }

    /// Checkpoint ids of a thread and namespace, oldest first
    async fn sorted_checkpoint_ids(&self, thread_id: &str, ns: &str) -> Result<Vec<String>> {
        let mut ids = read_dir_names(&self.namespace_dir(thread_id, ns)).await?;
        ids.retain(|name| !name.ends_with(".tmp"));
        let mut ids: Vec<String> = ids.iter().map(|name| decode_component(name)).collect();
        ids.sort();
        Ok(ids)
    }

    async fn load(&self, thread_id: &str, ns: &str, checkpoint_id: &str) -> Result<Option<CheckpointTuple>> {
        let dir = self.checkpoint_dir(thread_id, ns, checkpoint_id);
        let bytes = match fs::read(dir.join(CHECKPOINT_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredCheckpoint = self.serializer.loads(&bytes)?;

        let mut pending_writes = Vec::new();
        let writes_dir = dir.join(WRITES_DIR);
        let mut files = read_dir_names(&writes_dir).await?;
        files.retain(|name| name.ends_with(".bin"));
        files.sort();
        for file in files {
            let bytes = fs::read(writes_dir.join(&file)).await?;
            let writes: Vec<PendingWrite> = self.serializer.loads(&bytes)?;
            pending_writes.extend(writes);
        }

        let config = CheckpointConfig::new()
            .with_thread_id(thread_id)
            .with_checkpoint_ns(ns)
            .with_checkpoint_id(checkpoint_id);
        let parent_config = stored.parent_checkpoint_id.map(|parent| {
            CheckpointConfig::new()
                .with_thread_id(thread_id)
                .with_checkpoint_ns(ns)
                .with_checkpoint_id(parent)
        });

        Ok(Some(CheckpointTuple {
            config,
            checkpoint: stored.checkpoint,
            metadata: stored.metadata,
            parent_config,
            pending_writes,
        }))
    }

    async fn prune_namespace(&self, thread_id: &str, ns: &str, keep_last: usize) -> Result<usize> {
        let ids = self.sorted_checkpoint_ids(thread_id, ns).await?;
        let excess = ids.len().saturating_sub(keep_last);
        let mut removed = 0;
        for id in &ids[..excess] {
            fs::remove_dir_all(self.checkpoint_dir(thread_id, ns, id)).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!(thread_id, ns, removed, "pruned checkpoints");
        }
        Ok(removed)
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for FileCheckpointSaver<S> {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = config.require_thread_id()?;
        let ns = config.ns();

        let checkpoint_id = match &config.checkpoint_id {
            Some(id) => id.clone(),
            None => match self.sorted_checkpoint_ids(thread_id, ns).await?.pop() {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        self.load(thread_id, ns, &checkpoint_id).await
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let mut scopes: Vec<(String, String)> = Vec::new();
        match config.and_then(|c| c.thread_id.clone()) {
            Some(thread_id) => {
                let ns = config.map(|c| c.ns().to_string()).unwrap_or_default();
                scopes.push((thread_id, ns));
            }
            None => {
                for thread_dir in read_dir_names(&self.base_dir).await? {
                    let Some(thread) = thread_dir.strip_prefix("t-") else {
                        continue;
                    };
                    let thread_id = decode_component(thread);
                    let wanted_ns = config.map(|c| c.ns().to_string()).unwrap_or_default();
                    scopes.push((thread_id, wanted_ns));
                }
            }
        }

        let before_id = before.and_then(|b| b.checkpoint_id.clone());
        let mut results = Vec::new();
        for (thread_id, ns) in scopes {
            for id in self.sorted_checkpoint_ids(&thread_id, &ns).await? {
                if before_id.as_ref().is_some_and(|before| id >= *before) {
                    continue;
                }
                if let Some(tuple) = self.load(&thread_id, &ns, &id).await? {
                    if filter.as_ref().map_or(true, |f| tuple.metadata.matches(f)) {
                        results.push(tuple);
                    }
                }
            }
        }

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
        let thread_id = config.require_thread_id()?.to_string();
        let ns = config.ns().to_string();
        let dir = self.checkpoint_dir(&thread_id, &ns, &checkpoint.id);
        let path = dir.join(CHECKPOINT_FILE);

        if fs::try_exists(&path).await? {
            return Err(CheckpointError::AlreadyExists {
                thread_id,
                checkpoint_id: checkpoint.id,
            });
        }

        let checkpoint_id = checkpoint.id.clone();
        let stored = StoredCheckpoint {
            checkpoint,
            metadata,
            parent_checkpoint_id: config.checkpoint_id.clone(),
        };
        let bytes = self.serializer.dumps(&stored)?;

        fs::create_dir_all(&dir).await?;
        write_atomic(&path, &bytes).await?;

        if let Some(max_retained) = self.max_retained {
            self.prune_namespace(&thread_id, &ns, max_retained).await?;
        }

        Ok(CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint_id),
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

        let dir = self.checkpoint_dir(thread_id, config.ns(), checkpoint_id);
        if !fs::try_exists(dir.join(CHECKPOINT_FILE)).await? {
            return Err(CheckpointError::NotFound(checkpoint_id.clone()));
        }

        let writes: Vec<PendingWrite> = writes
            .into_iter()
            .map(|(channel, value)| PendingWrite::new(task_id, channel, value))
            .collect();
        let bytes = self.serializer.dumps(&writes)?;

        let writes_dir = dir.join(WRITES_DIR);
        fs::create_dir_all(&writes_dir).await?;
        write_atomic(
            &writes_dir.join(format!("{}.bin", encode_component(task_id))),
            &bytes,
        )
        .await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.thread_dir(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune(&self, config: &CheckpointConfig, keep_last: usize) -> Result<usize> {
        let thread_id = config.require_thread_id()?;
        self.prune_namespace(thread_id, config.ns(), keep_last).await
    }
}

/// Write to a temporary sibling, then rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Names of the entries of `dir`, empty if it does not exist
async fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => encoded.push(byte as char),
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

fn decode_component(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use crate::encrypted::{AesGcmCipher, EncryptedSerializer};
    use serde_json::json;

    fn thread(id: &str) -> CheckpointConfig {
        CheckpointConfig::new().with_thread_id(id)
    }

    #[test]
    fn test_component_encoding_round_trips() {
        for raw in ["plain", "with space", "a/b\\c", "ünï", "x%41", ""] {
            assert_eq!(decode_component(&encode_component(raw)), raw);
        }
        assert!(!encode_component("../escape").contains('/'));
    }

    #[tokio::test]
    async fn test_put_and_reload_from_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let saver = FileCheckpointSaver::new(dir.path());

        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_values.insert("a".into(), json!("foo"));
        let saved = saver
            .put(
                &thread("user/1"),
                checkpoint.clone(),
                CheckpointMetadata::new().with_source(CheckpointSource::Input).with_step(0),
                HashMap::new(),
            )
            .await
            .unwrap();
        saver
            .put_writes(&saved, vec![("b".into(), json!(2))], "task-1")
            .await
            .unwrap();

        let reopened = FileCheckpointSaver::new(dir.path());
        let tuple = reopened.get_tuple(&thread("user/1")).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint, checkpoint);
        assert_eq!(tuple.metadata.step, Some(0));
        assert_eq!(tuple.pending_writes, vec![PendingWrite::new("task-1", "b", json!(2))]);
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let saver = FileCheckpointSaver::new(dir.path()).with_max_retained(2);

        let mut parent = thread("t");
        let mut ids = Vec::new();
        for step in 0..4 {
            let checkpoint = Checkpoint::empty();
            ids.push(checkpoint.id.clone());
            parent = saver
                .put(&parent, checkpoint, CheckpointMetadata::new().with_step(step), HashMap::new())
                .await
                .unwrap();
        }

        let listed = saver.list(Some(&thread("t")), None, None, None).await.unwrap();
        let listed_ids: Vec<_> = listed.iter().map(|t| t.checkpoint.id.clone()).collect();
        assert_eq!(listed_ids, vec![ids[3].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_encrypted_files_do_not_leak_values() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = EncryptedSerializer::new(
            JsonSerializer::new(),
            AesGcmCipher::new(&[9u8; 32]).unwrap(),
        );
        let saver = FileCheckpointSaver::with_serializer(dir.path(), serializer);

        let mut checkpoint = Checkpoint::empty();
        checkpoint
            .channel_values
            .insert("secret".into(), json!("hunter2"));
        let saved = saver
            .put(&thread("t"), checkpoint.clone(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        let raw_path = dir
            .path()
            .join("t-t")
            .join("ns-")
            .join(encode_component(saved.checkpoint_id.as_deref().unwrap()))
            .join(CHECKPOINT_FILE);
        let raw = std::fs::read(raw_path).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("hunter2"));

        let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.channel_values["secret"], json!("hunter2"));
    }
}
