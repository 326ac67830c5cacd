//! Core checkpoint data structures for state persistence and time-travel
//!
//! A [`Checkpoint`] is a complete, self-sufficient snapshot of every channel
//! after a superstep: values, versions and what each node has already seen.
//! Checkpoints are addressed by `(thread_id, checkpoint_ns, id)` and chained
//! through their parent config, giving a linear or branching history per
//! thread.
//!
//! ```text
//! CheckpointTuple
//! ├── config          thread_id / checkpoint_ns / checkpoint_id
//! ├── checkpoint
//! │   ├── channel_values    {"a": "foo", "b": "foofoo"}
//! │   ├── channel_versions  {"a": 1, "b": 2}
//! │   └── versions_seen     {"double": {"a": 1}}
//! ├── metadata        source / step / parents / extra
//! ├── parent_config   checkpoint this one was derived from
//! └── pending_writes  task outputs recorded against this checkpoint
//! ```
//!
//! Checkpoint ids are ordered: later ids compare greater than earlier ones,
//! even when two ids are produced within the same clock tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Checkpoint ID type
pub type CheckpointId = String;

static LAST_TICK: AtomicU64 = AtomicU64::new(0);

/// Generate a new checkpoint id
///
/// Ids are a hybrid logical clock: a microsecond timestamp that never moves
/// backwards within the process, followed by a random suffix so ids from
/// different processes do not collide.
pub fn new_checkpoint_id() -> CheckpointId {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let mut prev = LAST_TICK.load(AtomicOrdering::Relaxed);
    let tick = loop {
        let next = now.max(prev + 1);
        match LAST_TICK.compare_exchange_weak(
            prev,
            next,
            AtomicOrdering::SeqCst,
            AtomicOrdering::Relaxed,
        ) {
            Ok(_) => break next,
            Err(actual) => prev = actual,
        }
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:016x}-{}", tick, &suffix[..12])
}

/// A write produced by a task that has not been applied to channels yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    /// Task that produced the write
    pub task_id: String,
    /// Target channel
    pub channel: String,
    /// Written value
    pub value: serde_json::Value,
}

impl PendingWrite {
    pub fn new(
        task_id: impl Into<String>,
        channel: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Channel version - integer sequence from the engine, or an opaque ordered
/// token handed out by an external store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    String(String),
}

impl ChannelVersion {
    /// The version a channel has before its first write
    pub fn initial() -> Self {
        ChannelVersion::Int(0)
    }

    /// Get the next version
    ///
    /// String tokens are converted to the integer sequence, starting after
    /// any numeric prefix they carry.
    pub fn next(&self) -> Self {
        match self {
            ChannelVersion::Int(v) => ChannelVersion::Int(v + 1),
            ChannelVersion::String(s) => {
                let base = s
                    .split('.')
                    .next()
                    .and_then(|prefix| prefix.parse::<i64>().ok())
                    .unwrap_or(0);
                ChannelVersion::Int(base + 1)
            }
        }
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => a.cmp(b),
            (ChannelVersion::String(a), ChannelVersion::String(b)) => a.cmp(b),
            (ChannelVersion::Int(_), ChannelVersion::String(_)) => Ordering::Less,
            (ChannelVersion::String(_), ChannelVersion::Int(_)) => Ordering::Greater,
        }
    }
}

impl Default for ChannelVersion {
    fn default() -> Self {
        Self::initial()
    }
}

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// How a checkpoint came to exist
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Input applied by invoke/stream
    Input,
    /// A completed superstep
    Loop,
    /// A superstep completed while resuming from an interrupt
    Resume,
    /// Out-of-band state update
    Update,
    /// Copy of a checkpoint into a new branch
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint; the input round is step 0 of a
    /// fresh thread
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Parent checkpoint ids, keyed by checkpoint namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Set parent checkpoints
    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether every filter entry is present in `extra` with an equal value
    pub fn matches(&self, filter: &HashMap<String, serde_json::Value>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.extra.get(key) == Some(value))
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format
    pub v: i32,

    /// The ID of the checkpoint (unique and monotonically increasing)
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// Snapshots of the non-empty channels
    pub channel_values: HashMap<String, serde_json::Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from node name to map from channel name to version seen
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// The channels that were updated by the step that produced this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a new checkpoint with a fresh id
    pub fn new(
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: new_checkpoint_id(),
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            updated_channels: None,
        }
    }

    /// Create an empty checkpoint
    pub fn empty() -> Self {
        Self::new(HashMap::new(), HashMap::new(), HashMap::new())
    }

    /// Highest version across all channels
    pub fn max_version(&self) -> Option<&ChannelVersion> {
        self.channel_versions.values().max()
    }

    /// Set the updated channels
    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }
}

/// Configuration addressing a thread or a specific checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint ID; `None` addresses the latest checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace; `None` and `""` both address the root graph
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Additional configuration
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread ID
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Set the checkpoint namespace
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    /// Namespace, with the root namespace as `""`
    pub fn ns(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }

    /// Thread id, required by every saver operation
    pub fn require_thread_id(&self) -> crate::Result<&str> {
        self.thread_id
            .as_deref()
            .ok_or_else(|| crate::CheckpointError::Invalid("thread_id is required".to_string()))
    }
}

/// A checkpoint together with everything stored alongside it
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Configuration for this checkpoint
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Parent configuration (if any)
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint by tasks of the next step
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    /// Create a new checkpoint tuple
    pub fn new(config: CheckpointConfig, checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    /// Set the parent configuration
    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }

    /// Set the pending writes
    pub fn with_pending_writes(mut self, pending_writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = pending_writes;
        self
    }
}
