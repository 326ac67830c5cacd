//! Core task data types.

use crate::cache::CacheKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Position of a task within its round
///
/// Pull tasks (triggered by channels) come first, ordered by node name, then
/// push tasks (spawned by `Send`) in packet order. Writes of a round are
/// applied in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum TaskPath {
    Pull(String),
    Push(usize),
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPath::Pull(node) => write!(f, "pull:{node}"),
            TaskPath::Push(idx) => write!(f, "push:{idx}"),
        }
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Errored,
    Interrupted,
}

/// A planned unit of work
#[derive(Debug, Clone)]
pub(crate) struct PregelTask {
    pub id: String,
    pub name: String,
    pub path: TaskPath,
    pub step: i64,
    pub input: Value,
    /// Channels whose versions get marked as seen when the round commits
    pub triggers: Vec<String>,
    pub cache_key: Option<CacheKey>,
}

/// Writes of one task (or of the input) ready to be applied
#[derive(Debug, Clone)]
pub(crate) struct TaskWrites {
    pub path: TaskPath,
    pub name: String,
    pub writes: Vec<(String, Value)>,
    pub triggers: Vec<String>,
}

impl TaskWrites {
    pub(crate) fn new(
        path: TaskPath,
        name: impl Into<String>,
        writes: Vec<(String, Value)>,
        triggers: Vec<String>,
    ) -> Self {
        Self {
            path,
            name: name.into(),
            writes,
            triggers,
        }
    }
}
