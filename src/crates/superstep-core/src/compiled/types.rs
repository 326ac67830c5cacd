//! Type definitions for compiled graph execution

use crate::interrupt::Interrupt;
use crate::pregel::types::{TaskPath, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use superstep_checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata};

/// Result of `invoke` and `resume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Output channels holding a value, keyed by channel
    pub values: Value,

    /// Why the run stopped early, in resume order; empty when the graph
    /// ran to quiescence
    pub interrupts: Vec<Interrupt>,

    /// Address of the last saved checkpoint
    pub config: CheckpointConfig,
}

impl RunOutput {
    pub fn is_interrupted(&self) -> bool {
        !self.interrupts.is_empty()
    }

    /// Value of one output channel
    pub fn get(&self, channel: &str) -> Option<&Value> {
        self.values.get(channel)
    }

    /// Number of values `resume` expects
    pub fn resumable(&self) -> usize {
        self.interrupts.iter().filter(|i| i.resumable).count()
    }
}

/// A task planned for the round after a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub path: TaskPath,

    /// `Completed` when its writes are already recorded, `Interrupted` when
    /// it waits for a resume value, `Pending` otherwise
    pub state: TaskState,

    /// Interrupts of this task still waiting for a value
    pub interrupts: Vec<Interrupt>,

    /// State of the subgraph this task runs, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subgraph_state: Option<Box<StateSnapshot>>,
}

/// Point-in-time view of a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Output channels holding a value
    pub values: Value,

    /// Nodes that run next, in path order; empty when the thread is done
    pub next: Vec<String>,

    pub tasks: Vec<TaskSnapshot>,

    /// Address of this checkpoint
    pub config: CheckpointConfig,

    pub metadata: CheckpointMetadata,

    pub created_at: DateTime<Utc>,

    pub parent_config: Option<CheckpointConfig>,

    /// The raw checkpoint
    pub checkpoint: Checkpoint,
}

impl StateSnapshot {
    /// All unanswered interrupts, in resume order
    pub fn interrupts(&self) -> Vec<&Interrupt> {
        self.tasks.iter().flat_map(|t| t.interrupts.iter()).collect()
    }

    pub fn step(&self) -> Option<i64> {
        self.metadata.step
    }
}
