//! Error types for graph definition and execution
//!
//! Every fallible operation in this crate returns [`Result`], whose error is a
//! [`GraphError`]. The variants follow the lifecycle of a run:
//!
//! ```text
//! GraphError
//! ├── Validation / UnreachableNode / UndeclaredChannel   compile()
//! ├── Planning                                          before the first round
//! ├── NodeExecution / UndeclaredWrite / EmptyChannel    task errors, round aborted
//! ├── RecursionLimit / Timeout / Cancelled              run limits
//! ├── ResumeMismatch / NoCheckpoint / ThreadBusy        resume and thread access
//! └── Checkpoint / Serialization / Yaml / Configuration plumbing
//! ```
//!
//! A task error never leaves a partially committed round behind: the thread
//! stays at its last checkpoint and can be re-invoked or resumed once the
//! cause is fixed.
//!
//! ```rust
//! use superstep_core::GraphError;
//!
//! fn describe(err: &GraphError) -> &'static str {
//!     match err {
//!         GraphError::RecursionLimit { .. } => "graph did not settle",
//!         GraphError::NodeExecution { .. } => "a node failed",
//!         GraphError::ResumeMismatch { .. } => "wrong number of answers",
//!         _ => "other",
//!     }
//! }
//! ```

use superstep_checkpoint::CheckpointError;
use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while compiling or running a graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A node can never be triggered from the input channels
    #[error("Node '{0}' is unreachable from the graph input")]
    UnreachableNode(String),

    /// A declaration refers to a channel the graph does not define
    #[error("'{node}' refers to undeclared channel '{channel}'")]
    UndeclaredChannel { node: String, channel: String },

    /// A node produced a write or route it did not declare
    #[error("Node '{node}' wrote to undeclared target '{channel}'")]
    UndeclaredWrite { node: String, channel: String },

    /// The graph can never make progress
    #[error("Planning failed: {0}")]
    Planning(String),

    /// A node body failed
    #[error("Node '{node}' failed: {error}")]
    NodeExecution { node: String, error: String },

    /// Free-form error raised from inside a node body
    #[error("Execution error: {0}")]
    Execution(String),

    /// A task suspended waiting for external input
    ///
    /// Returned by [`TaskContext::suspend`](crate::TaskContext::suspend) and
    /// meant to be propagated with `?`; the engine turns it into an
    /// [`Interrupt`](crate::Interrupt).
    #[error("Task suspended waiting for input")]
    Suspended,

    /// The run would exceed its superstep budget
    #[error("Recursion limit of {limit} reached at step {step}")]
    RecursionLimit { step: i64, limit: usize },

    /// A node read a channel that has never been written
    #[error("Node '{node}' read empty channel '{channel}'")]
    EmptyChannel { node: String, channel: String },

    /// The number of resume values does not match the pending interrupts
    #[error("Expected {expected} resume value(s), got {supplied}")]
    ResumeMismatch { expected: usize, supplied: usize },

    /// Another run holds the thread
    #[error("Thread '{thread_id}' (namespace '{ns}') is already running")]
    ThreadBusy { thread_id: String, ns: String },

    /// No checkpoint exists for the requested thread
    #[error("No checkpoint found for thread '{0}'")]
    NoCheckpoint(String),

    /// The run was cancelled between rounds
    #[error("Run cancelled")]
    Cancelled,

    /// A round exceeded the configured step timeout
    #[error("Step {step} timed out after {timeout_ms}ms")]
    Timeout { step: i64, timeout_ms: u64 },

    /// Input or update payload does not fit the graph
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Checkpoint storage error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl GraphError {
    /// Convenience constructor for errors raised by node bodies
    pub fn execution(msg: impl Into<String>) -> Self {
        GraphError::Execution(msg.into())
    }

    /// Whether this error is the suspension signal
    pub fn is_suspension(&self) -> bool {
        matches!(self, GraphError::Suspended)
    }

    /// Attach the failing node to a free-form execution error
    ///
    /// Structured errors pass through unchanged.
    pub(crate) fn in_node(self, node: &str) -> Self {
        match self {
            GraphError::Execution(error) => GraphError::NodeExecution {
                node: node.to_string(),
                error,
            },
            other => other,
        }
    }
}
