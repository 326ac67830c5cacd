//! Per-run configuration
//!
//! [`RunConfig`] addresses the thread a run belongs to and bounds how it
//! executes. It is plain serde data, so it can be loaded from YAML or JSON:
//!
//! ```rust
//! use superstep_core::RunConfig;
//!
//! let config = RunConfig::from_yaml_str(
//!     r#"
//! thread_id: order-42
//! recursion_limit: 10
//! interrupt_before: [approve]
//! max_concurrency: 4
//! "#,
//! )
//! .unwrap();
//! assert_eq!(config.recursion_limit, 10);
//! assert_eq!(config.interrupt_before, vec!["approve".to_string()]);
//! ```

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use superstep_checkpoint::CheckpointConfig;
use tokio_util::sync::CancellationToken;

/// Default superstep budget of a run
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Wildcard for static breakpoints matching every node
pub const ALL_NODES: &str = "*";

/// Configuration of a single invoke, stream or resume call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Thread the run reads from and appends checkpoints to; a fresh id is
    /// generated when unset
    pub thread_id: Option<String>,

    /// Start from this historical checkpoint instead of the latest one
    pub checkpoint_id: Option<String>,

    /// Checkpoint namespace; empty for the root graph
    pub checkpoint_ns: Option<String>,

    /// Maximum number of supersteps per run, counting the input step
    pub recursion_limit: usize,

    /// Pause before running these nodes (`"*"` for all)
    pub interrupt_before: Vec<String>,

    /// Pause after these nodes ran (`"*"` for all)
    pub interrupt_after: Vec<String>,

    /// Upper bound on tasks executing at once within a round
    pub max_concurrency: Option<usize>,

    /// Abort a round that runs longer than this
    pub step_timeout_ms: Option<u64>,

    /// Extra metadata recorded on every checkpoint of the run
    pub metadata: HashMap<String, Value>,

    /// Token checked between rounds and handed to tasks
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_id: None,
            checkpoint_ns: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            max_concurrency: None,
            step_timeout_ms: None,
            metadata: HashMap::new(),
            cancellation: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(ns.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Namespace, with the root namespace as `""`
    pub fn ns(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }

    /// Checkpoint address derived from this configuration
    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            thread_id: self.thread_id.clone(),
            checkpoint_id: self.checkpoint_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone().filter(|ns| !ns.is_empty()),
            extra: HashMap::new(),
        }
    }

    /// Same configuration addressing a specific checkpoint
    pub fn at_checkpoint(&self, checkpoint: &CheckpointConfig) -> Self {
        let mut config = self.clone();
        config.thread_id = checkpoint.thread_id.clone().or(config.thread_id);
        config.checkpoint_id = checkpoint.checkpoint_id.clone();
        config
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.recursion_limit == 0 {
            return Err(GraphError::Configuration(
                "recursion_limit must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(GraphError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_ms == Some(0) {
            return Err(GraphError::Configuration(
                "step_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn interrupts_before(&self, node: &str) -> bool {
        self.interrupt_before.iter().any(|n| n == node || n == ALL_NODES)
    }

    pub(crate) fn interrupts_after(&self, node: &str) -> bool {
        self.interrupt_after.iter().any(|n| n == node || n == ALL_NODES)
    }
}
