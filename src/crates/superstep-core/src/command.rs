//! What a node body returns
//!
//! A node finishes with a [`NodeOutput`]:
//!
//! - [`NodeOutput::Update`] maps an object onto the node's declared output
//!   channels (or the whole value onto its only output channel);
//! - [`NodeOutput::Writes`] lists channel writes explicitly, which allows
//!   several writes to the same channel;
//! - [`NodeOutput::Command`] combines a state update with explicit
//!   redirection. A command with a `goto` bypasses the node's static edges and
//!   conditional routers for that round.
//!
//! ```rust
//! use superstep_core::{Command, NodeOutput, Send};
//! use serde_json::json;
//!
//! let out: NodeOutput = Command::new()
//!     .with_update(json!({"status": "fanned-out"}))
//!     .with_goto(Send::new("worker", json!(1)))
//!     .with_goto(Send::new("worker", json!(2)))
//!     .into();
//! assert!(matches!(out, NodeOutput::Command(_)));
//! ```

use crate::send::Route;
use serde_json::Value;

/// State update plus redirection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    /// Update applied like [`NodeOutput::Update`]
    pub update: Option<Value>,

    /// Nodes to trigger or tasks to spawn next
    pub goto: Vec<Route>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    /// Add a redirection target; may be called repeatedly
    pub fn with_goto(mut self, target: impl Into<Route>) -> Self {
        self.goto.push(target.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.goto.is_empty()
    }
}

/// Result of one node execution
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Object keyed by output channel, or a bare value for a single output
    Update(Value),
    /// Explicit `(channel, value)` writes
    Writes(Vec<(String, Value)>),
    /// Update plus redirection
    Command(Command),
}

impl NodeOutput {
    pub fn update(value: Value) -> Self {
        NodeOutput::Update(value)
    }

    /// No writes at all
    pub fn empty() -> Self {
        NodeOutput::Writes(Vec::new())
    }

    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeOutput::Writes(vec![(channel.into(), value)])
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        NodeOutput::Update(value)
    }
}

impl From<Command> for NodeOutput {
    fn from(command: Command) -> Self {
        NodeOutput::Command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_builder() {
        let cmd = Command::new().with_goto("a").with_goto("b");
        assert_eq!(cmd.goto, vec![Route::to("a"), Route::to("b")]);
        assert!(cmd.update.is_none());
        assert!(Command::new().is_empty());
    }

    #[test]
    fn test_output_conversions() {
        assert_eq!(NodeOutput::from(json!(1)), NodeOutput::Update(json!(1)));
        assert_eq!(
            NodeOutput::write("c", json!("x")),
            NodeOutput::Writes(vec![("c".to_string(), json!("x"))])
        );
    }
}
