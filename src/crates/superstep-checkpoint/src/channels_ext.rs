//! Round-scoped and barrier channels used for control flow.
//!
//! - [`EphemeralValueChannel`] carries a value into exactly one following
//!   superstep. The engine uses it for edge and redirect bookkeeping.
//! - [`NamedBarrierValueChannel`] releases a join once every named
//!   participant has written.

use crate::channels::Channel;
use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// EphemeralValue channel - value written in one superstep is visible to the
/// next one and cleared when that superstep ends.
#[derive(Debug, Clone)]
pub struct EphemeralValueChannel {
    value: Option<Value>,
    guard: bool,
}

impl EphemeralValueChannel {
    /// Create a guarded channel that rejects more than one write per step
    pub fn new() -> Self {
        Self {
            value: None,
            guard: true,
        }
    }

    /// Create a channel that keeps the last of several writes
    pub fn new_unguarded() -> Self {
        Self {
            value: None,
            guard: false,
        }
    }
}

impl Default for EphemeralValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for EphemeralValueChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("ephemeral".to_string()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(self.value.take().is_some());
        }

        if values.len() > 1 && self.guard {
            return Err(CheckpointError::InvalidUpdate {
                channel: "ephemeral".to_string(),
                reason: format!("received {} values in one step", values.len()),
            });
        }

        self.value = values.into_iter().last();
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn kind(&self) -> &'static str {
        "ephemeral"
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// NamedBarrierValue channel - available only once all expected names wrote.
///
/// Participants may arrive in different supersteps; the set of names seen so
/// far is part of the snapshot. Consuming the channel after the waiting node
/// ran resets it for the next cycle.
#[derive(Debug, Clone)]
pub struct NamedBarrierValueChannel {
    names: BTreeSet<String>,
    seen: BTreeSet<String>,
}

impl NamedBarrierValueChannel {
    /// Create a barrier waiting on the given participant names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            seen: BTreeSet::new(),
        }
    }

    /// Participants this barrier waits on
    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    /// Participants that have written since the last release
    pub fn seen(&self) -> &BTreeSet<String> {
        &self.seen
    }

    fn is_complete(&self) -> bool {
        !self.names.is_empty() && self.seen == self.names
    }
}

impl Channel for NamedBarrierValueChannel {
    fn get(&self) -> Result<Value> {
        if self.is_complete() {
            Ok(Value::Null)
        } else {
            Err(CheckpointError::EmptyChannel(format!(
                "barrier waiting on {:?}",
                self.names.difference(&self.seen).collect::<Vec<_>>()
            )))
        }
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut updated = false;
        for value in values {
            let name = value.as_str().ok_or_else(|| CheckpointError::InvalidUpdate {
                channel: "named_barrier".to_string(),
                reason: format!("expected a participant name, got {value}"),
            })?;
            if !self.names.contains(name) {
                return Err(CheckpointError::InvalidUpdate {
                    channel: "named_barrier".to_string(),
                    reason: format!("unknown participant '{name}'"),
                });
            }
            updated |= self.seen.insert(name.to_string());
        }
        Ok(updated)
    }

    fn checkpoint(&self) -> Option<Value> {
        if self.seen.is_empty() {
            None
        } else {
            Some(Value::Array(
                self.seen.iter().cloned().map(Value::String).collect(),
            ))
        }
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        let Value::Array(seen) = checkpoint else {
            return Err(CheckpointError::Invalid(
                "barrier snapshot must be an array of names".to_string(),
            ));
        };
        self.seen = seen
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.is_complete()
    }

    fn consume(&mut self) -> bool {
        if self.is_complete() {
            self.seen.clear();
            true
        } else {
            false
        }
    }

    fn kind(&self) -> &'static str {
        "named_barrier"
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ephemeral_clears_on_empty_update() {
        let mut channel = EphemeralValueChannel::new();
        assert!(channel.update(vec![json!("go")]).unwrap());
        assert_eq!(channel.get().unwrap(), json!("go"));

        assert!(channel.update(vec![]).unwrap());
        assert!(!channel.is_available());
        assert!(!channel.update(vec![]).unwrap());
    }

    #[test]
    fn test_guarded_ephemeral_rejects_multiple_writes() {
        let mut channel = EphemeralValueChannel::new();
        let result = channel.update(vec![json!(1), json!(2)]);
        assert!(matches!(result, Err(CheckpointError::InvalidUpdate { .. })));

        let mut unguarded = EphemeralValueChannel::new_unguarded();
        unguarded.update(vec![json!(1), json!(2)]).unwrap();
        assert_eq!(unguarded.get().unwrap(), json!(2));
    }

    #[test]
    fn test_barrier_waits_for_all_names() {
        let mut barrier = NamedBarrierValueChannel::new(["a", "b"]);
        assert!(!barrier.is_available());

        assert!(barrier.update(vec![json!("a")]).unwrap());
        assert!(!barrier.is_available());
        assert!(barrier.get().is_err());

        // Duplicate writes do not count twice
        assert!(!barrier.update(vec![json!("a")]).unwrap());

        barrier.update(vec![json!("b")]).unwrap();
        assert!(barrier.is_available());

        assert!(barrier.consume());
        assert!(!barrier.is_available());
        assert!(barrier.seen().is_empty());
    }

    #[test]
    fn test_barrier_rejects_unknown_participant() {
        let mut barrier = NamedBarrierValueChannel::new(["a"]);
        assert!(barrier.update(vec![json!("z")]).is_err());
        assert!(barrier.update(vec![json!(7)]).is_err());
    }

    #[test]
    fn test_barrier_snapshot_keeps_partial_progress() {
        let mut barrier = NamedBarrierValueChannel::new(["a", "b", "c"]);
        barrier.update(vec![json!("c"), json!("a")]).unwrap();

        let snapshot = barrier.checkpoint().unwrap();
        assert_eq!(snapshot, json!(["a", "c"]));

        let mut restored = NamedBarrierValueChannel::new(["a", "b", "c"]);
        restored.from_checkpoint(snapshot).unwrap();
        restored.update(vec![json!("b")]).unwrap();
        assert!(restored.is_available());
    }
}
