//! Interrupt records and static breakpoint detection
//!
//! An [`Interrupt`] is created in two ways:
//!
//! - **In code**: a task calls [`TaskContext::suspend`](crate::TaskContext::suspend).
//!   The interrupt is *resumable*: the value supplied to `resume` becomes the
//!   return value of that `suspend` call when the task is replayed.
//! - **Statically**: the run configuration lists nodes in `interrupt_before` /
//!   `interrupt_after`. These interrupts are not resumable; the thread
//!   continues with `resume(vec![])`.
//!
//! Interrupts are stored as pending writes on the `__interrupt__` channel of
//! the checkpoint they were raised against. Their canonical order is task path
//! order, then suspension index within the task, which is the order resume
//! values are matched in.
//!
//! A breakpoint fires once per change: after a run resumes, every channel
//! version is recorded under `versions_seen["__interrupt__"]`, and
//! [`should_interrupt`] only fires again once some channel moved past it.

use crate::pregel::INTERRUPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use superstep_checkpoint::{ChannelVersion, Checkpoint};
use uuid::Uuid;

const INTERRUPT_NAMESPACE: Uuid = Uuid::from_u128(0x6d3c_1f0e_8a4b_4c2d_9e7f_5a1b_2c3d_4e5f);

/// When an interrupt was raised relative to its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptWhen {
    /// Static breakpoint before the node ran
    Before,
    /// The node suspended itself
    During,
    /// Static breakpoint after the node ran
    After,
}

/// A pause waiting for external input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Deterministic id derived from the task id and suspension index
    pub id: String,

    /// Payload supplied by the task (or the node name for breakpoints)
    pub value: Value,

    /// Whether `resume` must supply a value for it
    pub resumable: bool,

    pub when: InterruptWhen,

    /// Node of the task that raised it
    pub node: String,

    /// Task that raised it
    pub task_id: String,

    /// Suspension index within the task
    pub index: usize,

    /// Checkpoint namespace the task ran in
    #[serde(default)]
    pub ns: String,
}

impl Interrupt {
    /// Interrupt raised by a `suspend` call
    pub fn suspended(
        task_id: &str,
        node: &str,
        ns: &str,
        index: usize,
        value: Value,
    ) -> Self {
        Self {
            id: interrupt_id(task_id, &index.to_string()),
            value,
            resumable: true,
            when: InterruptWhen::During,
            node: node.to_string(),
            task_id: task_id.to_string(),
            index,
            ns: ns.to_string(),
        }
    }

    /// Non-resumable breakpoint interrupt
    pub fn breakpoint(task_id: &str, node: &str, ns: &str, when: InterruptWhen) -> Self {
        let tag = match when {
            InterruptWhen::Before => "before",
            InterruptWhen::During => "during",
            InterruptWhen::After => "after",
        };
        Self {
            id: interrupt_id(task_id, tag),
            value: Value::String(node.to_string()),
            resumable: false,
            when,
            node: node.to_string(),
            task_id: task_id.to_string(),
            index: 0,
            ns: ns.to_string(),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

fn interrupt_id(task_id: &str, tag: &str) -> String {
    Uuid::new_v5(&INTERRUPT_NAMESPACE, format!("{task_id}:{tag}").as_bytes()).to_string()
}

/// Whether a static breakpoint fires for the given tasks
///
/// True when some channel changed since breakpoints were last delivered and
/// at least one task's node is selected by `selects`.
pub fn should_interrupt<'a>(
    checkpoint: &Checkpoint,
    task_nodes: impl IntoIterator<Item = &'a str>,
    selects: impl Fn(&str) -> bool,
) -> bool {
    let seen = checkpoint.versions_seen.get(INTERRUPT);
    let initial = ChannelVersion::initial();
    let any_updates = checkpoint.channel_versions.iter().any(|(channel, version)| {
        let last = seen.and_then(|s| s.get(channel)).unwrap_or(&initial);
        version > last
    });
    any_updates && task_nodes.into_iter().any(selects)
}

/// Record every current channel version as delivered to breakpoints
pub fn mark_breakpoints_delivered(checkpoint: &mut Checkpoint) {
    let versions = checkpoint.channel_versions.clone();
    checkpoint
        .versions_seen
        .insert(INTERRUPT.to_string(), versions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_ids_are_deterministic_per_index() {
        let a = Interrupt::suspended("task-1", "ask", "", 0, json!("q"));
        let b = Interrupt::suspended("task-1", "ask", "", 0, json!("other"));
        let c = Interrupt::suspended("task-1", "ask", "", 1, json!("q"));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.resumable);
        assert_eq!(a.when, InterruptWhen::During);
    }

    #[test]
    fn test_breakpoints_are_not_resumable() {
        let before = Interrupt::breakpoint("task-1", "review", "", InterruptWhen::Before);
        let after = Interrupt::breakpoint("task-1", "review", "", InterruptWhen::After);
        assert!(!before.resumable);
        assert_ne!(before.id, after.id);
        assert_eq!(before.value, json!("review"));
    }

    #[test]
    fn test_value_round_trip() {
        let interrupt = Interrupt::suspended("t", "n", "child:1", 2, json!({"q": 1}));
        assert_eq!(Interrupt::from_value(&interrupt.to_value()), Some(interrupt));
    }

    #[test]
    fn test_should_interrupt_fires_once_per_change() {
        let mut checkpoint = Checkpoint::new(
            HashMap::new(),
            HashMap::from([("a".to_string(), ChannelVersion::Int(1))]),
            HashMap::new(),
        );
        let selects = |node: &str| node == "review";

        assert!(should_interrupt(&checkpoint, ["review"], selects));
        assert!(!should_interrupt(&checkpoint, ["other"], selects));

        mark_breakpoints_delivered(&mut checkpoint);
        assert!(!should_interrupt(&checkpoint, ["review"], selects));

        checkpoint
            .channel_versions
            .insert("a".to_string(), ChannelVersion::Int(2));
        assert!(should_interrupt(&checkpoint, ["review"], selects));
    }
}
