//! Mapping between user-facing values and channel writes.

use super::algo::Channels;
use super::{branch_channel, is_bookkeeping, is_control, END, INTERRUPT, MEMO, RESUME, START, TASKS};
use crate::command::{Command, NodeOutput};
use crate::error::{GraphError, Result};
use crate::graph::{Edges, GraphSpec, NodeSpec};
use crate::interrupt::Interrupt;
use crate::send::Route;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use superstep_checkpoint::PendingWrite;

pub(crate) type Writes = Vec<(String, Value)>;

/// Map a value onto a set of channels
///
/// An object whose keys are all in `channels` writes each key; otherwise the
/// whole value goes to the only channel when there is exactly one. `Null`
/// writes nothing.
fn map_onto(
    owner: &str,
    channels: &BTreeSet<String>,
    value: Value,
    undeclared: impl Fn(&str, &str) -> GraphError,
) -> Result<Writes> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) if map.keys().all(|k| channels.contains(k)) => {
            Ok(map.into_iter().collect())
        }
        value if channels.len() == 1 => {
            let only = channels.iter().next().cloned().unwrap_or_default();
            Ok(vec![(only, value)])
        }
        Value::Object(map) => {
            let key = map
                .keys()
                .find(|k| !channels.contains(*k))
                .cloned()
                .unwrap_or_default();
            Err(undeclared(owner, &key))
        }
        other => Err(GraphError::InvalidInput(format!(
            "'{owner}' produced {other} but has {} channels to write; use an object",
            channels.len()
        ))),
    }
}

/// Writes of the run input onto the input channels
pub(crate) fn map_input(spec: &GraphSpec, input: Value) -> Result<Writes> {
    let channels: BTreeSet<String> = spec.input_channels.iter().cloned().collect();
    map_onto(START, &channels, input, |_, key| {
        GraphError::InvalidInput(format!("'{key}' is not an input channel"))
    })
}

/// Input writes plus the control flow leaving `START`
pub(crate) fn input_writes(spec: &GraphSpec, input: Value) -> Result<Writes> {
    let mut writes = map_input(spec, input)?;
    let view = merged_view(&Value::Null, &writes);
    route_edges(START, &spec.start, &view, &mut writes)?;
    Ok(writes)
}

/// Writes of an out-of-band state update onto any user channel
pub(crate) fn map_state_update(spec: &GraphSpec, values: Value) -> Result<Writes> {
    map_onto(START, &spec.user_channels, values, |_, key| {
        GraphError::InvalidInput(format!("'{key}' is not a channel of this graph"))
    })
}

/// Channel writes of a node update
pub(crate) fn map_update(node: &NodeSpec, update: Value) -> Result<Writes> {
    map_onto(&node.name, &node.write_to, update, |node, channel| {
        GraphError::UndeclaredWrite {
            node: node.to_string(),
            channel: channel.to_string(),
        }
    })
}

/// Writes of a state update applied as if `node` had returned `values`
pub(crate) fn update_as_node(spec: &GraphSpec, node: &NodeSpec, values: Value) -> Result<Writes> {
    resolve_writes(spec, node, &Value::Null, NodeOutput::Update(values))
}

/// Turn a node's output into the full set of writes of its task
///
/// Besides the state writes this adds the control flow: `goto` targets of a
/// command, or else static edges, join participation and router decisions.
pub(crate) fn resolve_writes(
    spec: &GraphSpec,
    node: &NodeSpec,
    input: &Value,
    output: NodeOutput,
) -> Result<Writes> {
    let (mut writes, goto) = match output {
        NodeOutput::Update(update) => (map_update(node, update)?, Vec::new()),
        NodeOutput::Writes(writes) => {
            for (channel, _) in &writes {
                if !node.write_to.contains(channel) {
                    return Err(GraphError::UndeclaredWrite {
                        node: node.name.clone(),
                        channel: channel.clone(),
                    });
                }
            }
            (writes, Vec::new())
        }
        NodeOutput::Command(Command { update, goto }) => {
            let writes = match update {
                Some(update) => map_update(node, update)?,
                None => Vec::new(),
            };
            (writes, goto)
        }
    };

    if goto.is_empty() {
        let view = merged_view(input, &writes);
        route_edges(&node.name, &node.edges, &view, &mut writes)?;
    } else {
        for route in goto {
            if route.target() != END && !node.routes_to.contains(route.target()) {
                return Err(GraphError::UndeclaredWrite {
                    node: node.name.clone(),
                    channel: route.target().to_string(),
                });
            }
            push_route(&node.name, route, &mut writes)?;
        }
    }
    Ok(writes)
}

/// Writes for static edges, joins and routers leaving `from`
pub(crate) fn route_edges(from: &str, edges: &Edges, view: &Value, writes: &mut Writes) -> Result<()> {
    for successor in &edges.successors {
        writes.push((branch_channel(successor), Value::Null));
    }
    for join in &edges.joins {
        writes.push((join.clone(), Value::String(from.to_string())));
    }
    for branch in &edges.branches {
        for route in (branch.router)(view) {
            if !branch.targets.contains(route.target()) && route.target() != END {
                return Err(GraphError::UndeclaredWrite {
                    node: from.to_string(),
                    channel: route.target().to_string(),
                });
            }
            push_route(from, route, writes)?;
        }
    }
    Ok(())
}

fn push_route(from: &str, route: Route, writes: &mut Writes) -> Result<()> {
    match route {
        Route::Node(target) if target == END => {}
        Route::Node(target) => writes.push((branch_channel(&target), Value::Null)),
        Route::Send(send) if send.node == END => {
            return Err(GraphError::UndeclaredWrite {
                node: from.to_string(),
                channel: END.to_string(),
            });
        }
        Route::Send(send) => writes.push((TASKS.to_string(), send.to_value())),
    }
    Ok(())
}

/// Task input with the task's own state writes laid over it
fn merged_view(input: &Value, writes: &Writes) -> Value {
    let mut view = match input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (channel, value) in writes {
        if !is_bookkeeping(channel) && !is_control(channel) {
            view.insert(channel.clone(), value.clone());
        }
    }
    Value::Object(view)
}

/// Output channels that currently hold a value
pub(crate) fn output_values(spec: &GraphSpec, channels: &Channels) -> Value {
    let mut out = Map::new();
    for name in &spec.output_channels {
        if let Some(value) = channels.get(name).and_then(|c| c.get().ok()) {
            out.insert(name.clone(), value);
        }
    }
    Value::Object(out)
}

/// State writes of a task as reported in `Updates` events
///
/// A channel written more than once is reported as the list of its writes.
pub(crate) fn update_payload(writes: &Writes) -> Value {
    let mut out = Map::new();
    let mut repeated: HashMap<&str, Vec<Value>> = HashMap::new();
    for (channel, value) in writes {
        if is_bookkeeping(channel) || is_control(channel) {
            continue;
        }
        repeated.entry(channel.as_str()).or_default().push(value.clone());
    }
    for (channel, mut values) in repeated {
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        };
        out.insert(channel.to_string(), value);
    }
    Value::Object(out)
}

/// What a checkpoint's pending writes say about one task
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordedTask {
    /// Writes of a finished task, including the no-writes marker
    pub writes: Writes,
    pub interrupts: Vec<Interrupt>,
    pub resume: Vec<Value>,
    pub memo: Vec<Value>,
}

impl RecordedTask {
    /// The task finished; it must not run again
    pub(crate) fn is_completed(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Resumable interrupt still waiting for a value
    ///
    /// An interrupt whose suspension index already has a resume value is
    /// answered, even if the task has not run again since.
    pub(crate) fn pending_interrupt(&self) -> Option<&Interrupt> {
        if self.is_completed() {
            return None;
        }
        self.interrupts
            .iter()
            .filter(|i| i.resumable && i.index >= self.resume.len())
            .max_by_key(|i| i.index)
    }

    /// Pending writes persisting this record
    pub(crate) fn to_writes(&self) -> Writes {
        if self.is_completed() {
            return self.writes.clone();
        }
        let mut writes: Writes = self
            .interrupts
            .iter()
            .map(|i| (INTERRUPT.to_string(), i.to_value()))
            .collect();
        writes.push((RESUME.to_string(), Value::Array(self.resume.clone())));
        writes.push((MEMO.to_string(), Value::Array(self.memo.clone())));
        writes
    }
}

/// Group pending writes by task
pub(crate) fn group_pending(pending: &[PendingWrite]) -> HashMap<String, RecordedTask> {
    let mut tasks: HashMap<String, RecordedTask> = HashMap::new();
    for write in pending {
        let task = tasks.entry(write.task_id.clone()).or_default();
        match write.channel.as_str() {
            INTERRUPT => {
                if let Some(interrupt) = Interrupt::from_value(&write.value) {
                    task.interrupts.push(interrupt);
                }
            }
            RESUME => task.resume = as_list(&write.value),
            MEMO => task.memo = as_list(&write.value),
            _ => task.writes.push((write.channel.clone(), write.value.clone())),
        }
    }
    tasks
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(values) => values.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}
