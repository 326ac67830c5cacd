//! Core Pregel algorithm functions.
//!
//! - [`prepare_next_tasks`] decides which tasks run in the next round, from
//!   channel versions and the versions each node has already seen;
//! - [`apply_writes`] applies the buffered writes of a finished round in
//!   deterministic order and bumps versions;
//! - [`check_barriers`] rejects joins that can never complete.
//!
//! Both planning and write application are pure functions of a checkpoint and
//! its channels, which is what makes resume and replay produce the same task
//! ids and the same state.

use super::types::{PregelTask, TaskPath, TaskWrites};
use super::{is_control, TASKS};
use crate::error::{GraphError, Result};
use crate::graph::GraphSpec;
use crate::send::Send;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use superstep_checkpoint::{Channel, ChannelVersion, ChannelVersions, Checkpoint};
use uuid::Uuid;

/// Live channels of a run, keyed by name
pub(crate) type Channels = BTreeMap<String, Box<dyn Channel>>;

const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x9c41_02d7_3e6a_4b58_8f1e_7d2c_6a0b_5e93);

/// Fresh channels restored from a checkpoint
pub(crate) fn restore_channels(spec: &GraphSpec, checkpoint: &Checkpoint) -> Result<Channels> {
    spec.channels
        .iter()
        .map(|(name, prototype)| -> Result<(String, Box<dyn Channel>)> {
            let mut channel = prototype.clone_box();
            if let Some(value) = checkpoint.channel_values.get(name) {
                channel.from_checkpoint(value.clone())?;
            }
            Ok((name.clone(), channel))
        })
        .collect()
}

/// Deep copy; the copy shares no mutable state with `channels`
pub(crate) fn clone_channels(channels: &Channels) -> Channels {
    channels
        .iter()
        .map(|(name, channel)| (name.clone(), channel.clone_box()))
        .collect()
}

/// New checkpoint carrying `base`'s versions and the channels' snapshots
pub(crate) fn create_checkpoint(base: &Checkpoint, channels: &Channels) -> Checkpoint {
    let values = channels
        .iter()
        .filter_map(|(name, channel)| channel.checkpoint().map(|v| (name.clone(), v)))
        .collect();
    let mut checkpoint = Checkpoint::new(
        values,
        base.channel_versions.clone(),
        base.versions_seen.clone(),
    );
    checkpoint.updated_channels = base.updated_channels.clone();
    checkpoint
}

/// Versions that differ between two checkpoints
pub(crate) fn changed_versions(previous: &Checkpoint, next: &Checkpoint) -> ChannelVersions {
    next.channel_versions
        .iter()
        .filter(|(name, version)| previous.channel_versions.get(*name) != Some(*version))
        .map(|(name, version)| (name.clone(), version.clone()))
        .collect()
}

/// Apply the writes of one round to `channels` and `checkpoint`.
///
/// Steps:
///
/// 1. sort tasks by path so the outcome does not depend on completion order;
/// 2. record the trigger versions each task has now seen;
/// 3. consume trigger channels (releases barriers);
/// 4. group writes per channel, in task order, skipping control writes;
/// 5. update each written channel, bumping its version when it changed;
/// 6. with `bump_step`, notify every untouched available channel of the
///    round boundary so round-scoped channels reset.
///
/// Every version bumped in one call gets the same new version, one above the
/// current maximum. Returns the channels updated by writes.
pub(crate) fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut Channels,
    tasks: &[TaskWrites],
    bump_step: bool,
) -> Result<Vec<String>> {
    // 1. Deterministic order
    let mut tasks: Vec<&TaskWrites> = tasks.iter().collect();
    tasks.sort_by(|a, b| a.path.cmp(&b.path));

    // 2. Versions seen
    for task in &tasks {
        let seen = checkpoint.versions_seen.entry(task.name.clone()).or_default();
        for channel in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(channel) {
                seen.insert(channel.clone(), version.clone());
            }
        }
    }

    let next_version = checkpoint
        .max_version()
        .cloned()
        .unwrap_or_default()
        .next();

    // 3. Consume triggers
    let triggers: BTreeSet<&str> = tasks
        .iter()
        .flat_map(|t| t.triggers.iter().map(String::as_str))
        .collect();
    for name in triggers {
        if let Some(channel) = channels.get_mut(name) {
            if channel.consume() {
                checkpoint
                    .channel_versions
                    .insert(name.to_string(), next_version.clone());
            }
        }
    }

    // 4. Group writes
    let mut grouped: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for task in &tasks {
        for (channel, value) in &task.writes {
            if is_control(channel) {
                continue;
            }
            grouped.entry(channel.as_str()).or_default().push(value.clone());
        }
    }

    // 5. Update written channels
    let mut updated = Vec::new();
    for (name, values) in grouped {
        let Some(channel) = channels.get_mut(name) else {
            tracing::warn!(channel = name, "Dropping writes to unknown channel");
            continue;
        };
        if channel.update(values)? {
            checkpoint
                .channel_versions
                .insert(name.to_string(), next_version.clone());
            updated.push(name.to_string());
        }
    }

    // 6. Round boundary
    if bump_step {
        for (name, channel) in channels.iter_mut() {
            if updated.contains(name) || !channel.is_available() {
                continue;
            }
            if channel.update(Vec::new())? {
                checkpoint
                    .channel_versions
                    .insert(name.clone(), next_version.clone());
            }
        }
    }

    checkpoint.updated_channels = Some(updated.clone());
    Ok(updated)
}

fn version_key(version: &ChannelVersion) -> String {
    match version {
        ChannelVersion::Int(v) => v.to_string(),
        ChannelVersion::String(s) => s.clone(),
    }
}

fn task_id(parts: &[&str]) -> String {
    Uuid::new_v5(&TASK_NAMESPACE, parts.join("|").as_bytes()).to_string()
}

/// Plan the tasks of round `step` from the state in `checkpoint`.
///
/// A pull task is planned for a node when one of its trigger channels is
/// available and holds a version newer than the one recorded in
/// `versions_seen` for that node. Every packet in the `__tasks__` topic
/// becomes a push task. Tasks come back in path order: pull tasks by node
/// name, then push tasks by packet index.
///
/// Task ids are derived from the namespace, the step, the node and the
/// trigger versions (pull) or packet index and payload (push), so planning
/// the same checkpoint again yields the same ids.
///
/// With `for_execution`, a `read_from` channel without a value fails with
/// [`GraphError::EmptyChannel`]; otherwise it is left out of the input.
pub(crate) fn prepare_next_tasks(
    spec: &GraphSpec,
    checkpoint: &Checkpoint,
    channels: &Channels,
    ns: &str,
    step: i64,
    for_execution: bool,
) -> Result<Vec<PregelTask>> {
    let step_key = step.to_string();
    let initial = ChannelVersion::initial();
    let mut tasks = Vec::new();

    for (name, node) in &spec.nodes {
        let seen = checkpoint.versions_seen.get(name);
        let triggered = node.triggers.iter().any(|channel| {
            let available = channels.get(channel).map_or(false, |c| c.is_available());
            let current = checkpoint.channel_versions.get(channel).unwrap_or(&initial);
            let last = seen.and_then(|s| s.get(channel)).unwrap_or(&initial);
            available && current > last
        });
        if !triggered {
            continue;
        }

        let mut input = Map::new();
        for channel in &node.subscribe_to {
            if let Some(value) = channels.get(channel).and_then(|c| c.get().ok()) {
                input.insert(channel.clone(), value);
            }
        }
        for channel in &node.read_from {
            match channels.get(channel).map(|c| c.get()) {
                Some(Ok(value)) => {
                    input.insert(channel.clone(), value);
                }
                _ if for_execution => {
                    return Err(GraphError::EmptyChannel {
                        node: name.clone(),
                        channel: channel.clone(),
                    });
                }
                _ => {}
            }
        }
        let input = Value::Object(input);

        let versions: Vec<String> = node
            .triggers
            .iter()
            .filter_map(|channel| {
                checkpoint
                    .channel_versions
                    .get(channel)
                    .map(|v| format!("{channel}:{}", version_key(v)))
            })
            .collect();
        let id = task_id(&[ns, &step_key, name, "pull", &versions.join(",")]);

        tasks.push(PregelTask {
            id,
            name: name.clone(),
            path: TaskPath::Pull(name.clone()),
            step,
            cache_key: node.cache_policy.as_ref().map(|p| p.key_for(name, &input)),
            input,
            triggers: node.triggers.clone(),
        });
    }

    let packets = match channels.get(TASKS).map(|c| c.get()) {
        Some(Ok(Value::Array(packets))) => packets,
        _ => Vec::new(),
    };
    for (idx, packet) in packets.iter().enumerate() {
        let send = Send::from_value(packet).ok_or_else(|| {
            GraphError::Planning(format!("malformed task packet {packet}"))
        })?;
        let node = spec.nodes.get(&send.node).ok_or_else(|| {
            GraphError::Planning(format!("task packet addressed to unknown node '{}'", send.node))
        })?;
        let id = task_id(&[
            ns,
            &step_key,
            &send.node,
            "push",
            &idx.to_string(),
            &send.arg.to_string(),
        ]);
        tasks.push(PregelTask {
            id,
            name: send.node.clone(),
            path: TaskPath::Push(idx),
            step,
            cache_key: node
                .cache_policy
                .as_ref()
                .map(|p| p.key_for(&send.node, &send.arg)),
            input: send.arg,
            triggers: Vec::new(),
        });
    }

    Ok(tasks)
}

/// Reject joins with a source that can only run after the join released
pub(crate) fn check_barriers(spec: &GraphSpec) -> Result<()> {
    for join in &spec.joins {
        let reachable = spec.reachable(Some(&join.target));
        if let Some(source) = join.sources.iter().find(|s| !reachable.contains(*s)) {
            return Err(GraphError::Planning(format!(
                "join '{}' can never complete: '{source}' only runs after '{}'",
                join.channel, join.target
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NodeOutput;
    use crate::graph::{GraphBuilder, NodeBuilder};
    use crate::pregel::branch_channel;
    use crate::runtime::TaskContext;
    use proptest::prelude::*;
    use serde_json::json;
    use superstep_checkpoint::{BinaryOperatorChannel, LastValueChannel};

    async fn noop(_input: Value, _ctx: TaskContext) -> Result<NodeOutput> {
        Ok(NodeOutput::empty())
    }

    fn writes(path: TaskPath, name: &str, writes: Vec<(&str, Value)>) -> TaskWrites {
        TaskWrites::new(
            path,
            name,
            writes.into_iter().map(|(c, v)| (c.to_string(), v)).collect(),
            Vec::new(),
        )
    }

    fn channels() -> Channels {
        let mut channels: Channels = BTreeMap::new();
        channels.insert("last".into(), Box::new(LastValueChannel::new()));
        channels.insert("total".into(), Box::new(BinaryOperatorChannel::sum()));
        channels
    }

    #[test]
    fn test_apply_writes_in_path_order() {
        let mut checkpoint = Checkpoint::empty();
        let mut channels = channels();
        let tasks = vec![
            writes(TaskPath::Push(0), "w", vec![("last", json!("push")), ("total", json!(2))]),
            writes(TaskPath::Pull("b".into()), "b", vec![("last", json!("b"))]),
            writes(TaskPath::Pull("a".into()), "a", vec![("total", json!(1))]),
        ];

        let updated = apply_writes(&mut checkpoint, &mut channels, &tasks, true).unwrap();
        assert_eq!(updated, vec!["last", "total"]);
        assert_eq!(channels["last"].get().unwrap(), json!("push"));
        assert_eq!(channels["total"].get().unwrap(), json!(3));
        assert_eq!(checkpoint.channel_versions["last"], ChannelVersion::Int(1));
    }

    #[test]
    fn test_apply_writes_skips_control_channels() {
        let mut checkpoint = Checkpoint::empty();
        let mut channels = channels();
        let tasks = vec![writes(
            TaskPath::Pull("a".into()),
            "a",
            vec![("__interrupt__", json!({})), ("__no_writes__", json!(null))],
        )];
        let updated = apply_writes(&mut checkpoint, &mut channels, &tasks, true).unwrap();
        assert!(updated.is_empty());
        assert!(checkpoint.channel_versions.is_empty());
    }

    #[test]
    fn test_versions_increase_monotonically() {
        let mut checkpoint = Checkpoint::empty();
        let mut channels = channels();
        for expected in 1..=3 {
            let tasks = vec![writes(TaskPath::Pull("a".into()), "a", vec![("total", json!(1))])];
            apply_writes(&mut checkpoint, &mut channels, &tasks, true).unwrap();
            assert_eq!(checkpoint.channel_versions["total"], ChannelVersion::Int(expected));
        }
    }

    fn chain() -> crate::CompiledGraph {
        let mut builder = GraphBuilder::new();
        builder
            .add_channel("x", LastValueChannel::new())
            .add_channel("y", LastValueChannel::new())
            .add_node(NodeBuilder::new("a", noop).subscribe_to(["x"]).write_to(["y"]))
            .add_node(NodeBuilder::new("b", noop).subscribe_to(["y"]).read_from(["x"]))
            .set_input_channels(["x"]);
        builder.compile().unwrap()
    }

    #[test]
    fn test_prepare_plans_triggered_nodes_once() {
        let graph = chain();
        let spec = graph.spec();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = restore_channels(spec, &checkpoint).unwrap();

        let input = vec![writes(TaskPath::Pull("__input__".into()), "__start__", vec![("x", json!(1))])];
        apply_writes(&mut checkpoint, &mut channels, &input, false).unwrap();

        let tasks = prepare_next_tasks(spec, &checkpoint, &channels, "", 1, true).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "a");
        assert_eq!(tasks[0].input, json!({"x": 1}));

        // Same state plans the same ids
        let again = prepare_next_tasks(spec, &checkpoint, &channels, "", 1, true).unwrap();
        assert_eq!(tasks[0].id, again[0].id);

        let done = vec![TaskWrites::new(
            tasks[0].path.clone(),
            "a",
            vec![("y".to_string(), json!(2))],
            tasks[0].triggers.clone(),
        )];
        apply_writes(&mut checkpoint, &mut channels, &done, true).unwrap();
        let next = prepare_next_tasks(spec, &checkpoint, &channels, "", 2, true).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name, "b");
        assert_eq!(next[0].input, json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_missing_read_channel_fails_only_for_execution() {
        let graph = chain();
        let spec = graph.spec();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = restore_channels(spec, &checkpoint).unwrap();
        let input = vec![writes(TaskPath::Pull("__input__".into()), "__start__", vec![("y", json!(1))])];
        apply_writes(&mut checkpoint, &mut channels, &input, false).unwrap();

        let err = prepare_next_tasks(spec, &checkpoint, &channels, "", 1, true).unwrap_err();
        assert!(matches!(err, GraphError::EmptyChannel { node, channel } if node == "b" && channel == "x"));

        let tasks = prepare_next_tasks(spec, &checkpoint, &channels, "", 1, false).unwrap();
        assert_eq!(tasks[0].input, json!({"y": 1}));
    }

    #[test]
    fn test_push_tasks_follow_pull_tasks() {
        let graph = chain();
        let spec = graph.spec();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = restore_channels(spec, &checkpoint).unwrap();
        let input = vec![writes(
            TaskPath::Pull("__input__".into()),
            "__start__",
            vec![
                ("x", json!(0)),
                (TASKS, json!({"node": "b", "arg": 1})),
                (TASKS, json!({"node": "b", "arg": 2})),
            ],
        )];
        apply_writes(&mut checkpoint, &mut channels, &input, false).unwrap();

        let tasks = prepare_next_tasks(spec, &checkpoint, &channels, "", 1, true).unwrap();
        let paths: Vec<_> = tasks.iter().map(|t| t.path.clone()).collect();
        assert_eq!(
            paths,
            vec![TaskPath::Pull("a".into()), TaskPath::Push(0), TaskPath::Push(1)]
        );
        assert_eq!(tasks[2].input, json!(2));
        assert_ne!(tasks[1].id, tasks[2].id);
    }

    #[test]
    fn test_branch_channels_clear_after_one_round() {
        let graph = chain();
        let spec = graph.spec();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = restore_channels(spec, &checkpoint).unwrap();
        let branch = branch_channel("b");

        let round = vec![writes(TaskPath::Pull("a".into()), "a", vec![(branch.as_str(), json!(null))])];
        apply_writes(&mut checkpoint, &mut channels, &round, true).unwrap();
        assert!(channels[&branch].is_available());

        apply_writes(&mut checkpoint, &mut channels, &[], true).unwrap();
        assert!(!channels[&branch].is_available());
    }

    #[test]
    fn test_check_barriers() {
        let mut builder = GraphBuilder::new();
        builder
            .add_channel("x", LastValueChannel::new())
            .add_node(NodeBuilder::new("a", noop))
            .add_node(NodeBuilder::new("b", noop))
            .add_node(NodeBuilder::new("c", noop))
            .set_entry_point("a")
            .add_edge("a", "b")
            .add_join(["a", "b"], "c");
        assert!(check_barriers(builder.compile().unwrap().spec()).is_ok());

        let mut builder = GraphBuilder::new();
        builder
            .add_channel("x", LastValueChannel::new())
            .add_node(NodeBuilder::new("a", noop))
            .add_node(NodeBuilder::new("b", noop))
            .add_node(NodeBuilder::new("c", noop))
            .set_entry_point("a")
            .add_edge("c", "b")
            .add_join(["a", "b"], "c");
        assert!(matches!(
            check_barriers(builder.compile().unwrap().spec()),
            Err(GraphError::Planning(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_apply_order_does_not_depend_on_completion_order(
            order in Just((0..6).collect::<Vec<usize>>()).prop_shuffle()
        ) {
            let round: Vec<TaskWrites> = (0..6)
                .map(|i| writes(
                    TaskPath::Pull(format!("n{i}")),
                    &format!("n{i}"),
                    vec![("last", json!(i)), ("total", json!(i))],
                ))
                .collect();
            let shuffled: Vec<TaskWrites> = order.iter().map(|&i| round[i].clone()).collect();

            let (mut sorted_cp, mut sorted_ch) = (Checkpoint::empty(), channels());
            apply_writes(&mut sorted_cp, &mut sorted_ch, &round, true).unwrap();
            let (mut shuffled_cp, mut shuffled_ch) = (Checkpoint::empty(), channels());
            apply_writes(&mut shuffled_cp, &mut shuffled_ch, &shuffled, true).unwrap();

            prop_assert_eq!(sorted_ch["last"].get().unwrap(), json!(5));
            prop_assert_eq!(sorted_ch["last"].get().unwrap(), shuffled_ch["last"].get().unwrap());
            prop_assert_eq!(sorted_ch["total"].get().unwrap(), shuffled_ch["total"].get().unwrap());
            prop_assert_eq!(sorted_cp.channel_versions, shuffled_cp.channel_versions);
        }
    }
}
