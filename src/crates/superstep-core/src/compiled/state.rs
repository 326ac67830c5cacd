//! State inspection and out-of-band updates

use super::types::{StateSnapshot, TaskSnapshot};
use super::CompiledGraph;
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::pregel::algo::{
    apply_writes, changed_versions, create_checkpoint, prepare_next_tasks, restore_channels,
};
use crate::pregel::io::{group_pending, map_state_update, output_values, update_as_node};
use crate::pregel::loop_impl::{unique_names, INPUT_TASK};
use crate::pregel::types::{TaskPath, TaskState, TaskWrites};
use crate::pregel::{child_namespace, START};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use superstep_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointTuple,
};

impl CompiledGraph {
    /// State of a thread at its latest checkpoint, or at
    /// `config.checkpoint_id`
    ///
    /// `next` and `tasks` describe the round that would run next. With
    /// `include_subgraphs`, tasks of subgraph nodes carry the subgraph's own
    /// snapshot when it has one.
    ///
    /// # Errors
    ///
    /// [`GraphError::NoCheckpoint`] when the thread has no checkpoint.
    pub async fn get_state(&self, config: &RunConfig, include_subgraphs: bool) -> Result<StateSnapshot> {
        let address = address(config)?;
        let tuple = self
            .checkpointer
            .get_tuple(&address)
            .await?
            .ok_or_else(|| GraphError::NoCheckpoint(thread_of(&address)))?;
        self.snapshot(tuple, include_subgraphs).await
    }

    /// Every checkpoint of a thread and namespace, newest first
    pub async fn get_state_history(&self, config: &RunConfig) -> Result<Vec<StateSnapshot>> {
        self.get_state_history_filtered(config, None, None, None).await
    }

    /// Checkpoints of a thread, newest first, matching `filter` on metadata
    /// extras, older than `before`, at most `limit` of them
    pub async fn get_state_history_filtered(
        &self,
        config: &RunConfig,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<StateSnapshot>> {
        let mut address = address(config)?;
        address.checkpoint_id = None;
        let tuples = self
            .checkpointer
            .list(Some(&address), filter, before, limit)
            .await?;
        let mut history = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            history.push(self.snapshot(tuple, false).await?);
        }
        Ok(history)
    }

    /// Write `values` to the thread's channels without running any node.
    ///
    /// Creates a checkpoint with source `update` on top of the latest
    /// checkpoint (or of `config.checkpoint_id`, branching the history).
    /// Nodes subscribed to the written channels run on the next `invoke`
    /// with `Value::Null`. With `config.checkpoint_id` set and `Null` (or
    /// empty) values, the checkpoint is copied into a new branch instead
    /// (source `fork`). Pending writes of the base checkpoint are dropped.
    ///
    /// # Errors
    ///
    /// [`GraphError::InvalidInput`] when a key is not a channel of the graph.
    pub async fn update_state(&self, config: &RunConfig, values: Value) -> Result<CheckpointConfig> {
        self.apply_update(config, values, None).await
    }

    /// Write `values` as if `node` had returned them.
    ///
    /// The values are mapped onto the node's declared output channels, its
    /// static edges and routers are followed, and it is recorded as having
    /// seen its triggers, so it is not planned again for them.
    pub async fn update_state_as_node(
        &self,
        config: &RunConfig,
        values: Value,
        node: &str,
    ) -> Result<CheckpointConfig> {
        self.apply_update(config, values, Some(node)).await
    }

    async fn apply_update(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let address = address(config)?;
        let thread_id = thread_of(&address);
        let _guard = self.locks.acquire(&thread_id, address.ns())?;

        let (base, parent, step) = match self.checkpointer.get_tuple(&address).await? {
            Some(tuple) => {
                let step = tuple.metadata.step.unwrap_or(0);
                (tuple.checkpoint, tuple.config, step)
            }
            None if address.checkpoint_id.is_some() => {
                return Err(GraphError::NoCheckpoint(thread_id));
            }
            None => (Checkpoint::empty(), address.clone(), -1),
        };
        let mut channels = restore_channels(&self.spec, &base)?;

        let is_empty = match &values {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if is_empty && address.checkpoint_id.is_some() && as_node.is_none() {
            let forked = create_checkpoint(&base, &channels);
            let metadata = metadata(config, CheckpointSource::Fork, step + 1);
            let saved = self
                .checkpointer
                .put(&parent, forked, metadata, HashMap::new())
                .await?;
            tracing::info!(thread_id = %thread_id, from = ?address.checkpoint_id, "Forked checkpoint");
            return Ok(saved);
        }

        let task = match as_node {
            Some(name) => {
                let node = self.spec.nodes.get(name).ok_or_else(|| {
                    GraphError::InvalidInput(format!("unknown node '{name}'"))
                })?;
                let writes = update_as_node(&self.spec, node, values)?;
                TaskWrites::new(TaskPath::Pull(name.to_string()), name, writes, node.triggers.clone())
            }
            None => {
                let writes = map_state_update(&self.spec, values)?;
                TaskWrites::new(TaskPath::Pull(INPUT_TASK.to_string()), START, writes, Vec::new())
            }
        };

        let mut checkpoint = base.clone();
        apply_writes(&mut checkpoint, &mut channels, &[task], false)?;
        let next = create_checkpoint(&checkpoint, &channels);
        let new_versions = changed_versions(&base, &next);
        let saved = self
            .checkpointer
            .put(&parent, next, metadata(config, CheckpointSource::Update, step + 1), new_versions)
            .await?;
        tracing::info!(thread_id = %thread_id, as_node = ?as_node, step = step + 1, "Updated state");
        Ok(saved)
    }

    /// Snapshot of a stored checkpoint; boxed because subgraph snapshots
    /// recurse
    fn snapshot(&self, tuple: CheckpointTuple, include_subgraphs: bool) -> BoxFuture<'_, Result<StateSnapshot>> {
        Box::pin(async move {
            let channels = restore_channels(&self.spec, &tuple.checkpoint)?;
            let step = tuple.metadata.step.unwrap_or(0);
            let ns = tuple.config.ns().to_string();
            let tasks = prepare_next_tasks(&self.spec, &tuple.checkpoint, &channels, &ns, step + 1, false)?;
            let pending = group_pending(&tuple.pending_writes);

            let mut snapshots = Vec::with_capacity(tasks.len());
            for task in &tasks {
                let record = pending.get(&task.id);
                let interrupts: Vec<_> = record
                    .and_then(|r| r.pending_interrupt())
                    .cloned()
                    .into_iter()
                    .collect();
                let state = match record {
                    Some(r) if r.is_completed() => TaskState::Completed,
                    _ if !interrupts.is_empty() => TaskState::Interrupted,
                    _ => TaskState::Pending,
                };

                let subgraph_state = match self.spec.nodes.get(&task.name).and_then(|n| n.subgraph.as_ref()) {
                    Some(child) if include_subgraphs => {
                        let child = child.clone().with_checkpointer(self.checkpointer.clone());
                        let child_config = RunConfig::new()
                            .with_thread_id(thread_of(&tuple.config))
                            .with_checkpoint_ns(child_namespace(&ns, &task.name, &task.id));
                        let address = child_config.checkpoint_config();
                        match child.checkpointer.get_tuple(&address).await? {
                            Some(child_tuple) => Some(Box::new(child.snapshot(child_tuple, true).await?)),
                            None => None,
                        }
                    }
                    _ => None,
                };

                snapshots.push(TaskSnapshot {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    path: task.path.clone(),
                    state,
                    interrupts,
                    subgraph_state,
                });
            }

            Ok(StateSnapshot {
                values: output_values(&self.spec, &channels),
                next: unique_names(&tasks),
                tasks: snapshots,
                created_at: tuple.checkpoint.ts,
                config: tuple.config,
                metadata: tuple.metadata,
                parent_config: tuple.parent_config,
                checkpoint: tuple.checkpoint,
            })
        })
    }
}

fn address(config: &RunConfig) -> Result<CheckpointConfig> {
    let address = config.checkpoint_config();
    if address.thread_id.is_none() {
        return Err(GraphError::Configuration("thread_id is required".to_string()));
    }
    Ok(address)
}

fn thread_of(config: &CheckpointConfig) -> String {
    config.thread_id.clone().unwrap_or_default()
}

fn metadata(config: &RunConfig, source: CheckpointSource, step: i64) -> CheckpointMetadata {
    config
        .metadata
        .iter()
        .fold(CheckpointMetadata::new().with_source(source).with_step(step), |m, (k, v)| {
            m.with_extra(k.clone(), v.clone())
        })
}
