//! Main Pregel execution loop.
//!
//! A [`PregelLoop`] owns the live state of one run on one thread and
//! namespace: the current checkpoint, the channels restored from it and the
//! pending writes recorded against it. It is created from the saver, fed
//! either with input ([`PregelLoop::apply_input`]) or with resume values
//! ([`PregelLoop::prepare_resume`]), and then driven round by round with
//! [`PregelLoop::run`].
//!
//! Live state is only replaced after the saver accepted the checkpoint of a
//! round, so an error at any point leaves the thread at its last committed
//! checkpoint.

use super::algo::{
    apply_writes, changed_versions, check_barriers, clone_channels, create_checkpoint,
    prepare_next_tasks, restore_channels, Channels,
};
use super::executor::{first_error, TaskExecutor, TaskOutcome, TaskResult};
use super::io::{group_pending, input_writes, output_values, RecordedTask, Writes};
use super::types::{PregelTask, TaskPath, TaskWrites};
use super::{INTERRUPT, NO_WRITES, START};
use crate::cache::BaseCache;
use crate::compiled::RunOutput;
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::graph::GraphSpec;
use crate::interrupt::{mark_breakpoints_delivered, should_interrupt, Interrupt, InterruptWhen};
use crate::stream::{EventSink, StreamEvent, StreamMode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use superstep_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
};
use tokio_util::sync::CancellationToken;

/// Path of the pseudo task that applies input and state updates
pub(crate) const INPUT_TASK: &str = "__input__";

/// Dependencies of a run
pub(crate) struct LoopParts {
    pub spec: Arc<GraphSpec>,
    pub checkpointer: Arc<dyn CheckpointSaver>,
    pub cache: Option<Arc<dyn BaseCache>>,
    /// Run configuration with a resolved thread id
    pub config: RunConfig,
    pub sink: EventSink,
}

pub(crate) struct PregelLoop {
    spec: Arc<GraphSpec>,
    checkpointer: Arc<dyn CheckpointSaver>,
    cache: Option<Arc<dyn BaseCache>>,
    config: RunConfig,
    sink: EventSink,
    cancellation: CancellationToken,
    thread_id: String,
    ns: String,

    /// Latest committed checkpoint (empty on a fresh thread)
    checkpoint: Checkpoint,
    /// Address of `checkpoint`; without checkpoint id on a fresh thread
    checkpoint_config: CheckpointConfig,
    channels: Channels,
    /// Pending writes recorded against `checkpoint`, by task id
    pending: HashMap<String, RecordedTask>,
    step: i64,
    start_step: i64,
    /// Rounds committed from here on are resumptions
    resuming: bool,
}

impl PregelLoop {
    /// Load the thread's latest checkpoint, or the one `config` points at
    pub(crate) async fn load(parts: LoopParts) -> Result<Self> {
        let LoopParts {
            spec,
            checkpointer,
            cache,
            config,
            sink,
        } = parts;
        let thread_id = config
            .thread_id
            .clone()
            .ok_or_else(|| GraphError::Configuration("thread_id is required".to_string()))?;
        let ns = config.ns().to_string();
        let address = config.checkpoint_config();

        let (checkpoint, checkpoint_config, pending, step) =
            match checkpointer.get_tuple(&address).await? {
                Some(tuple) => {
                    let step = tuple.metadata.step.unwrap_or(0);
                    let pending = group_pending(&tuple.pending_writes);
                    (tuple.checkpoint, tuple.config, pending, step)
                }
                None if address.checkpoint_id.is_some() => {
                    return Err(GraphError::NoCheckpoint(thread_id));
                }
                None => (Checkpoint::empty(), address, HashMap::new(), -1),
            };
        let channels = restore_channels(&spec, &checkpoint)?;
        let cancellation = config
            .cancellation
            .clone()
            .unwrap_or_else(CancellationToken::new);

        Ok(Self {
            spec,
            checkpointer,
            cache,
            config,
            sink,
            cancellation,
            thread_id,
            ns,
            checkpoint,
            checkpoint_config,
            channels,
            pending,
            step,
            start_step: step,
            resuming: false,
        })
    }

    fn has_checkpoint(&self) -> bool {
        self.checkpoint_config.checkpoint_id.is_some()
    }

    /// Write `input` to the input channels and save the input checkpoint
    ///
    /// Pending writes of the previous checkpoint are discarded.
    pub(crate) async fn apply_input(&mut self, input: Value) -> Result<()> {
        let writes = input_writes(&self.spec, input)?;
        let step = self.step + 1;
        tracing::info!(thread_id = %self.thread_id, ns = %self.ns, step, "Applying input");

        let mut checkpoint = self.checkpoint.clone();
        let mut channels = clone_channels(&self.channels);
        let task = TaskWrites::new(TaskPath::Pull(INPUT_TASK.to_string()), START, writes, Vec::new());
        apply_writes(&mut checkpoint, &mut channels, &[task], false)?;

        self.commit(checkpoint, channels, CheckpointSource::Input, step).await?;
        self.start_step = step;
        Ok(())
    }

    /// Assign resume values to the tasks waiting on interrupts
    ///
    /// Values are matched to pending interrupts in task path order. Fails
    /// with [`GraphError::ResumeMismatch`] before anything runs when the
    /// counts differ.
    pub(crate) fn prepare_resume(&mut self, values: Vec<Value>) -> Result<()> {
        if !self.has_checkpoint() {
            return Err(GraphError::NoCheckpoint(self.thread_id.clone()));
        }
        mark_breakpoints_delivered(&mut self.checkpoint);

        let tasks = prepare_next_tasks(
            &self.spec,
            &self.checkpoint,
            &self.channels,
            &self.ns,
            self.step + 1,
            false,
        )?;
        let waiting: Vec<&PregelTask> = tasks
            .iter()
            .filter(|t| {
                self.pending
                    .get(&t.id)
                    .and_then(RecordedTask::pending_interrupt)
                    .is_some()
            })
            .collect();
        if waiting.len() != values.len() {
            return Err(GraphError::ResumeMismatch {
                expected: waiting.len(),
                supplied: values.len(),
            });
        }

        let ids: Vec<String> = waiting.iter().map(|t| t.id.clone()).collect();
        for (id, value) in ids.into_iter().zip(values) {
            if let Some(record) = self.pending.get_mut(&id) {
                record.resume.push(value);
            }
        }
        tracing::info!(
            thread_id = %self.thread_id,
            ns = %self.ns,
            step = self.step,
            answered = self.pending.values().filter(|r| !r.resume.is_empty()).count(),
            "Resuming"
        );
        self.resuming = true;
        self.start_step = self.step;
        Ok(())
    }

    /// Run rounds until quiescence or an interrupt
    pub(crate) async fn run(&mut self) -> Result<RunOutput> {
        check_barriers(&self.spec)?;
        let interrupts = loop {
            if self.cancellation.is_cancelled() {
                tracing::warn!(thread_id = %self.thread_id, step = self.step, "Run cancelled");
                return Err(GraphError::Cancelled);
            }
            if let Some(interrupts) = self.tick().await? {
                break interrupts;
            }
        };

        if interrupts.is_empty() {
            tracing::info!(thread_id = %self.thread_id, ns = %self.ns, step = self.step, "Run finished");
        } else {
            tracing::info!(
                thread_id = %self.thread_id,
                ns = %self.ns,
                step = self.step,
                interrupts = interrupts.len(),
                "Run interrupted"
            );
            self.sink.emit(StreamEvent::Updates {
                node: INTERRUPT.to_string(),
                update: Value::Array(interrupts.iter().map(Interrupt::to_value).collect()),
                cached: false,
            });
        }

        Ok(RunOutput {
            values: output_values(&self.spec, &self.channels),
            interrupts,
            config: self.checkpoint_config.clone(),
        })
    }

    /// One round; `Some` ends the run with the given interrupts
    async fn tick(&mut self) -> Result<Option<Vec<Interrupt>>> {
        let step = self.step + 1;
        let tasks = prepare_next_tasks(
            &self.spec,
            &self.checkpoint,
            &self.channels,
            &self.ns,
            step,
            true,
        )?;
        if tasks.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let limit = self.config.recursion_limit;
        if step >= self.start_step.saturating_add(i64::try_from(limit).unwrap_or(i64::MAX)) {
            tracing::warn!(thread_id = %self.thread_id, step, limit, "Recursion limit reached");
            return Err(GraphError::RecursionLimit { step, limit });
        }

        if should_interrupt(
            &self.checkpoint,
            tasks.iter().map(|t| t.name.as_str()),
            |node| self.config.interrupts_before(node),
        ) {
            let interrupts = tasks
                .iter()
                .filter(|t| self.config.interrupts_before(&t.name))
                .map(|t| Interrupt::breakpoint(&t.id, &t.name, &self.ns, InterruptWhen::Before))
                .collect();
            return Ok(Some(interrupts));
        }

        tracing::debug!(thread_id = %self.thread_id, step, tasks = tasks.len(), "Starting round");

        let mut reused = Vec::new();
        let mut to_run = Vec::new();
        for task in tasks {
            match self.pending.get(&task.id) {
                Some(record) if record.is_completed() => {
                    tracing::debug!(task = %task.name, id = %task.id, "Reusing recorded writes");
                    let writes = record.writes.clone();
                    reused.push(TaskResult {
                        task,
                        outcome: TaskOutcome::Completed {
                            writes,
                            cached: false,
                        },
                    });
                }
                _ => to_run.push(task),
            }
        }

        let mut results = self.execute(step, to_run).await?;
        if let Some(err) = first_error(&mut results) {
            tracing::warn!(thread_id = %self.thread_id, step, error = %err, "Round aborted");
            return Err(err);
        }

        if results.iter().any(TaskResult::is_suspended) {
            let ran: Vec<PregelTask> = reused
                .iter()
                .chain(&results)
                .map(|r| r.task.clone())
                .collect();
            self.record_suspended(results).await?;
            return Ok(Some(self.pending_interrupts(&ran)));
        }

        results.extend(reused);
        results.sort_by(|a, b| a.task.path.cmp(&b.task.path));
        let ran: Vec<(String, String)> = results
            .iter()
            .map(|r| (r.task.id.clone(), r.task.name.clone()))
            .collect();
        let task_writes: Vec<TaskWrites> = results
            .into_iter()
            .filter_map(|r| match r.outcome {
                TaskOutcome::Completed { writes, .. } => Some(TaskWrites::new(
                    r.task.path,
                    r.task.name,
                    writes,
                    r.task.triggers,
                )),
                _ => None,
            })
            .collect();

        let mut checkpoint = self.checkpoint.clone();
        let mut channels = clone_channels(&self.channels);
        apply_writes(&mut checkpoint, &mut channels, &task_writes, true)?;
        let source = if self.resuming {
            CheckpointSource::Resume
        } else {
            CheckpointSource::Loop
        };
        self.commit(checkpoint, channels, source, step).await?;
        self.resuming = false;

        if should_interrupt(
            &self.checkpoint,
            ran.iter().map(|(_, name)| name.as_str()),
            |node| self.config.interrupts_after(node),
        ) {
            let interrupts = ran
                .iter()
                .filter(|(_, name)| self.config.interrupts_after(name))
                .map(|(id, name)| Interrupt::breakpoint(id, name, &self.ns, InterruptWhen::After))
                .collect();
            return Ok(Some(interrupts));
        }
        Ok(None)
    }

    async fn execute(&self, step: i64, tasks: Vec<PregelTask>) -> Result<Vec<TaskResult>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let executor = TaskExecutor {
            spec: self.spec.clone(),
            checkpointer: self.checkpointer.clone(),
            cache: self.cache.clone(),
            sink: self.sink.clone(),
            thread_id: self.thread_id.clone(),
            ns: self.ns.clone(),
            cancellation: self.cancellation.clone(),
            recursion_limit: self.config.recursion_limit,
            max_concurrency: self.config.max_concurrency,
        };
        let round = executor.run_round(tasks, &self.pending);
        match self.config.step_timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(Duration::from_millis(timeout_ms), round)
                .await
                .map_err(|_| {
                    tracing::warn!(thread_id = %self.thread_id, step, timeout_ms, "Round timed out");
                    GraphError::Timeout { step, timeout_ms }
                }),
            None => Ok(round.await),
        }
    }

    /// Persist what a suspended round produced against the current checkpoint
    async fn record_suspended(&mut self, results: Vec<TaskResult>) -> Result<()> {
        for result in results {
            let id = result.task.id;
            let record = match result.outcome {
                TaskOutcome::Completed { writes, .. } => {
                    let writes: Writes = if writes.is_empty() {
                        vec![(NO_WRITES.to_string(), Value::Null)]
                    } else {
                        writes
                    };
                    RecordedTask {
                        writes,
                        ..RecordedTask::default()
                    }
                }
                TaskOutcome::Suspended {
                    interrupt,
                    resume,
                    memo,
                } => {
                    let mut record = self.pending.remove(&id).unwrap_or_default();
                    record.interrupts.retain(|i| i.index != interrupt.index);
                    record.interrupts.push(interrupt);
                    record.resume = resume;
                    record.memo = memo;
                    record
                }
                // Answers given to a task that did not get to run stay recorded
                TaskOutcome::Skipped => match self.pending.remove(&id) {
                    Some(record) if !record.resume.is_empty() => record,
                    Some(record) => {
                        self.pending.insert(id, record);
                        continue;
                    }
                    None => continue,
                },
                TaskOutcome::Failed(_) => continue,
            };
            self.checkpointer
                .put_writes(&self.checkpoint_config, record.to_writes(), &id)
                .await?;
            self.pending.insert(id, record);
        }
        Ok(())
    }

    /// Unanswered interrupts of `tasks`, in path then suspension order
    fn pending_interrupts(&self, tasks: &[PregelTask]) -> Vec<Interrupt> {
        let mut tasks: Vec<&PregelTask> = tasks.iter().collect();
        tasks.sort_by(|a, b| a.path.cmp(&b.path));
        tasks
            .into_iter()
            .filter_map(|t| self.pending.get(&t.id)?.pending_interrupt().cloned())
            .collect()
    }

    /// Save `checkpoint` as the result of round `step` and make it live
    async fn commit(
        &mut self,
        checkpoint: Checkpoint,
        channels: Channels,
        source: CheckpointSource,
        step: i64,
    ) -> Result<()> {
        let next = create_checkpoint(&checkpoint, &channels);
        let mut metadata = CheckpointMetadata::new().with_source(source).with_step(step);
        for (key, value) in &self.config.metadata {
            metadata = metadata.with_extra(key.clone(), value.clone());
        }
        let new_versions = changed_versions(&self.checkpoint, &next);
        let saved = self
            .checkpointer
            .put(&self.checkpoint_config, next.clone(), metadata.clone(), new_versions)
            .await?;
        tracing::debug!(
            thread_id = %self.thread_id,
            ns = %self.ns,
            step,
            checkpoint_id = %next.id,
            source = ?source,
            "Saved checkpoint"
        );

        self.checkpoint = next;
        self.channels = channels;
        self.checkpoint_config = saved;
        self.pending.clear();
        self.step = step;

        let values = output_values(&self.spec, &self.channels);
        if self.sink.wants(StreamMode::Checkpoints) {
            let next_nodes = prepare_next_tasks(
                &self.spec,
                &self.checkpoint,
                &self.channels,
                &self.ns,
                step + 1,
                false,
            )
            .map(|tasks| unique_names(&tasks))
            .unwrap_or_default();
            self.sink.emit(StreamEvent::Checkpoint {
                config: self.checkpoint_config.clone(),
                metadata,
                values: values.clone(),
                next: next_nodes,
            });
        }
        self.sink.emit(StreamEvent::Values { state: values });
        Ok(())
    }
}

/// Task names in path order, first occurrence only
pub(crate) fn unique_names(tasks: &[PregelTask]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for task in tasks {
        if !names.contains(&task.name) {
            names.push(task.name.clone());
        }
    }
    names
}
