//! Task executor for Pregel tasks.

use super::io::{resolve_writes, update_payload, RecordedTask, Writes};
use super::types::PregelTask;
use crate::cache::BaseCache;
use crate::error::GraphError;
use crate::graph::GraphSpec;
use crate::interrupt::Interrupt;
use crate::runtime::{Scratchpad, TaskContext, TaskContextParts};
use crate::stream::{EventSink, StreamEvent};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use superstep_checkpoint::CheckpointSaver;
use tokio_util::sync::CancellationToken;

/// How a task of a round ended
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Completed {
        writes: Writes,
        cached: bool,
    },
    Suspended {
        interrupt: Interrupt,
        resume: Vec<Value>,
        memo: Vec<Value>,
    },
    /// Not started because another task of the round suspended or failed
    Skipped,
    Failed(GraphError),
}

#[derive(Debug)]
pub(crate) struct TaskResult {
    pub task: PregelTask,
    pub outcome: TaskOutcome,
}

/// Everything a round's tasks share
pub(crate) struct TaskExecutor {
    pub spec: Arc<GraphSpec>,
    pub checkpointer: Arc<dyn CheckpointSaver>,
    pub cache: Option<Arc<dyn BaseCache>>,
    pub sink: EventSink,
    pub thread_id: String,
    pub ns: String,
    pub cancellation: CancellationToken,
    pub recursion_limit: usize,
    pub max_concurrency: Option<usize>,
}

impl TaskExecutor {
    /// Run `tasks` concurrently and collect their outcomes in path order
    ///
    /// `recorded` supplies resume values and memoized results of tasks that
    /// suspended before. Once a task suspends or fails, tasks that have not
    /// started yet are skipped; tasks already running finish.
    pub(crate) async fn run_round(
        &self,
        tasks: Vec<PregelTask>,
        recorded: &HashMap<String, RecordedTask>,
    ) -> Vec<TaskResult> {
        let limit = self.max_concurrency.unwrap_or(tasks.len()).max(1);
        let halted = AtomicBool::new(false);
        let halted = &halted;

        let mut results: Vec<TaskResult> = stream::iter(tasks.into_iter().map(|task| {
            let scratchpad = match recorded.get(&task.id) {
                Some(rec) => Scratchpad::new(rec.resume.clone(), rec.memo.clone()),
                None => Scratchpad::default(),
            };
            async move {
                if halted.load(Ordering::SeqCst) {
                    tracing::debug!(task = %task.name, id = %task.id, "Skipping task after halt");
                    return TaskResult {
                        task,
                        outcome: TaskOutcome::Skipped,
                    };
                }
                let outcome = self.execute(&task, scratchpad).await;
                if matches!(outcome, TaskOutcome::Suspended { .. } | TaskOutcome::Failed(_)) {
                    halted.store(true, Ordering::SeqCst);
                }
                TaskResult { task, outcome }
            }
        }))
        .buffer_unordered(limit)
        .collect()
        .await;

        results.sort_by(|a, b| a.task.path.cmp(&b.task.path));
        results
    }

    async fn execute(&self, task: &PregelTask, scratchpad: Scratchpad) -> TaskOutcome {
        let Some(node) = self.spec.nodes.get(&task.name) else {
            return TaskOutcome::Failed(GraphError::Planning(format!(
                "task planned for unknown node '{}'",
                task.name
            )));
        };

        tracing::debug!(task = %task.name, id = %task.id, step = task.step, path = %task.path, "Executing task");
        self.sink.emit(StreamEvent::TaskStart {
            id: task.id.clone(),
            node: task.name.clone(),
            step: task.step,
            input: task.input.clone(),
        });

        if let Some(writes) = self.cached_writes(task).await {
            tracing::debug!(task = %task.name, id = %task.id, "Cache hit");
            self.finish(task, &writes, true);
            return TaskOutcome::Completed {
                writes,
                cached: true,
            };
        }

        let ctx = TaskContext::new(TaskContextParts {
            task_id: task.id.clone(),
            node: task.name.clone(),
            step: task.step,
            path: task.path.clone(),
            thread_id: self.thread_id.clone(),
            ns: self.ns.clone(),
            checkpointer: self.checkpointer.clone(),
            sink: self.sink.clone(),
            cancellation: self.cancellation.clone(),
            recursion_limit: self.recursion_limit,
            scratchpad,
        });

        let result = node.body.execute(task.input.clone(), ctx.clone()).await;
        let suspension = ctx.take_suspension();

        let output = match (result, suspension) {
            (Err(err), _) if !err.is_suspension() => return self.fail(task, err.in_node(&task.name)),
            (_, Some((interrupt, resume, memo))) => {
                tracing::info!(task = %task.name, id = %task.id, index = interrupt.index, "Task suspended");
                return TaskOutcome::Suspended {
                    interrupt,
                    resume,
                    memo,
                };
            }
            (Err(_), None) => {
                return self.fail(
                    task,
                    GraphError::NodeExecution {
                        node: task.name.clone(),
                        error: "suspended without TaskContext::suspend".to_string(),
                    },
                )
            }
            (Ok(output), None) => output,
        };

        let writes = match resolve_writes(&self.spec, node, &task.input, output) {
            Ok(writes) => writes,
            Err(err) => return self.fail(task, err),
        };

        if let (Some(cache), Some(key), Some(policy)) =
            (&self.cache, &task.cache_key, &node.cache_policy)
        {
            let entry = Value::Array(
                writes
                    .iter()
                    .map(|(channel, value)| Value::Array(vec![Value::String(channel.clone()), value.clone()]))
                    .collect(),
            );
            if let Err(err) = cache.put(key.clone(), entry, policy.ttl).await {
                tracing::warn!(task = %task.name, error = %err, "Failed to store cached writes");
            }
        }

        self.finish(task, &writes, false);
        TaskOutcome::Completed {
            writes,
            cached: false,
        }
    }

    async fn cached_writes(&self, task: &PregelTask) -> Option<Writes> {
        let (cache, key) = (self.cache.as_ref()?, task.cache_key.as_ref()?);
        match cache.get(key).await {
            Ok(Some(Value::Array(entries))) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::Array(mut pair) if pair.len() == 2 => {
                        let value = pair.pop()?;
                        let channel = pair.pop()?.as_str()?.to_string();
                        Some((channel, value))
                    }
                    _ => None,
                })
                .collect(),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(task = %task.name, error = %err, "Cache lookup failed");
                None
            }
        }
    }

    fn finish(&self, task: &PregelTask, writes: &Writes, cached: bool) {
        let update = update_payload(writes);
        self.sink.emit(StreamEvent::Updates {
            node: task.name.clone(),
            update: update.clone(),
            cached,
        });
        self.sink.emit(StreamEvent::TaskEnd {
            id: task.id.clone(),
            node: task.name.clone(),
            step: task.step,
            result: update,
            cached,
        });
    }

    fn fail(&self, task: &PregelTask, err: GraphError) -> TaskOutcome {
        tracing::warn!(task = %task.name, id = %task.id, error = %err, "Task failed");
        self.sink.emit(StreamEvent::TaskError {
            id: task.id.clone(),
            node: task.name.clone(),
            step: task.step,
            error: err.to_string(),
        });
        TaskOutcome::Failed(err)
    }
}

/// First failure of a round, if any
pub(crate) fn first_error(results: &mut [TaskResult]) -> Option<GraphError> {
    results.iter_mut().find_map(|r| {
        match std::mem::replace(&mut r.outcome, TaskOutcome::Skipped) {
            TaskOutcome::Failed(err) => Some(err),
            other => {
                r.outcome = other;
                None
            }
        }
    })
}

impl TaskResult {
    pub(crate) fn is_suspended(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Suspended { .. })
    }
}
