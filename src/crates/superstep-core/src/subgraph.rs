//! Compiled graphs running as nodes of another graph
//!
//! A subgraph node runs its child graph on the parent's thread, in a
//! checkpoint namespace of its own derived from the parent task:
//!
//! ```text
//! parent ns ""          ──► task "review" (id t1)
//! child ns "review:t1"  ──► task "ask" (id t2)
//! grandchild ns "review:t1|ask:t2"
//! ```
//!
//! The child checkpoints into the parent's saver and streams into the
//! parent's stream, tagged with its namespace.
//!
//! # Interrupts
//!
//! When the child stops at an interrupt, the subgraph task suspends with the
//! child's interrupt value as payload (a list when the child has several),
//! so the interrupt surfaces in the parent run. Resuming the parent re-runs
//! the task, which resumes the child with the supplied value. A list value
//! answers several child interrupts at once, in the child's order.

use crate::command::NodeOutput;
use crate::compiled::{CompiledGraph, RunRequest};
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::graph::Node;
use crate::pregel::child_namespace;
use crate::runtime::TaskContext;
use async_trait::async_trait;
use serde_json::Value;

/// Node body running a compiled graph
#[derive(Clone, Debug)]
pub struct SubgraphNode {
    graph: CompiledGraph,
}

impl SubgraphNode {
    pub fn new(graph: CompiledGraph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }
}

#[async_trait]
impl Node for SubgraphNode {
    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<NodeOutput> {
        let ns = child_namespace(ctx.checkpoint_ns(), ctx.node(), ctx.task_id());
        let child = self.graph.clone().with_checkpointer(ctx.checkpointer());
        let config = RunConfig::new()
            .with_thread_id(ctx.thread_id())
            .with_checkpoint_ns(ns.clone())
            .with_recursion_limit(ctx.recursion_limit())
            .with_cancellation(ctx.cancellation_token().clone());
        let sink = ctx.sink().with_namespace(&ns);

        let answers = ctx.resume_values();
        let state = match child.get_state(&config, false).await {
            Ok(state) => Some(state),
            Err(GraphError::NoCheckpoint(_)) => None,
            Err(err) => return Err(err),
        };
        let waiting = state.as_ref().map_or(0, |s| s.interrupts().len());

        let request = match (answers.last(), &state) {
            (Some(answer), _) if waiting > 0 => {
                ctx.advance_suspend_index(answers.len());
                RunRequest::Resume(split_answer(answer.clone(), waiting)?)
            }
            (Some(_), Some(state)) if state.next.is_empty() => {
                tracing::debug!(ns = %ns, "Subgraph already finished");
                return Ok(NodeOutput::Update(state.values.clone()));
            }
            _ => RunRequest::Input(input),
        };

        tracing::debug!(ns = %ns, node = ctx.node(), "Running subgraph");
        let output = child.execute(request, config, sink).await?;
        if output.is_interrupted() {
            let mut values: Vec<Value> = output.interrupts.into_iter().map(|i| i.value).collect();
            let payload = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            ctx.suspend(payload)?;
        }
        Ok(NodeOutput::Update(output.values))
    }
}

/// Resume values for `waiting` child interrupts from one parent answer
fn split_answer(answer: Value, waiting: usize) -> Result<Vec<Value>> {
    if waiting == 1 {
        return Ok(vec![answer]);
    }
    match answer {
        Value::Array(values) if values.len() == waiting => Ok(values),
        _ => Err(GraphError::ResumeMismatch {
            expected: waiting,
            supplied: 1,
        }),
    }
}
