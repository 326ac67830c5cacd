//! Per-task execution context
//!
//! Every node body receives a [`TaskContext`] next to its input. There is no
//! ambient "current run": everything a task may need from the engine is
//! reachable from here.
//!
//! - identity: task id, node name, step, thread id and checkpoint namespace;
//! - [`TaskContext::suspend`] to pause for external input;
//! - [`TaskContext::memoize`] to make non-deterministic work stable across
//!   replays;
//! - [`StreamWriter`] methods to emit custom data and token chunks;
//! - the run's cancellation token for cooperative cancellation.
//!
//! # Suspending
//!
//! ```rust,ignore
//! graph.add_node(NodeBuilder::new("approve", |input: Value, ctx: TaskContext| async move {
//!     let draft = ctx.memoize(|| async { Ok(call_model(&input).await) }).await?;
//!     let verdict = ctx.suspend(json!({ "review": draft }))?;
//!     Ok(NodeOutput::update(json!({ "verdict": verdict })))
//! }).subscribe_to(["draft"]).write_to(["verdict"]));
//! ```
//!
//! The first time the task runs, `suspend` fails with
//! [`GraphError::Suspended`](crate::GraphError::Suspended); the run stops and
//! returns the interrupt. When the thread is resumed, the task runs again from
//! the beginning and the same `suspend` call returns the supplied value.
//! Anything the body did before that point runs again too, unless it went
//! through `memoize`.

use crate::error::{GraphError, Result};
use crate::interrupt::Interrupt;
use crate::pregel::types::TaskPath;
use crate::stream::{EventSink, StreamEvent, StreamMode};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use superstep_checkpoint::CheckpointSaver;
use tokio_util::sync::CancellationToken;

/// Emits stream events on behalf of one task
#[derive(Clone, Debug)]
pub struct StreamWriter {
    node: String,
    sink: EventSink,
}

impl StreamWriter {
    pub(crate) fn new(node: impl Into<String>, sink: EventSink) -> Self {
        Self {
            node: node.into(),
            sink,
        }
    }

    /// Emit application data in [`StreamMode::Custom`]
    pub fn write(&self, data: Value) {
        self.sink.emit(StreamEvent::Custom {
            node: self.node.clone(),
            data,
        });
    }

    /// Emit a token or message fragment in [`StreamMode::Messages`]
    pub fn write_message(&self, chunk: Value, metadata: Value) {
        self.sink.emit(StreamEvent::MessageChunk {
            node: self.node.clone(),
            chunk,
            metadata,
        });
    }

    /// Whether anyone listens for `mode`; lets bodies skip building payloads
    pub fn is_enabled(&self, mode: StreamMode) -> bool {
        self.sink.wants(mode)
    }
}

/// Task-local state that survives suspension
///
/// `resume` and `memo` are loaded from the pending writes of the task and
/// saved back with its interrupt.
#[derive(Debug, Default)]
pub(crate) struct Scratchpad {
    pub resume: Vec<Value>,
    pub suspend_index: usize,
    pub memo: Vec<Value>,
    pub memo_index: usize,
    pub pending: Option<Interrupt>,
}

impl Scratchpad {
    pub(crate) fn new(resume: Vec<Value>, memo: Vec<Value>) -> Self {
        Self {
            resume,
            memo,
            ..Self::default()
        }
    }
}

struct ContextInner {
    task_id: String,
    node: String,
    step: i64,
    path: TaskPath,
    thread_id: String,
    ns: String,
    checkpointer: Arc<dyn CheckpointSaver>,
    writer: StreamWriter,
    sink: EventSink,
    cancellation: CancellationToken,
    recursion_limit: usize,
    scratchpad: Mutex<Scratchpad>,
}

/// Handle to the engine passed to every task
///
/// Cloning is cheap; all clones share the same scratchpad.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

pub(crate) struct TaskContextParts {
    pub task_id: String,
    pub node: String,
    pub step: i64,
    pub path: TaskPath,
    pub thread_id: String,
    pub ns: String,
    pub checkpointer: Arc<dyn CheckpointSaver>,
    pub sink: EventSink,
    pub cancellation: CancellationToken,
    pub recursion_limit: usize,
    pub scratchpad: Scratchpad,
}

impl TaskContext {
    pub(crate) fn new(parts: TaskContextParts) -> Self {
        let writer = StreamWriter::new(parts.node.clone(), parts.sink.clone());
        Self {
            inner: Arc::new(ContextInner {
                task_id: parts.task_id,
                node: parts.node,
                step: parts.step,
                path: parts.path,
                thread_id: parts.thread_id,
                ns: parts.ns,
                checkpointer: parts.checkpointer,
                writer,
                sink: parts.sink,
                cancellation: parts.cancellation,
                recursion_limit: parts.recursion_limit,
                scratchpad: Mutex::new(parts.scratchpad),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Superstep this task runs in
    pub fn step(&self) -> i64 {
        self.inner.step
    }

    pub fn path(&self) -> &TaskPath {
        &self.inner.path
    }

    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
    }

    /// Checkpoint namespace of the running graph (`""` at the root)
    pub fn checkpoint_ns(&self) -> &str {
        &self.inner.ns
    }

    /// Saver of the running graph, shared with subgraphs
    pub fn checkpointer(&self) -> Arc<dyn CheckpointSaver> {
        self.inner.checkpointer.clone()
    }

    pub fn stream_writer(&self) -> &StreamWriter {
        &self.inner.writer
    }

    /// Shortcut for `stream_writer().write(data)`
    pub fn write_custom(&self, data: Value) {
        self.inner.writer.write(data);
    }

    /// Shortcut for `stream_writer().write_message(chunk, metadata)`
    pub fn write_token(&self, chunk: Value, metadata: Value) {
        self.inner.writer.write_message(chunk, metadata);
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub(crate) fn sink(&self) -> &EventSink {
        &self.inner.sink
    }

    pub(crate) fn recursion_limit(&self) -> usize {
        self.inner.recursion_limit
    }

    /// Pause for external input
    ///
    /// Returns the resume value supplied for this call if the task is being
    /// replayed after `resume`; otherwise records an interrupt carrying
    /// `payload` and fails with [`GraphError::Suspended`], which the body is
    /// expected to propagate with `?`. Calls are matched to resume values by
    /// their order within the task.
    pub fn suspend(&self, payload: Value) -> Result<Value> {
        let mut pad = self.inner.scratchpad.lock();
        let index = pad.suspend_index;
        pad.suspend_index += 1;
        if let Some(value) = pad.resume.get(index) {
            return Ok(value.clone());
        }
        pad.pending = Some(Interrupt::suspended(
            &self.inner.task_id,
            &self.inner.node,
            &self.inner.ns,
            index,
            payload,
        ));
        Err(GraphError::Suspended)
    }

    /// Run `f` once per call position and replay its result afterwards
    ///
    /// Results are keyed by call order within the task and persisted with the
    /// task's interrupt, so a replayed task gets the first run's values back
    /// instead of running `f` again.
    pub async fn memoize<T, F, Fut>(&self, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cached = {
            let mut pad = self.inner.scratchpad.lock();
            let index = pad.memo_index;
            pad.memo_index += 1;
            pad.memo.get(index).cloned()
        };
        if let Some(value) = cached {
            return Ok(serde_json::from_value(value)?);
        }

        let result = f().await?;
        let value = serde_json::to_value(&result)?;
        self.inner.scratchpad.lock().memo.push(value);
        Ok(result)
    }

    /// Resume values assigned to this task so far
    pub(crate) fn resume_values(&self) -> Vec<Value> {
        self.inner.scratchpad.lock().resume.clone()
    }

    /// Skip suspension slots already answered outside `suspend`
    pub(crate) fn advance_suspend_index(&self, to: usize) {
        let mut pad = self.inner.scratchpad.lock();
        pad.suspend_index = pad.suspend_index.max(to);
    }

    /// Interrupt recorded by the last failing `suspend`, with the state that
    /// has to be persisted next to it
    pub(crate) fn take_suspension(&self) -> Option<(Interrupt, Vec<Value>, Vec<Value>)> {
        let mut pad = self.inner.scratchpad.lock();
        let interrupt = pad.pending.take()?;
        Some((interrupt, pad.resume.clone(), pad.memo.clone()))
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.inner.task_id)
            .field("node", &self.inner.node)
            .field("step", &self.inner.step)
            .field("ns", &self.inner.ns)
            .finish()
    }
}
