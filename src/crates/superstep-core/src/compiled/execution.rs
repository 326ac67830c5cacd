//! Graph execution methods (invoke, resume)

use super::types::RunOutput;
use super::CompiledGraph;
use crate::config::RunConfig;
use crate::error::Result;
use crate::pregel::loop_impl::{LoopParts, PregelLoop};
use crate::stream::EventSink;
use serde_json::Value;
use uuid::Uuid;

/// What a run starts from
#[derive(Debug, Clone)]
pub(crate) enum RunRequest {
    /// New input applied on top of the thread's latest checkpoint
    Input(Value),
    /// Continue the thread, answering its pending interrupts in order
    Resume(Vec<Value>),
}

impl RunRequest {
    /// `Null` input continues the thread instead of writing anything
    pub(crate) fn from_input(input: Value) -> Self {
        if input.is_null() {
            RunRequest::Resume(Vec::new())
        } else {
            RunRequest::Input(input)
        }
    }
}

impl CompiledGraph {
    /// Run the graph to quiescence or to the first interrupt.
    ///
    /// `input` is written to the input channels (an object keyed by channel,
    /// or a bare value when the graph has a single input channel) on top of
    /// the thread's latest checkpoint, or the checkpoint named by
    /// `config.checkpoint_id`, which starts a new branch of its history.
    /// `Value::Null` continues the thread without new input, which is how a
    /// thread stopped at a static breakpoint is continued.
    ///
    /// Without `config.thread_id` a fresh thread is created; its id is part
    /// of the returned [`RunOutput::config`].
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use serde_json::json;
    /// use superstep_core::{CompiledGraph, RunConfig};
    ///
    /// # async fn example(graph: CompiledGraph) -> superstep_core::Result<()> {
    /// let config = RunConfig::new().with_thread_id("conversation-1");
    /// let out = graph.invoke(json!({"question": "why?"}), &config).await?;
    /// if out.is_interrupted() {
    ///     let out = graph.resume(vec![json!("because")], &config).await?;
    ///     println!("{}", out.values);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Task errors, [`RecursionLimit`](crate::GraphError::RecursionLimit),
    /// [`Timeout`](crate::GraphError::Timeout) and
    /// [`Cancelled`](crate::GraphError::Cancelled) leave the thread at its
    /// last committed checkpoint.
    #[tracing::instrument(skip_all, fields(thread_id = ?config.thread_id, ns = config.ns()))]
    pub async fn invoke(&self, input: Value, config: &RunConfig) -> Result<RunOutput> {
        self.execute(RunRequest::from_input(input), config.clone(), EventSink::disabled())
            .await
    }

    /// Continue an interrupted thread.
    ///
    /// `values[i]` answers the i-th pending resumable interrupt in canonical
    /// order (task path, then suspension index), as returned in
    /// [`RunOutput::interrupts`]. Tasks that finished before the interrupt
    /// are not run again; interrupted tasks run again from their start.
    ///
    /// # Errors
    ///
    /// [`ResumeMismatch`](crate::GraphError::ResumeMismatch) when the number
    /// of values differs from the number of pending interrupts, and
    /// [`NoCheckpoint`](crate::GraphError::NoCheckpoint) for an unknown
    /// thread. Nothing runs in either case.
    #[tracing::instrument(skip_all, fields(thread_id = ?config.thread_id, ns = config.ns(), values = values.len()))]
    pub async fn resume(&self, values: Vec<Value>, config: &RunConfig) -> Result<RunOutput> {
        self.execute(RunRequest::Resume(values), config.clone(), EventSink::disabled())
            .await
    }

    pub(crate) async fn execute(
        &self,
        request: RunRequest,
        mut config: RunConfig,
        sink: EventSink,
    ) -> Result<RunOutput> {
        config.validate()?;
        let thread_id = config
            .thread_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let _guard = self.locks.acquire(&thread_id, config.ns())?;

        let mut pregel = PregelLoop::load(LoopParts {
            spec: self.spec.clone(),
            checkpointer: self.checkpointer.clone(),
            cache: self.cache.clone(),
            config,
            sink,
        })
        .await?;
        match request {
            RunRequest::Input(input) => pregel.apply_input(input).await?,
            RunRequest::Resume(values) => pregel.prepare_resume(values)?,
        }
        pregel.run().await
    }
}
