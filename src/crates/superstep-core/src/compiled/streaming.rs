//! Streaming execution methods

use super::execution::RunRequest;
use super::CompiledGraph;
use crate::config::RunConfig;
use crate::stream::{EventSink, GraphStream, StreamMode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

impl CompiledGraph {
    /// Run like [`invoke`](Self::invoke), yielding events as they happen.
    ///
    /// Nothing runs until the stream is first polled. The stream ends after
    /// the last event of the run; a failed run ends with one `Err` item.
    /// Subgraph events come tagged with the subgraph's namespace.
    ///
    /// Dropping the stream cancels the run before its next round; the round
    /// in flight still commits.
    ///
    /// ```rust,no_run
    /// use futures::StreamExt;
    /// use serde_json::json;
    /// use superstep_core::{CompiledGraph, RunConfig, StreamEvent, StreamMode};
    ///
    /// # async fn example(graph: CompiledGraph) -> superstep_core::Result<()> {
    /// let mut stream = graph.stream(
    ///     json!({"topic": "rust"}),
    ///     RunConfig::new().with_thread_id("t-1"),
    ///     vec![StreamMode::Updates, StreamMode::Custom],
    /// );
    /// while let Some(chunk) = stream.next().await {
    ///     if let StreamEvent::Updates { node, update, .. } = chunk?.event {
    ///         println!("{node}: {update}");
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn stream(&self, input: Value, config: RunConfig, modes: Vec<StreamMode>) -> GraphStream {
        self.stream_request(RunRequest::from_input(input), config, modes)
    }

    /// Run like [`resume`](Self::resume), yielding events as they happen
    pub fn stream_resume(
        &self,
        values: Vec<Value>,
        config: RunConfig,
        modes: Vec<StreamMode>,
    ) -> GraphStream {
        self.stream_request(RunRequest::Resume(values), config, modes)
    }

    fn stream_request(
        &self,
        request: RunRequest,
        config: RunConfig,
        modes: Vec<StreamMode>,
    ) -> GraphStream {
        let graph = self.clone();
        let token = config
            .cancellation
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let config = config.with_cancellation(token.clone());
        Box::pin(async_stream::stream! {
            let _cancel_on_drop = token.drop_guard();
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = EventSink::new(tx.clone(), modes);
            tokio::spawn(async move {
                if let Err(err) = graph.execute(request, config, sink).await {
                    tracing::debug!(error = %err, "Streamed run failed");
                    let _ = tx.send(Err(err));
                }
            });
            let mut events = UnboundedReceiverStream::new(rx);
            while let Some(item) = events.next().await {
                yield item;
            }
        })
    }
}
