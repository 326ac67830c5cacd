//! Streaming events emitted while a graph runs
//!
//! A run can be observed through any combination of [`StreamMode`]s:
//!
//! | Mode | Emits | When |
//! |------|-------|------|
//! | **Values** | [`StreamEvent::Values`] | full output state after every committed round |
//! | **Updates** | [`StreamEvent::Updates`] | what each task wrote, per round |
//! | **Custom** | [`StreamEvent::Custom`] | data a task pushed with `TaskContext::write_custom` |
//! | **Messages** | [`StreamEvent::MessageChunk`] | token chunks pushed with `TaskContext::write_token` |
//! | **Tasks** | [`StreamEvent::TaskStart`] / `TaskEnd` / `TaskError` | task lifecycle |
//! | **Checkpoints** | [`StreamEvent::Checkpoint`] | every saved checkpoint |
//! | **Debug** | tasks and checkpoints | development |
//!
//! Every event is wrapped in a [`StreamChunk`] that names the mode it was
//! requested under and the checkpoint namespace it came from, so events of a
//! subgraph (`"outer_node:<task id>"`) can be told apart from those of the
//! root graph (`""`).
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use superstep_core::{RunConfig, StreamEvent, StreamMode};
//!
//! let mut stream = graph.stream(
//!     json!({"topic": "rust"}),
//!     RunConfig::new().with_thread_id("t-1"),
//!     vec![StreamMode::Updates, StreamMode::Custom],
//! );
//! while let Some(chunk) = stream.next().await {
//!     match chunk?.event {
//!         StreamEvent::Updates { node, update, .. } => println!("{node}: {update}"),
//!         StreamEvent::Custom { data, .. } => println!("progress: {data}"),
//!         _ => {}
//!     }
//! }
//! ```

use crate::error::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use superstep_checkpoint::{CheckpointConfig, CheckpointMetadata};
use tokio::sync::mpsc;

/// Kinds of events a caller can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Full output state after each round
    Values,
    /// Per-task writes after each round
    Updates,
    /// Data emitted by node bodies
    Custom,
    /// Token chunks emitted by node bodies
    Messages,
    /// Task start, end and error
    Tasks,
    /// Saved checkpoints
    Checkpoints,
    /// Tasks and checkpoints together
    Debug,
}

/// One observable occurrence during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Output channels after a committed round
    Values { state: Value },

    /// Writes of one task, keyed by channel
    ///
    /// Interrupts are reported as an update of the pseudo node
    /// `"__interrupt__"` holding the list of interrupts.
    Updates {
        node: String,
        update: Value,
        #[serde(default)]
        cached: bool,
    },

    /// Application data pushed by a node
    Custom { node: String, data: Value },

    /// A token or message fragment pushed by a node
    MessageChunk {
        node: String,
        chunk: Value,
        metadata: Value,
    },

    TaskStart {
        id: String,
        node: String,
        step: i64,
        input: Value,
    },

    TaskEnd {
        id: String,
        node: String,
        step: i64,
        result: Value,
        #[serde(default)]
        cached: bool,
    },

    TaskError {
        id: String,
        node: String,
        step: i64,
        error: String,
    },

    /// A checkpoint was saved
    Checkpoint {
        config: CheckpointConfig,
        metadata: CheckpointMetadata,
        values: Value,
        next: Vec<String>,
    },
}

impl StreamEvent {
    /// Mode this event belongs to (never [`StreamMode::Debug`])
    pub fn mode(&self) -> StreamMode {
        match self {
            StreamEvent::Values { .. } => StreamMode::Values,
            StreamEvent::Updates { .. } => StreamMode::Updates,
            StreamEvent::Custom { .. } => StreamMode::Custom,
            StreamEvent::MessageChunk { .. } => StreamMode::Messages,
            StreamEvent::TaskStart { .. }
            | StreamEvent::TaskEnd { .. }
            | StreamEvent::TaskError { .. } => StreamMode::Tasks,
            StreamEvent::Checkpoint { .. } => StreamMode::Checkpoints,
        }
    }
}

/// An event tagged with its mode and namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Checkpoint namespace of the graph that emitted the event
    pub namespace: String,
    /// Mode the event was requested under
    pub mode: StreamMode,
    pub event: StreamEvent,
}

/// Boxed stream returned by `stream` and `stream_resume`
pub type GraphStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Routes events of a run to the stream consumer, filtered by mode
///
/// A disabled sink (used by `invoke`) drops everything. Subgraph runs get a
/// sink sharing the same consumer with their own namespace.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<Result<StreamChunk>>>,
    modes: Arc<Vec<StreamMode>>,
    namespace: String,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Result<StreamChunk>>,
        modes: Vec<StreamMode>,
    ) -> Self {
        Self {
            tx: Some(tx),
            modes: Arc::new(modes),
            namespace: String::new(),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            tx: None,
            modes: Arc::new(Vec::new()),
            namespace: String::new(),
        }
    }

    /// Same consumer, events tagged with `namespace`
    pub(crate) fn with_namespace(&self, namespace: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            modes: self.modes.clone(),
            namespace: namespace.to_string(),
        }
    }

    /// Whether an event of `mode` would reach the consumer
    pub(crate) fn wants(&self, mode: StreamMode) -> bool {
        if self.tx.is_none() {
            return false;
        }
        self.modes.contains(&mode)
            || (self.modes.contains(&StreamMode::Debug)
                && matches!(mode, StreamMode::Tasks | StreamMode::Checkpoints))
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let mode = event.mode();
        let debug = self.modes.contains(&StreamMode::Debug)
            && matches!(mode, StreamMode::Tasks | StreamMode::Checkpoints);
        if self.modes.contains(&mode) {
            let chunk = StreamChunk {
                namespace: self.namespace.clone(),
                mode,
                event: event.clone(),
            };
            let _ = tx.send(Ok(chunk));
        }
        if debug {
            let chunk = StreamChunk {
                namespace: self.namespace.clone(),
                mode: StreamMode::Debug,
                event,
            };
            let _ = tx.send(Ok(chunk));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Result<StreamChunk>>) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk.unwrap());
        }
        out
    }

    #[test]
    fn test_sink_filters_by_mode() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, vec![StreamMode::Updates]);

        sink.emit(StreamEvent::Values { state: json!({}) });
        sink.emit(StreamEvent::Updates {
            node: "a".into(),
            update: json!({"x": 1}),
            cached: false,
        });

        let chunks = drain(&mut rx);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].mode, StreamMode::Updates);
        assert!(sink.wants(StreamMode::Updates));
        assert!(!sink.wants(StreamMode::Values));
    }

    #[test]
    fn test_debug_duplicates_task_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, vec![StreamMode::Tasks, StreamMode::Debug]);
        sink.emit(StreamEvent::TaskError {
            id: "t".into(),
            node: "a".into(),
            step: 1,
            error: "boom".into(),
        });

        let modes: Vec<_> = drain(&mut rx).into_iter().map(|c| c.mode).collect();
        assert_eq!(modes, vec![StreamMode::Tasks, StreamMode::Debug]);
    }

    #[test]
    fn test_namespaced_sink_shares_consumer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, vec![StreamMode::Custom]);
        let child = sink.with_namespace("inner:abc");
        child.emit(StreamEvent::Custom {
            node: "n".into(),
            data: json!(1),
        });

        let chunks = drain(&mut rx);
        assert_eq!(chunks[0].namespace, "inner:abc");
        assert!(!EventSink::disabled().wants(StreamMode::Custom));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = StreamEvent::Values { state: json!({"a": 1}) };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"event": "values", "data": {"state": {"a": 1}}}));
    }
}
