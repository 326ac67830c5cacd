//! # superstep-core - Durable superstep graph execution
//!
//! Graphs of named nodes communicating through versioned channels, executed
//! in synchronized rounds (supersteps) and checkpointed after every round, so
//! that a run can be suspended for as long as needed and resumed or replayed
//! exactly.
//!
//! ## Core Concepts
//!
//! ### 1. Channels and nodes
//!
//! State lives in channels from [`superstep_checkpoint`]: last-value,
//! topic, aggregate (binary operator), ephemeral and named-barrier channels.
//! A node subscribes to channels, reads them as a JSON object and returns
//! writes ([`NodeOutput`]). Control flow is expressed with static edges,
//! joins, conditional edges, [`Command`] redirection and [`Send`] fan-out.
//!
//! ### 2. Supersteps
//!
//! Each round plans every node triggered by a channel version it has not
//! seen, runs those tasks concurrently on a snapshot, then applies all their
//! writes at once in a fixed order. Writes of a round are never visible to
//! tasks of the same round. See [`pregel`].
//!
//! ### 3. Checkpoints, interrupts and time travel
//!
//! After each round the full state is saved through a
//! [`CheckpointSaver`](superstep_checkpoint::CheckpointSaver). A task may
//! [`suspend`](TaskContext::suspend) for external input; the run returns its
//! [`Interrupt`]s and [`CompiledGraph::resume`] continues it later, re-running
//! only the interrupted tasks. Any checkpoint of a thread's history can be
//! inspected, run from again, or forked.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::{json, Value};
//! use superstep_checkpoint::LastValueChannel;
//! use superstep_core::{GraphBuilder, GraphError, NodeBuilder, NodeOutput, RunConfig, TaskContext};
//!
//! # async fn example() -> superstep_core::Result<()> {
//! let mut builder = GraphBuilder::new();
//! builder
//!     .add_channel("draft", LastValueChannel::new())
//!     .add_channel("verdict", LastValueChannel::new())
//!     .add_node(
//!         NodeBuilder::new("approve", |input: Value, ctx: TaskContext| async move {
//!             let verdict = ctx.suspend(json!({ "review": input["draft"] }))?;
//!             Ok::<_, GraphError>(NodeOutput::update(verdict))
//!         })
//!         .subscribe_to(["draft"])
//!         .write_to(["verdict"]),
//!     )
//!     .set_input_channels(["draft"]);
//! let graph = builder.compile()?;
//!
//! let config = RunConfig::new().with_thread_id("review-42");
//! let out = graph.invoke(json!("first draft"), &config).await?;
//! assert!(out.is_interrupted());
//!
//! let out = graph.resume(vec![json!("approved")], &config).await?;
//! assert_eq!(out.values["verdict"], json!("approved"));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod command;
pub mod compiled;
pub mod config;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod pregel;
pub mod runtime;
pub mod send;
pub mod stream;
pub mod subgraph;

pub use cache::{BaseCache, CacheKey, CachePolicy, InMemoryCache};
pub use command::{Command, NodeOutput};
pub use compiled::{CompiledGraph, RunOutput, StateSnapshot, TaskSnapshot};
pub use config::{RunConfig, ALL_NODES, DEFAULT_RECURSION_LIMIT};
pub use error::{GraphError, Result};
pub use graph::{GraphBuilder, Node, NodeBuilder, RouterFn};
pub use interrupt::{Interrupt, InterruptWhen};
pub use pregel::types::{TaskPath, TaskState};
pub use pregel::{END, START};
pub use runtime::{StreamWriter, TaskContext};
pub use send::{Route, Send};
pub use stream::{GraphStream, StreamChunk, StreamEvent, StreamMode};
pub use subgraph::SubgraphNode;
pub use superstep_checkpoint::{CheckpointConfig, CheckpointMetadata, CheckpointSource};
