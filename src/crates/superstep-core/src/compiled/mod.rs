//! Executable graphs
//!
//! [`GraphBuilder::compile`](crate::GraphBuilder::compile) produces a
//! [`CompiledGraph`]: an immutable graph plus the saver, the optional cache
//! and the thread locks shared by every run of it. Runs are addressed by
//! [`RunConfig`](crate::RunConfig):
//!
//! - [`CompiledGraph::invoke`] / [`CompiledGraph::resume`] run to quiescence
//!   or to the first interrupt and return a [`RunOutput`];
//! - [`CompiledGraph::stream`] / [`CompiledGraph::stream_resume`] do the same
//!   lazily and yield [`StreamChunk`](crate::StreamChunk)s as they happen;
//! - [`CompiledGraph::get_state`], [`CompiledGraph::get_state_history`] and
//!   [`CompiledGraph::update_state`] inspect and edit threads without running
//!   nodes.
//!
//! Every run saves a checkpoint per round, so a thread can be resumed after
//! an interrupt, replayed from any checkpoint of its history (time travel),
//! or forked.

mod execution;
mod graph;
mod state;
mod streaming;
mod types;

pub use graph::CompiledGraph;
pub use types::{RunOutput, StateSnapshot, TaskSnapshot};

pub(crate) use execution::RunRequest;
