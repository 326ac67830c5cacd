//! CompiledGraph struct and builder methods

use crate::cache::BaseCache;
use crate::error::{GraphError, Result};
use crate::graph::GraphSpec;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use superstep_checkpoint::{CheckpointSaver, InMemoryCheckpointSaver};

/// Compiled graph ready for execution
///
/// Cloning is cheap: clones share the graph, the saver, the cache and the
/// thread locks.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) spec: Arc<GraphSpec>,
    pub(crate) checkpointer: Arc<dyn CheckpointSaver>,
    pub(crate) cache: Option<Arc<dyn BaseCache>>,
    pub(crate) locks: ThreadLocks,
}

impl CompiledGraph {
    /// Checkpoints go to a private in-memory saver until
    /// [`with_checkpointer`](Self::with_checkpointer) is called
    pub(crate) fn new(spec: GraphSpec) -> Self {
        Self {
            spec: Arc::new(spec),
            checkpointer: Arc::new(InMemoryCheckpointSaver::new()),
            cache: None,
            locks: ThreadLocks::default(),
        }
    }

    /// Set the checkpoint saver
    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = saver;
        self
    }

    /// Set the cache consulted by nodes with a cache policy
    pub fn with_cache(mut self, cache: Arc<dyn BaseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn checkpointer(&self) -> Arc<dyn CheckpointSaver> {
        self.checkpointer.clone()
    }

    pub fn cache(&self) -> Option<Arc<dyn BaseCache>> {
        self.cache.clone()
    }

    /// Node names in sorted order
    pub fn node_names(&self) -> Vec<&str> {
        self.spec.nodes.keys().map(String::as_str).collect()
    }

    pub fn input_channels(&self) -> &[String] {
        &self.spec.input_channels
    }

    pub fn output_channels(&self) -> &[String] {
        &self.spec.output_channels
    }

    pub(crate) fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    pub(crate) fn shared_spec(&self) -> Arc<GraphSpec> {
        self.spec.clone()
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.node_names())
            .field("channels", &self.spec.user_channels)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

/// Advisory locks on `(thread_id, namespace)` pairs
#[derive(Clone, Default)]
pub(crate) struct ThreadLocks {
    held: Arc<Mutex<HashSet<(String, String)>>>,
}

impl ThreadLocks {
    /// Lock a thread and namespace until the guard is dropped
    pub(crate) fn acquire(&self, thread_id: &str, ns: &str) -> Result<ThreadGuard> {
        let key = (thread_id.to_string(), ns.to_string());
        if !self.held.lock().insert(key.clone()) {
            return Err(GraphError::ThreadBusy {
                thread_id: key.0,
                ns: key.1,
            });
        }
        Ok(ThreadGuard {
            locks: self.clone(),
            key,
        })
    }
}

pub(crate) struct ThreadGuard {
    locks: ThreadLocks,
    key: (String, String),
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_lock_is_exclusive_until_dropped() {
        let locks = ThreadLocks::default();
        let guard = locks.acquire("t", "").unwrap();
        assert!(matches!(
            locks.acquire("t", ""),
            Err(GraphError::ThreadBusy { .. })
        ));
        // Other namespaces and threads are independent
        let _child = locks.acquire("t", "sub:1").unwrap();
        let _other = locks.acquire("u", "").unwrap();

        drop(guard);
        assert!(locks.acquire("t", "").is_ok());
    }
}
