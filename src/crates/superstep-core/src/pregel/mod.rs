//! Pregel-style superstep engine
//!
//! Execution proceeds in rounds. Each round:
//!
//! 1. **Plan** ([`algo::prepare_next_tasks`]): a node runs if one of its
//!    trigger channels holds a version it has not seen; every pending `Send`
//!    packet becomes a task of its own.
//! 2. **Execute** ([`executor::TaskExecutor`]): tasks run concurrently on a
//!    read-only snapshot of their inputs and return writes.
//! 3. **Apply** ([`algo::apply_writes`]): writes are applied to a copy of the
//!    channels in task path order, versions are bumped, and the copy replaces
//!    the live channels only once the new checkpoint has been saved.
//!
//! The loop ([`loop_impl::PregelLoop`]) stops when no task is planned, when a
//! task suspends, at a static breakpoint, or on error. Besides user channels a
//! compiled graph carries bookkeeping channels, all with reserved names:
//!
//! | Channel | Kind | Purpose |
//! |---------|------|---------|
//! | `branch:to:<node>` | ephemeral | static edges, routers and `goto` |
//! | `join:<a>+<b>:<node>` | named barrier | waits for every join source |
//! | `__tasks__` | topic | pending `Send` packets |

pub(crate) mod algo;
pub(crate) mod executor;
pub(crate) mod io;
pub(crate) mod loop_impl;
pub mod types;

/// Virtual source node whose edges are taken when input is applied
pub const START: &str = "__start__";

/// Virtual sink node; routing to it ends a branch
pub const END: &str = "__end__";

pub(crate) const TASKS: &str = "__tasks__";
pub(crate) const INTERRUPT: &str = "__interrupt__";
pub(crate) const RESUME: &str = "__resume__";
pub(crate) const MEMO: &str = "__memo__";
pub(crate) const NO_WRITES: &str = "__no_writes__";

/// Pending-write channels that never reach a channel
pub(crate) const CONTROL_CHANNELS: [&str; 4] = [INTERRUPT, RESUME, MEMO, NO_WRITES];

const BRANCH_PREFIX: &str = "branch:to:";
const JOIN_PREFIX: &str = "join:";

pub(crate) fn branch_channel(node: &str) -> String {
    format!("{BRANCH_PREFIX}{node}")
}

pub(crate) fn join_channel(sources: &[String], node: &str) -> String {
    format!("{JOIN_PREFIX}{}:{node}", sources.join("+"))
}

/// Names users may not give to channels or nodes
pub(crate) fn is_reserved(name: &str) -> bool {
    name.starts_with("__") || name.starts_with(BRANCH_PREFIX) || name.starts_with(JOIN_PREFIX)
}

pub(crate) fn is_control(channel: &str) -> bool {
    CONTROL_CHANNELS.contains(&channel)
}

/// Bookkeeping writes are hidden from `Updates` events
pub(crate) fn is_bookkeeping(channel: &str) -> bool {
    channel == TASKS || channel.starts_with(BRANCH_PREFIX) || channel.starts_with(JOIN_PREFIX)
}

/// Namespace of a subgraph run started by `task_id` of `node`
pub(crate) fn child_namespace(parent_ns: &str, node: &str, task_id: &str) -> String {
    if parent_ns.is_empty() {
        format!("{node}:{task_id}")
    } else {
        format!("{parent_ns}|{node}:{task_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("__tasks__"));
        assert!(is_reserved("branch:to:a"));
        assert!(is_reserved("join:a+b:c"));
        assert!(!is_reserved("messages"));
        assert!(!is_reserved("_private"));
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(branch_channel("a"), "branch:to:a");
        assert_eq!(
            join_channel(&["a".to_string(), "b".to_string()], "c"),
            "join:a+b:c"
        );
        assert!(is_bookkeeping(&branch_channel("x")));
        assert!(!is_bookkeeping("state"));
    }

    #[test]
    fn test_child_namespace() {
        assert_eq!(child_namespace("", "inner", "t1"), "inner:t1");
        assert_eq!(child_namespace("inner:t1", "deep", "t2"), "inner:t1|deep:t2");
    }
}
