//! Dynamic fan-out and routing targets
//!
//! A [`Send`] schedules one extra task of a node for the next superstep, with
//! its own input instead of the node's channel view. Returning several sends
//! from a router or a [`Command`](crate::Command) is the map half of a
//! map-reduce: each task writes its partial result into a shared aggregate
//! channel, which folds them when the round commits.
//!
//! ```rust
//! use superstep_core::{Route, Send};
//! use serde_json::json;
//!
//! let routes: Vec<Route> = ["a", "b", "c"]
//!     .iter()
//!     .map(|item| Send::new("worker", json!({ "item": item })).into())
//!     .collect();
//! assert_eq!(routes.len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Packet scheduling a task of `node` with `arg` as its input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Send {
    /// Target node
    pub node: String,

    /// Input of the spawned task
    pub arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn arg(&self) -> &Value {
        &self.arg
    }

    pub(crate) fn to_value(&self) -> Value {
        serde_json::json!({ "node": self.node, "arg": self.arg })
    }

    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        let node = value.get("node")?.as_str()?;
        Some(Self::new(node, value.get("arg").cloned().unwrap_or(Value::Null)))
    }
}

/// Where control goes after a node: a node to trigger, or a dynamic task
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Trigger this node (or finish the branch with [`END`](crate::END))
    Node(String),
    /// Spawn a task with its own input
    Send(Send),
}

impl Route {
    pub fn to(node: impl Into<String>) -> Self {
        Route::Node(node.into())
    }

    /// Name of the targeted node
    pub fn target(&self) -> &str {
        match self {
            Route::Node(node) => node,
            Route::Send(send) => &send.node,
        }
    }
}

impl From<&str> for Route {
    fn from(node: &str) -> Self {
        Route::Node(node.to_string())
    }
}

impl From<String> for Route {
    fn from(node: String) -> Self {
        Route::Node(node)
    }
}

impl From<Send> for Route {
    fn from(send: Send) -> Self {
        Route::Send(send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_packet_round_trip() {
        let send = Send::new("worker", json!({"n": 3}));
        let packet = send.to_value();
        assert_eq!(packet, json!({"node": "worker", "arg": {"n": 3}}));
        assert_eq!(Send::from_value(&packet), Some(send));
        assert_eq!(Send::from_value(&json!({"arg": 1})), None);
    }

    #[test]
    fn test_route_targets() {
        assert_eq!(Route::from("next").target(), "next");
        assert_eq!(Route::from(Send::new("w", json!(null))).target(), "w");
    }
}
