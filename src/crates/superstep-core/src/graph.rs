//! Graph definition and compilation
//!
//! A graph is built from three kinds of declarations:
//!
//! - **Channels**: named, versioned state containers
//!   ([`LastValueChannel`](superstep_checkpoint::LastValueChannel),
//!   [`BinaryOperatorChannel`](superstep_checkpoint::BinaryOperatorChannel), ...).
//! - **Nodes** ([`NodeBuilder`]): a body plus the channels it is triggered by
//!   (`subscribe_to`), additionally reads (`read_from`) and may write
//!   (`write_to`), and the nodes it may redirect to at run time (`routes_to`).
//! - **Edges**: static edges, joins (wait for several sources) and
//!   conditional edges (a router picks targets from the node's state view).
//!
//! ```text
//!   START ──► fetch ──► summarize ──┐
//!               │                   ├──► (join) ──► publish ──► END
//!               └────► classify ────┘
//! ```
//!
//! ```rust
//! use serde_json::{json, Value};
//! use superstep_checkpoint::LastValueChannel;
//! use superstep_core::{GraphBuilder, NodeBuilder, NodeOutput, TaskContext, Result};
//!
//! async fn shout(input: Value, _ctx: TaskContext) -> Result<NodeOutput> {
//!     let text = input["text"].as_str().unwrap_or_default().to_uppercase();
//!     Ok(NodeOutput::update(json!({ "text": text })))
//! }
//!
//! let mut builder = GraphBuilder::new();
//! builder
//!     .add_channel("text", LastValueChannel::new())
//!     .add_node(NodeBuilder::new("shout", shout).read_from(["text"]).write_to(["text"]))
//!     .set_entry_point("shout");
//! let graph = builder.compile().unwrap();
//! ```
//!
//! [`GraphBuilder::compile`] validates the declarations and derives the
//! bookkeeping channels the engine routes with (see [`crate::pregel`]).

use crate::cache::CachePolicy;
use crate::command::NodeOutput;
use crate::compiled::CompiledGraph;
use crate::error::{GraphError, Result};
use crate::pregel::{branch_channel, is_reserved, join_channel, END, START, TASKS};
use crate::runtime::TaskContext;
use crate::send::Route;
use crate::subgraph::SubgraphNode;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use superstep_checkpoint::{
    Channel, EphemeralValueChannel, NamedBarrierValueChannel, TopicChannel,
};

/// A unit of work run by a task
///
/// Implemented for every `Fn(Value, TaskContext) -> impl Future<Output =
/// Result<NodeOutput>>`, so plain async functions and closures returning
/// `async move` blocks can be used directly.
#[async_trait]
pub trait Node: Send + Sync {
    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<NodeOutput>;
}

#[async_trait]
impl<F, Fut> Node for F
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput>> + Send,
{
    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<NodeOutput> {
        (self)(input, ctx).await
    }
}

/// Router of a conditional edge, evaluated on the source's state view
pub type RouterFn = Arc<dyn Fn(&Value) -> Vec<Route> + Send + Sync>;

/// A conditional edge
#[derive(Clone)]
pub(crate) struct Branch {
    pub router: RouterFn,
    pub targets: BTreeSet<String>,
}

/// Outgoing control flow of a node (or of `START`)
#[derive(Clone, Default)]
pub(crate) struct Edges {
    pub successors: Vec<String>,
    /// Join channels this node is a source of
    pub joins: Vec<String>,
    pub branches: Vec<Branch>,
}

#[derive(Clone, Debug)]
pub(crate) struct JoinSpec {
    pub channel: String,
    pub sources: Vec<String>,
    pub target: String,
}

/// Declaration of a node
#[derive(Clone)]
pub struct NodeBuilder {
    name: String,
    body: Arc<dyn Node>,
    subscribe_to: Vec<String>,
    read_from: Vec<String>,
    write_to: Vec<String>,
    routes_to: Vec<String>,
    cache_policy: Option<CachePolicy>,
    subgraph: Option<CompiledGraph>,
}

impl NodeBuilder {
    pub fn new<N>(name: impl Into<String>, body: N) -> Self
    where
        N: Node + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
            subscribe_to: Vec::new(),
            read_from: Vec::new(),
            write_to: Vec::new(),
            routes_to: Vec::new(),
            cache_policy: None,
            subgraph: None,
        }
    }

    /// Node running a compiled graph
    ///
    /// The child receives the node's input as its input and its output
    /// channels become the node's update. It checkpoints into the parent's
    /// saver under its own namespace, and its interrupts surface as
    /// interrupts of this node.
    pub fn subgraph(name: impl Into<String>, graph: CompiledGraph) -> Self {
        let mut builder = Self::new(name, SubgraphNode::new(graph.clone()));
        builder.subgraph = Some(graph);
        builder
    }

    /// Channels that trigger the node and are part of its input
    pub fn subscribe_to<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_to.extend(channels.into_iter().map(Into::into));
        self
    }

    /// Channels read without triggering; they must hold a value when the
    /// node runs
    pub fn read_from<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_from.extend(channels.into_iter().map(Into::into));
        self
    }

    /// Channels the node may write
    pub fn write_to<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_to.extend(channels.into_iter().map(Into::into));
        self
    }

    /// Nodes the node may redirect to or `Send` to with a `Command`
    pub fn routes_to<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes_to.extend(nodes.into_iter().map(Into::into));
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Compiled form of a node
#[derive(Clone)]
pub(crate) struct NodeSpec {
    pub name: String,
    pub body: Arc<dyn Node>,
    pub subscribe_to: Vec<String>,
    pub read_from: Vec<String>,
    pub write_to: BTreeSet<String>,
    pub routes_to: BTreeSet<String>,
    /// Every channel whose new versions trigger the node
    pub triggers: Vec<String>,
    pub edges: Edges,
    pub cache_policy: Option<CachePolicy>,
    pub subgraph: Option<CompiledGraph>,
}

/// Validated graph shared by every run of a compiled graph
pub(crate) struct GraphSpec {
    pub nodes: BTreeMap<String, NodeSpec>,
    /// Prototypes of user and bookkeeping channels
    pub channels: BTreeMap<String, Box<dyn Channel>>,
    pub user_channels: BTreeSet<String>,
    pub input_channels: Vec<String>,
    pub output_channels: Vec<String>,
    pub start: Edges,
    pub joins: Vec<JoinSpec>,
}

impl GraphSpec {
    /// Control flow leaving `node`, with `START` as a pseudo node
    pub(crate) fn edges_of(&self, node: &str) -> Option<&Edges> {
        if node == START {
            Some(&self.start)
        } else {
            self.nodes.get(node).map(|spec| &spec.edges)
        }
    }

    /// Nodes a run can move to right after `from` ran (or after input)
    fn successors(&self, from: &str) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        let written: BTreeSet<&str> = if from == START {
            self.input_channels.iter().map(String::as_str).collect()
        } else {
            self.nodes
                .get(from)
                .map(|n| n.write_to.iter().map(String::as_str).collect())
                .unwrap_or_default()
        };

        if let Some(edges) = self.edges_of(from) {
            out.extend(edges.successors.iter().map(String::as_str));
            for branch in &edges.branches {
                out.extend(branch.targets.iter().map(String::as_str));
            }
            for join in &self.joins {
                if edges.joins.contains(&join.channel) {
                    out.insert(join.target.as_str());
                }
            }
        }
        if let Some(spec) = self.nodes.get(from) {
            out.extend(spec.routes_to.iter().map(String::as_str));
        }
        for (name, spec) in &self.nodes {
            if spec.subscribe_to.iter().any(|c| written.contains(c.as_str())) {
                out.insert(name.as_str());
            }
        }
        out.remove(END);
        out
    }

    /// Nodes reachable from `START`, never expanding `blocked`
    pub(crate) fn reachable(&self, blocked: Option<&str>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([START.to_string()]);
        while let Some(current) = queue.pop_front() {
            if blocked == Some(current.as_str()) {
                continue;
            }
            for next in self.successors(&current) {
                if seen.insert(next.to_string()) {
                    queue.push_back(next.to_string());
                }
            }
        }
        seen
    }
}

/// Mutable graph declaration; see the module docs
#[derive(Default)]
pub struct GraphBuilder {
    channels: BTreeMap<String, Box<dyn Channel>>,
    nodes: BTreeMap<String, NodeBuilder>,
    edges: Vec<(String, String)>,
    joins: Vec<(Vec<String>, String)>,
    branches: Vec<(String, Branch)>,
    input_channels: Option<Vec<String>>,
    output_channels: Option<Vec<String>>,
    duplicates: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, name: impl Into<String>, channel: impl Channel + 'static) -> &mut Self {
        let name = name.into();
        if self.channels.contains_key(&name) {
            self.duplicates.push(format!("channel '{name}' declared twice"));
        }
        self.channels.insert(name, Box::new(channel));
        self
    }

    pub fn add_node(&mut self, node: NodeBuilder) -> &mut Self {
        if self.nodes.contains_key(&node.name) {
            self.duplicates.push(format!("node '{}' declared twice", node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        self
    }

    /// Run `to` in the round after `from` ran
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Run `to` once every source ran, possibly in different rounds
    pub fn add_join<I, S>(&mut self, sources: I, to: impl Into<String>) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sources: Vec<String> = sources.into_iter().map(Into::into).collect();
        sources.sort();
        sources.dedup();
        self.joins.push((sources, to.into()));
        self
    }

    /// After `from` ran, run whatever `router` picks among `targets`
    ///
    /// The router sees the node's input merged with the node's own writes.
    /// It may return node names, [`END`], or [`Send`](crate::Send) packets
    /// addressed to a declared target.
    pub fn add_conditional_edges<F, I, S>(
        &mut self,
        from: impl Into<String>,
        router: F,
        targets: I,
    ) -> &mut Self
    where
        F: Fn(&Value) -> Vec<Route> + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let branch = Branch {
            router: Arc::new(router),
            targets: targets.into_iter().map(Into::into).collect(),
        };
        self.branches.push((from.into(), branch));
        self
    }

    /// Shorthand for an edge from [`START`]
    pub fn set_entry_point(&mut self, node: impl Into<String>) -> &mut Self {
        self.add_edge(START, node)
    }

    /// Channels the run input is written to; defaults to every channel
    pub fn set_input_channels<I, S>(&mut self, channels: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Channels reported as run output; defaults to every channel
    pub fn set_output_channels<I, S>(&mut self, channels: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Validate the declarations and produce an executable graph
    ///
    /// # Errors
    ///
    /// - [`GraphError::Validation`] for reserved or duplicate names, unknown
    ///   edge targets, or a graph without nodes or input channels
    /// - [`GraphError::UndeclaredChannel`] when a node or the input/output
    ///   lists name a channel that was never added
    /// - [`GraphError::UnreachableNode`] when a node can never run
    pub fn compile(&self) -> Result<CompiledGraph> {
        if let Some(duplicate) = self.duplicates.first() {
            return Err(GraphError::Validation(duplicate.clone()));
        }
        if self.nodes.is_empty() {
            return Err(GraphError::Validation("graph has no nodes".to_string()));
        }
        for name in self.channels.keys() {
            if is_reserved(name) {
                return Err(GraphError::Validation(format!(
                    "channel name '{name}' is reserved"
                )));
            }
        }
        for name in self.nodes.keys() {
            if is_reserved(name) {
                return Err(GraphError::Validation(format!(
                    "node name '{name}' is reserved"
                )));
            }
        }

        let user_channels: BTreeSet<String> = self.channels.keys().cloned().collect();
        let check_channel = |owner: &str, channel: &str| -> Result<()> {
            if user_channels.contains(channel) {
                Ok(())
            } else {
                Err(GraphError::UndeclaredChannel {
                    node: owner.to_string(),
                    channel: channel.to_string(),
                })
            }
        };
        let is_target = |name: &str| name == END || self.nodes.contains_key(name);

        for node in self.nodes.values() {
            for channel in node
                .subscribe_to
                .iter()
                .chain(&node.read_from)
                .chain(&node.write_to)
            {
                check_channel(&node.name, channel)?;
            }
            for target in &node.routes_to {
                if !is_target(target) {
                    return Err(GraphError::Validation(format!(
                        "node '{}' routes to unknown node '{target}'",
                        node.name
                    )));
                }
            }
        }

        let mut edges: HashMap<String, Edges> = HashMap::new();
        for (from, to) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge from unknown node '{from}'"
                )));
            }
            if !is_target(to) || (from == START && to == END) {
                return Err(GraphError::Validation(format!(
                    "edge from '{from}' to unknown node '{to}'"
                )));
            }
            if to != END {
                edges.entry(from.clone()).or_default().successors.push(to.clone());
            }
        }
        for (from, branch) in &self.branches {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "conditional edge from unknown node '{from}'"
                )));
            }
            if let Some(target) = branch.targets.iter().find(|t| !is_target(t)) {
                return Err(GraphError::Validation(format!(
                    "conditional edge from '{from}' to unknown node '{target}'"
                )));
            }
            edges.entry(from.clone()).or_default().branches.push(branch.clone());
        }

        let mut joins = Vec::new();
        for (sources, target) in &self.joins {
            if sources.is_empty() {
                return Err(GraphError::Validation(format!(
                    "join into '{target}' has no sources"
                )));
            }
            if let Some(source) = sources.iter().find(|s| !self.nodes.contains_key(*s)) {
                return Err(GraphError::Validation(format!(
                    "join source '{source}' is not a node"
                )));
            }
            if !self.nodes.contains_key(target) {
                return Err(GraphError::Validation(format!(
                    "join into unknown node '{target}'"
                )));
            }
            let channel = join_channel(sources, target);
            for source in sources {
                edges.entry(source.clone()).or_default().joins.push(channel.clone());
            }
            joins.push(JoinSpec {
                channel,
                sources: sources.clone(),
                target: target.clone(),
            });
        }

        let input_channels = self
            .input_channels
            .clone()
            .unwrap_or_else(|| user_channels.iter().cloned().collect());
        let output_channels = self
            .output_channels
            .clone()
            .unwrap_or_else(|| user_channels.iter().cloned().collect());
        for channel in &input_channels {
            check_channel(START, channel)?;
        }
        for channel in &output_channels {
            check_channel(END, channel)?;
        }
        if input_channels.is_empty() {
            return Err(GraphError::Validation(
                "graph declares no input channel".to_string(),
            ));
        }

        let mut channels: BTreeMap<String, Box<dyn Channel>> = self
            .channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.clone_box()))
            .collect();
        channels.insert(TASKS.to_string(), Box::new(TopicChannel::new()));
        for join in &joins {
            channels.insert(
                join.channel.clone(),
                Box::new(NamedBarrierValueChannel::new(join.sources.clone())),
            );
        }

        let mut nodes = BTreeMap::new();
        for (name, node) in &self.nodes {
            let branch = branch_channel(name);
            channels.insert(branch.clone(), Box::new(EphemeralValueChannel::new_unguarded()));

            let mut triggers = node.subscribe_to.clone();
            triggers.push(branch);
            triggers.extend(
                joins
                    .iter()
                    .filter(|j| &j.target == name)
                    .map(|j| j.channel.clone()),
            );
            triggers.sort();
            triggers.dedup();

            nodes.insert(
                name.clone(),
                NodeSpec {
                    name: name.clone(),
                    body: node.body.clone(),
                    subscribe_to: node.subscribe_to.clone(),
                    read_from: node.read_from.clone(),
                    write_to: node.write_to.iter().cloned().collect(),
                    routes_to: node.routes_to.iter().cloned().collect(),
                    triggers,
                    edges: edges.remove(name).unwrap_or_default(),
                    cache_policy: node.cache_policy.clone(),
                    subgraph: node.subgraph.clone(),
                },
            );
        }

        let spec = GraphSpec {
            nodes,
            channels,
            user_channels,
            input_channels,
            output_channels,
            start: edges.remove(START).unwrap_or_default(),
            joins,
        };

        let reachable = spec.reachable(None);
        if let Some(name) = spec.nodes.keys().find(|n| !reachable.contains(*n)) {
            return Err(GraphError::UnreachableNode(name.clone()));
        }

        tracing::debug!(
            nodes = spec.nodes.len(),
            channels = spec.channels.len(),
            joins = spec.joins.len(),
            "Compiled graph"
        );
        Ok(CompiledGraph::new(spec))
    }
}
