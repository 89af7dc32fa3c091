//! Workflow graph model.
//!
//! A workflow graph is a mapping from instance ID to [`NodeInstance`]. Edges
//! are stored as data on each instance (`next`, `onError`, and `$ref` inputs)
//! rather than as linked objects, so cycles are ordinary data and the whole
//! graph serializes as plain JSON:
//!
//! ```json
//! {
//!   "fetch": { "nodeId": "fetchOrder", "input": { "id": { "$ref": "trigger", "path": "orderId" } }, "next": "check" },
//!   "check": { "nodeId": "ifCondition", "input": { "condition": { "$ref": "fetch", "path": "paid" } },
//!              "next": { "true": "ship", "false": "remind" } },
//!   "ship": { "nodeId": "shipOrder" },
//!   "remind": { "nodeId": "sendReminder" }
//! }
//! ```
//!
//! Analyses that need graph algorithms build a petgraph index over the
//! instance IDs on demand (see [`WorkflowGraph::analysis_graph`]).

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Source ID that refers to the run's input rather than another instance.
pub const TRIGGER_SOURCE: &str = "trigger";

/// A reference to another instance's output (or the run input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataRef {
    /// The referenced instance ID, or [`TRIGGER_SOURCE`].
    #[serde(rename = "$ref")]
    pub source_id: String,
    /// Optional dot-notation projection into the source output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DataRef {
    /// Creates a reference to the whole output of `source_id`.
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            path: None,
        }
    }

    /// Creates a reference to the run input.
    #[must_use]
    pub fn trigger() -> Self {
        Self::new(TRIGGER_SOURCE)
    }

    /// Sets the projection path.
    #[must_use]
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns true if this reference points at the run input.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.source_id == TRIGGER_SOURCE
    }
}

/// A node input field: either a reference or a literal JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Value read from another instance's output at run time.
    Ref(DataRef),
    /// Value passed through unchanged.
    Literal(JsonValue),
}

impl InputValue {
    /// Returns the reference, if this is one.
    #[must_use]
    pub fn as_ref(&self) -> Option<&DataRef> {
        match self {
            Self::Ref(data_ref) => Some(data_ref),
            Self::Literal(_) => None,
        }
    }
}

impl From<DataRef> for InputValue {
    fn from(data_ref: DataRef) -> Self {
        Self::Ref(data_ref)
    }
}

impl From<JsonValue> for InputValue {
    fn from(value: JsonValue) -> Self {
        Self::Literal(value)
    }
}

/// One or more instance IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    /// A single successor.
    One(String),
    /// Several successors, all activated.
    Many(Vec<String>),
}

impl Targets {
    /// Iterates over the target IDs.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(id) => std::slice::from_ref(id),
            Self::Many(ids) => ids.as_slice(),
        };
        slice.iter().map(String::as_str)
    }

    /// Returns the targets as owned IDs.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.iter().map(str::to_string).collect()
    }
}

impl From<&str> for Targets {
    fn from(id: &str) -> Self {
        Self::One(id.to_string())
    }
}

/// Control-flow successors of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Next {
    /// Sequential: one successor.
    Sequential(String),
    /// Unconditional parallel fan-out.
    Parallel(Vec<String>),
    /// Conditional fan-out keyed by branch name; the node selects the branch.
    Conditional(BTreeMap<String, Targets>),
}

/// Branch key used when the selected branch has no explicit mapping.
pub const DEFAULT_BRANCH: &str = "default";

impl Next {
    /// Returns true if the node must select a branch at run time.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional(_))
    }

    /// Returns every instance ID this `next` can route to.
    #[must_use]
    pub fn all_targets(&self) -> Vec<&str> {
        match self {
            Self::Sequential(id) => vec![id.as_str()],
            Self::Parallel(ids) => ids.iter().map(String::as_str).collect(),
            Self::Conditional(branches) => branches.values().flat_map(Targets::iter).collect(),
        }
    }

    /// Returns the branch names of a conditional `next`.
    #[must_use]
    pub fn branch_names(&self) -> Vec<&str> {
        match self {
            Self::Conditional(branches) => branches.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// Execution mode for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Executed synchronously within the orchestrator turn.
    #[default]
    Inline,
    /// Routed through the queue and executed by a step worker.
    Deferred,
}

/// One node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInstance {
    /// The registered function or node behavior to invoke.
    pub node_id: String,
    /// Input fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, InputValue>,
    /// Successors taken on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Next>,
    /// Successors taken on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Targets>,
    /// Per-instance loop-safety bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Overrides the execution mode declared by the function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
}

impl NodeInstance {
    /// Creates an instance of the given function with no inputs or edges.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            input: BTreeMap::new(),
            next: None,
            on_error: None,
            max_iterations: None,
            mode: None,
        }
    }

    /// Adds a literal input field.
    #[must_use]
    pub fn with_literal(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.input.insert(field.into(), InputValue::Literal(value));
        self
    }

    /// Adds a reference input field.
    #[must_use]
    pub fn with_ref(mut self, field: impl Into<String>, data_ref: DataRef) -> Self {
        self.input.insert(field.into(), InputValue::Ref(data_ref));
        self
    }

    /// Sets a sequential successor.
    #[must_use]
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(Next::Sequential(next.into()));
        self
    }

    /// Sets parallel successors.
    #[must_use]
    pub fn fan_out<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next = Some(Next::Parallel(targets.into_iter().map(Into::into).collect()));
        self
    }

    /// Adds a conditional branch.
    #[must_use]
    pub fn branch(mut self, name: impl Into<String>, targets: impl Into<Targets>) -> Self {
        let mut branches = match self.next.take() {
            Some(Next::Conditional(branches)) => branches,
            _ => BTreeMap::new(),
        };
        branches.insert(name.into(), targets.into());
        self.next = Some(Next::Conditional(branches));
        self
    }

    /// Sets the error route.
    #[must_use]
    pub fn on_error(mut self, targets: impl Into<Targets>) -> Self {
        self.on_error = Some(targets.into());
        self
    }

    /// Sets the per-instance loop bound.
    #[must_use]
    pub fn max_iterations(mut self, bound: u32) -> Self {
        self.max_iterations = Some(bound);
        self
    }

    /// Overrides the execution mode.
    #[must_use]
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Iterates over the reference inputs as `(field, ref)` pairs.
    pub fn refs(&self) -> impl Iterator<Item = (&str, &DataRef)> {
        self.input
            .iter()
            .filter_map(|(field, value)| value.as_ref().map(|r| (field.as_str(), r)))
    }

    /// Returns every instance ID reachable by a control edge from this node.
    #[must_use]
    pub fn control_targets(&self) -> Vec<&str> {
        let mut targets = self.next.as_ref().map(Next::all_targets).unwrap_or_default();
        if let Some(on_error) = &self.on_error {
            targets.extend(on_error.iter());
        }
        targets
    }
}

/// Kind of edge in the analysis graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// `next` successor.
    Next,
    /// `onError` successor.
    OnError,
    /// Data dependency: source output feeds the target's input.
    Data,
}

/// A workflow graph keyed by instance ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, NodeInstance>,
}

impl WorkflowGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instance, returning any instance previously stored under the ID.
    pub fn insert(&mut self, id: impl Into<String>, node: NodeInstance) -> Option<NodeInstance> {
        self.nodes.insert(id.into(), node)
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, id: impl Into<String>, node: NodeInstance) -> Self {
        self.insert(id, node);
        self
    }

    /// Returns an instance by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NodeInstance> {
        self.nodes.get(id)
    }

    /// Returns true if the instance exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterates over `(id, instance)` pairs in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeInstance)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Returns the number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns instances that no `next` or `onError` edge points at.
    ///
    /// These are activated when a run starts; every other instance waits to
    /// be routed to.
    #[must_use]
    pub fn roots(&self) -> BTreeSet<String> {
        let targeted: BTreeSet<&str> = self
            .nodes
            .values()
            .flat_map(NodeInstance::control_targets)
            .collect();
        self.nodes
            .keys()
            .filter(|id| !targeted.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Returns roots whose inputs reference only the trigger.
    ///
    /// These are the instances that can run before anything has completed.
    #[must_use]
    pub fn entry_nodes(&self) -> BTreeSet<String> {
        self.roots()
            .into_iter()
            .filter(|id| {
                self.nodes
                    .get(id)
                    .is_some_and(|node| node.refs().all(|(_, r)| r.is_trigger()))
            })
            .collect()
    }

    /// Builds a petgraph view over the instances for analysis.
    ///
    /// Edges pointing at unknown instances are omitted; validation reports
    /// them separately.
    #[must_use]
    pub fn analysis_graph(&self) -> (DiGraph<&str, EdgeKind>, HashMap<&str, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in self.nodes.keys() {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }

        for (id, node) in &self.nodes {
            let source = index[id.as_str()];
            let next_targets = node.next.as_ref().map(Next::all_targets).unwrap_or_default();
            for target in next_targets {
                if let Some(&target_idx) = index.get(target) {
                    graph.add_edge(source, target_idx, EdgeKind::Next);
                }
            }
            for target in node.on_error.iter().flat_map(Targets::iter) {
                if let Some(&target_idx) = index.get(target) {
                    graph.add_edge(source, target_idx, EdgeKind::OnError);
                }
            }
            for (_, data_ref) in node.refs() {
                if let Some(&dep_idx) = index.get(data_ref.source_id.as_str()) {
                    graph.add_edge(dep_idx, source, EdgeKind::Data);
                }
            }
        }

        (graph, index)
    }

    /// Returns a stable SHA-256 hash of the graph's canonical JSON form.
    #[must_use]
    pub fn content_hash(&self) -> String {
        // BTreeMap keys serialize in order, so the encoding is deterministic.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}
