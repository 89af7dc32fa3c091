//! Per-run execution state.
//!
//! `RunState` is the runner's view of one run: which instances are activated,
//! which are in flight, and the latest result of each completed instance.
//! It is mutated only by the runner and persisted as a snapshot after every
//! turn, so a continuation on any process can pick the run up.

use crate::error::ErrorPayload;
use crate::graph::{NodeInstance, TRIGGER_SOURCE, WorkflowGraph};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use stepweave_core::RunId;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns true once the run can no longer change status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one execution of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub instance_id: String,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
}

impl NodeExecutionResult {
    #[must_use]
    pub fn success(instance_id: impl Into<String>, iteration: u32, output: JsonValue) -> Self {
        Self {
            instance_id: instance_id.into(),
            iteration,
            output: Some(output),
            error: None,
            selected_branch: None,
        }
    }

    #[must_use]
    pub fn failure(instance_id: impl Into<String>, iteration: u32, error: ErrorPayload) -> Self {
        Self {
            instance_id: instance_id.into(),
            iteration,
            output: None,
            error: Some(error),
            selected_branch: None,
        }
    }

    #[must_use]
    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.selected_branch = branch;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Complete state of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: RunId,
    pub workflow: String,
    pub graph_hash: String,
    pub input: JsonValue,
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    pub status: RunStatus,
    /// Completed-execution count per instance.
    #[serde(default)]
    pub iterations: BTreeMap<String, u32>,
    /// Latest result per instance.
    #[serde(default)]
    pub completed: BTreeMap<String, NodeExecutionResult>,
    /// Instances handed off for deferred execution.
    #[serde(default)]
    pub executing: BTreeSet<String>,
    /// Instances routed to and awaiting execution.
    #[serde(default)]
    pub activated: BTreeSet<String>,
    /// Instances whose latest execution routed nowhere.
    #[serde(default)]
    pub terminals: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Creates a running state with the given instances activated.
    #[must_use]
    pub fn new(
        run_id: RunId,
        workflow: impl Into<String>,
        graph_hash: impl Into<String>,
        input: JsonValue,
        activated: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            graph_hash: graph_hash.into(),
            input,
            output: None,
            error: None,
            status: RunStatus::Running,
            iterations: BTreeMap::new(),
            completed: BTreeMap::new(),
            executing: BTreeSet::new(),
            activated,
            terminals: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The iteration the instance would run as next.
    #[must_use]
    pub fn iteration_of(&self, instance_id: &str) -> u32 {
        self.iterations.get(instance_id).copied().unwrap_or(0)
    }

    /// Returns true if a `$ref` to `source_id` can be resolved now.
    #[must_use]
    pub fn is_available(&self, source_id: &str) -> bool {
        source_id == TRIGGER_SOURCE
            || self
                .completed
                .get(source_id)
                .is_some_and(|result| result.output.is_some())
    }

    #[must_use]
    pub fn dependencies_satisfied(&self, node: &NodeInstance) -> bool {
        node.refs().all(|(_, r)| self.is_available(&r.source_id))
    }

    /// Activated instances whose dependencies are satisfied and that are not in flight.
    ///
    /// Instances missing from the graph are reported as ready so the
    /// executor surfaces them as errors instead of stalling the run.
    #[must_use]
    pub fn ready_instances(&self, graph: &WorkflowGraph) -> Vec<String> {
        self.activated
            .iter()
            .filter(|id| !self.executing.contains(*id))
            .filter(|id| {
                graph
                    .get(id)
                    .is_none_or(|node| self.dependencies_satisfied(node))
            })
            .cloned()
            .collect()
    }

    /// Activated instances that cannot run yet.
    #[must_use]
    pub fn blocked_instances(&self, graph: &WorkflowGraph) -> Vec<String> {
        let ready: BTreeSet<String> = self.ready_instances(graph).into_iter().collect();
        self.activated
            .iter()
            .filter(|id| !self.executing.contains(*id) && !ready.contains(*id))
            .cloned()
            .collect()
    }

    /// Consumes the instance's activation and marks it in flight.
    pub fn mark_executing(&mut self, instance_id: &str) {
        self.activated.remove(instance_id);
        self.executing.insert(instance_id.to_string());
    }

    /// Consumes the instance's activation without marking it in flight.
    ///
    /// Used for inline execution, which finishes within the turn.
    pub fn take_activation(&mut self, instance_id: &str) {
        self.activated.remove(instance_id);
    }

    /// Folds a finished execution into the state and activates its successors.
    pub fn record_result(&mut self, result: NodeExecutionResult, targets: &[String]) {
        let id = result.instance_id.clone();
        self.executing.remove(&id);
        *self.iterations.entry(id.clone()).or_insert(0) += 1;
        self.completed.insert(id.clone(), result);

        if targets.is_empty() {
            self.terminals.insert(id);
        } else {
            self.terminals.remove(&id);
            self.activated.extend(targets.iter().cloned());
        }
    }

    /// Builds the run output: each terminal instance mapped to its output.
    #[must_use]
    pub fn collect_output(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .terminals
            .iter()
            .map(|id| {
                let output = self
                    .completed
                    .get(id)
                    .and_then(|result| result.output.clone())
                    .unwrap_or(JsonValue::Null);
                (id.clone(), output)
            })
            .collect();
        JsonValue::Object(map)
    }

    /// Finalizes the run as completed. Returns false if already terminal.
    pub fn complete(&mut self, output: JsonValue, timestamp: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Completed;
        self.output = Some(output);
        self.finish(timestamp);
        true
    }

    /// Finalizes the run as failed. Returns false if already terminal.
    pub fn fail(&mut self, error: ErrorPayload, timestamp: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.finish(timestamp);
        true
    }

    /// Finalizes the run as cancelled. Returns false if already terminal.
    pub fn cancel(&mut self, timestamp: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Cancelled;
        self.finish(timestamp);
        true
    }

    pub fn touch(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
    }

    fn finish(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.finished_at = Some(timestamp);
    }
}
