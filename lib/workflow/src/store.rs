//! Step state store contract.
//!
//! The store is the durable substrate for runs and steps, and the authority
//! for step idempotency: a step worker executes a step only after winning
//! [`StepStateStore::claim_step`]. Writes are keyed by `(run_id, step_name)`
//! and must be check-then-set safe.

use crate::error::ErrorPayload;
use crate::run_state::{RunState, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use stepweave_core::{RunId, StepId};

/// Status of a persisted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true once the step has a final outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one step (one execution of one instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: StepId,
    pub run_id: RunId,
    /// `"{instance_id}:{iteration}"`.
    pub step_name: String,
    /// The function invoked.
    pub rpc_name: String,
    pub input: JsonValue,
    pub status: StepStatus,
    pub result: Option<JsonValue>,
    pub selected_branch: Option<String>,
    pub error: Option<ErrorPayload>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow: String,
    pub input: JsonValue,
    pub status: RunStatus,
    pub output: Option<JsonValue>,
    pub error: Option<ErrorPayload>,
    /// True when the run executes a workflow graph.
    pub is_graph_source: bool,
    pub graph_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Errors from step state store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No run exists with the ID.
    RunNotFound { run_id: RunId },
    /// No step exists with the name in the run.
    StepNotFound { run_id: RunId, step_name: String },
    /// The backing store failed.
    Backend { message: String },
    /// Stored data could not be encoded or decoded.
    Serialization { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::StepNotFound { run_id, step_name } => {
                write!(f, "step '{step_name}' not found in run {run_id}")
            }
            Self::Backend { message } => write!(f, "store backend failed: {message}"),
            Self::Serialization { message } => write!(f, "store serialization failed: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable storage for runs and steps.
#[async_trait]
pub trait StepStateStore: Send + Sync {
    /// Creates a run in `running` status and returns its ID.
    async fn create_run(
        &self,
        workflow: &str,
        input: &JsonValue,
        is_graph_source: bool,
        graph_hash: Option<&str>,
    ) -> Result<RunId, StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<&JsonValue>,
        error: Option<&ErrorPayload>,
    ) -> Result<(), StoreError>;

    /// Records a step as pending and returns its ID.
    ///
    /// Inserting an existing `(run_id, step_name)` returns the existing ID
    /// and leaves the row untouched.
    async fn insert_step_state(
        &self,
        run_id: RunId,
        step_name: &str,
        rpc_name: &str,
        input: &JsonValue,
    ) -> Result<StepId, StoreError>;

    /// Atomically moves a step to `running` and counts the attempt.
    ///
    /// Succeeds for a `pending` step, or a `running` step untouched for at
    /// least `stale_after` (its worker is presumed lost). Returns the new
    /// attempt count, or `None` if another worker holds the step or it has
    /// finished.
    async fn claim_step(
        &self,
        step_id: StepId,
        stale_after: Duration,
    ) -> Result<Option<u32>, StoreError>;

    /// Records a step's output. A step already `done` is left unchanged.
    async fn set_step_result(
        &self,
        run_id: RunId,
        step_name: &str,
        result: &JsonValue,
        selected_branch: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Records a step's final failure. A step already `done` is left unchanged.
    async fn set_step_error(
        &self,
        run_id: RunId,
        step_name: &str,
        error: &ErrorPayload,
    ) -> Result<(), StoreError>;

    /// Records a failed attempt that will be retried.
    async fn set_step_retrying(
        &self,
        run_id: RunId,
        step_name: &str,
        error: &ErrorPayload,
    ) -> Result<(), StoreError>;

    async fn get_step_state(
        &self,
        run_id: RunId,
        step_name: &str,
    ) -> Result<Option<StepState>, StoreError>;

    /// Persists the runner's snapshot of a run.
    async fn save_run_state(&self, state: &RunState) -> Result<(), StoreError>;

    async fn load_run_state(&self, run_id: RunId) -> Result<Option<RunState>, StoreError>;
}

/// Formats the step name for one execution of an instance.
#[must_use]
pub fn step_name(instance_id: &str, iteration: u32) -> String {
    format!("{instance_id}:{iteration}")
}
