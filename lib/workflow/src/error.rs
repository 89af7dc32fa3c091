//! Error types for the workflow crate.
//!
//! Errors are grouped per layer:
//! - `GraphError` / `GraphWarning`: definition-time validation findings
//! - `ExecutionError`: failures while executing a node inside a run
//! - `EngineError`: operation-level failures returned by the runner
//!
//! Store and queue adapters report through `StoreError` and `QueueError`
//! (defined next to their traits), which convert into `EngineError`. Public
//! runner operations wrap `EngineError` in a rootcause `Report`.

use crate::queue::QueueError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use stepweave_core::RunId;
use std::fmt;

/// A validation error in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The instance names a function that is not registered.
    UnknownFunction { instance_id: String, node_id: String },
    /// A `$ref` names an instance that does not exist.
    UnresolvedRef {
        instance_id: String,
        field: String,
        source_id: String,
    },
    /// A `next` or `onError` target does not exist.
    UnknownTarget { instance_id: String, target: String },
    /// A conditional `next` misses branches and declares no `default`.
    UncoveredBranches {
        instance_id: String,
        missing: Vec<String>,
    },
    /// `onError` is declared on a behavior with no error channel.
    ErrorChannelUnsupported { instance_id: String, node_id: String },
    /// A control-flow cycle has no bounded member.
    UnboundedCycle { members: Vec<String> },
    /// An instance uses the reserved `trigger` ID.
    ReservedInstanceId { instance_id: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction {
                instance_id,
                node_id,
            } => write!(f, "instance '{instance_id}' uses unknown function '{node_id}'"),
            Self::UnresolvedRef {
                instance_id,
                field,
                source_id,
            } => write!(
                f,
                "input '{field}' of instance '{instance_id}' references unknown instance '{source_id}'"
            ),
            Self::UnknownTarget {
                instance_id,
                target,
            } => write!(f, "instance '{instance_id}' routes to unknown instance '{target}'"),
            Self::UncoveredBranches {
                instance_id,
                missing,
            } => write!(
                f,
                "instance '{instance_id}' does not cover branches [{}] and declares no default",
                missing.join(", ")
            ),
            Self::ErrorChannelUnsupported {
                instance_id,
                node_id,
            } => write!(
                f,
                "instance '{instance_id}' declares onError but '{node_id}' has no error channel"
            ),
            Self::UnboundedCycle { members } => {
                write!(f, "unbounded cycle through [{}]", members.join(", "))
            }
            Self::ReservedInstanceId { instance_id } => {
                write!(f, "instance ID '{instance_id}' is reserved")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// A validation finding that does not prevent registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphWarning {
    /// No path leads from an entry node to this instance.
    Unreachable { instance_id: String },
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { instance_id } => {
                write!(f, "instance '{instance_id}' is unreachable from any entry node")
            }
        }
    }
}

/// Serializable error attached to a failed node result or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Errors raised while executing a node within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// A conditional node returned without selecting a branch.
    MissingBranchSelection { instance_id: String },
    /// A node selected a branch that is neither mapped nor covered by `default`.
    UnknownBranch { instance_id: String, branch: String },
    /// The instance was about to run past its iteration bound.
    MaxIterationsExceeded {
        instance_id: String,
        iteration: u32,
        limit: u32,
    },
    /// The node's function failed and no `onError` route was declared.
    NodeFailed {
        instance_id: String,
        message: String,
        code: Option<String>,
    },
    /// An input referenced an instance that has not completed.
    UnresolvedReference {
        instance_id: String,
        source_id: String,
    },
    /// The run state refers to an instance the graph does not contain.
    UnknownInstance { instance_id: String },
    /// The instance names a function with no registered handler.
    UnknownFunction { instance_id: String, node_id: String },
}

impl ExecutionError {
    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::MissingBranchSelection { .. } => "missing_branch_selection",
            Self::UnknownBranch { .. } => "unknown_branch",
            Self::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            Self::NodeFailed { code, .. } => code.as_deref().unwrap_or("node_execution_error"),
            Self::UnresolvedReference { .. } => "unresolved_reference",
            Self::UnknownInstance { .. } => "unknown_instance",
            Self::UnknownFunction { .. } => "unknown_function",
        }
    }

    /// Converts to the payload recorded on a failed run.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.to_string()).with_code(self.code())
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBranchSelection { instance_id } => {
                write!(f, "conditional instance '{instance_id}' did not select a branch")
            }
            Self::UnknownBranch {
                instance_id,
                branch,
            } => write!(f, "instance '{instance_id}' selected unknown branch '{branch}'"),
            Self::MaxIterationsExceeded {
                instance_id,
                iteration,
                limit,
            } => write!(
                f,
                "instance '{instance_id}' exceeded max iterations ({iteration} > {limit})"
            ),
            Self::NodeFailed {
                instance_id,
                message,
                ..
            } => write!(f, "instance '{instance_id}' failed: {message}"),
            Self::UnresolvedReference {
                instance_id,
                source_id,
            } => write!(
                f,
                "instance '{instance_id}' references '{source_id}' which has not completed"
            ),
            Self::UnknownInstance { instance_id } => {
                write!(f, "unknown instance '{instance_id}'")
            }
            Self::UnknownFunction {
                instance_id,
                node_id,
            } => write!(f, "instance '{instance_id}' uses unknown function '{node_id}'"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Errors returned by runner operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No workflow is registered under the name.
    WorkflowNotFound { name: String },
    /// No run exists with the ID.
    RunNotFound { run_id: RunId },
    /// The workflow failed validation.
    InvalidWorkflow {
        name: String,
        errors: Vec<GraphError>,
    },
    /// No instance could run with only the trigger input available.
    NoEntryNodesReady { workflow: String },
    /// The run failed during the turn driven by this call.
    RunFailed { run_id: RunId, error: ErrorPayload },
    /// The registered graph no longer matches the graph the run started with.
    GraphMismatch {
        run_id: RunId,
        expected: String,
        actual: String,
    },
    /// Step state store failure.
    Store(StoreError),
    /// Queue transport failure.
    Queue(QueueError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { name } => write!(f, "workflow not found: {name}"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::InvalidWorkflow { name, errors } => {
                write!(f, "workflow '{name}' is invalid: ")?;
                for (i, error) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{error}")?;
                }
                Ok(())
            }
            Self::NoEntryNodesReady { workflow } => {
                write!(f, "no entry nodes ready for workflow '{workflow}'")
            }
            Self::RunFailed { run_id, error } => write!(f, "run {run_id} failed: {error}"),
            Self::GraphMismatch {
                run_id,
                expected,
                actual,
            } => write!(
                f,
                "graph for run {run_id} changed (started with {expected}, registered {actual})"
            ),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Queue(e) => write!(f, "queue error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for EngineError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}
