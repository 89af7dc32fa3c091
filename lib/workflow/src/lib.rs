//! Workflow graph execution engine for stepweave.
//!
//! This crate runs multi-step, potentially long-lived processes described as
//! a graph of named steps:
//!
//! - **Graph Model**: instances keyed by ID with data (`$ref`) and control
//!   (`next`, `onError`) edges, validated against the function registry
//! - **Node Executor**: input resolution, invocation, branch and error routing
//! - **Graph Runner**: turn-based orchestration with crash-resilient snapshots
//! - **Deferred Execution Bridge**: queued step workers and continuations
//! - **Flow Control**: `ifCondition`, `switchCase`, `whileLoop`, `forLoop`,
//!   `delay`, `merge`

pub mod bridge;
pub mod definition;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod flow;
pub mod graph;
pub mod memory;
pub mod nats;
pub mod queue;
pub mod registry;
pub mod run_state;
pub mod runner;
pub mod store;
pub mod validate;

pub use bridge::{
    ContinueMessage, OrchestratorWorker, RetryPolicy, StepDisposition, StepMessage, StepWorker,
    orchestrator_queue, register_workers, step_queue,
};
pub use definition::{RegisteredWorkflow, Workflow, WorkflowRegistry};
pub use error::{EngineError, ErrorPayload, ExecutionError, GraphError, GraphWarning};
pub use flow::register_flow_control;
pub use graph::{DataRef, ExecutionMode, InputValue, Next, NodeInstance, Targets, WorkflowGraph};
pub use memory::InMemoryStepStore;
pub use nats::{NatsConfig, NatsQueue};
pub use queue::{HandlerError, InMemoryQueue, Queue, QueueError, QueueHandler};
pub use registry::{FunctionRegistry, FunctionSpec, GraphContext, InvokeError, Invoker};
pub use run_state::{NodeExecutionResult, RunState, RunStatus};
pub use runner::{EngineConfig, GraphRunner, StartedRun, TurnOutcome};
pub use store::{RunRecord, StepState, StepStateStore, StepStatus, StoreError};
pub use validate::{ValidationReport, validate};
