//! The graph runner: the orchestration loop for workflow runs.
//!
//! A run advances in turns. Each turn loads the run's snapshot, folds in any
//! deferred steps that finished since the last turn, then repeatedly executes
//! every ready instance until nothing more can run in-process. Inline
//! instances execute within the turn; deferred instances are recorded in the
//! step store, marked executing, and handed to the queue once the snapshot is
//! saved. A turn ends in one of the [`TurnOutcome`]s.
//!
//! Turns for one run never overlap within a process: the runner holds a
//! per-run async lock for the duration of each turn.

use crate::bridge::{StepMessage, step_queue};
use crate::definition::{RegisteredWorkflow, WorkflowRegistry};
use crate::envelope;
use crate::error::{EngineError, ErrorPayload, ExecutionError};
use crate::executor::{Invocation, NodeExecutor, interpret, resolve_inputs, successors};
use crate::graph::{ExecutionMode, NodeInstance, WorkflowGraph};
use crate::queue::{Queue, QueueError};
use crate::registry::{FunctionRegistry, InvokeError};
use crate::run_state::{RunState, RunStatus};
use crate::store::{StepStateStore, StepStatus, step_name};
use chrono::Utc;
use futures::future::join_all;
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use stepweave_core::RunId;
use tracing::{debug, error, info, instrument, warn};

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Iteration bound for instances without their own `maxIterations`.
    pub default_max_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 100,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The run completed with the given output.
    Completed { output: JsonValue },
    /// The run failed.
    Failed { error: ErrorPayload },
    /// Deferred steps are in flight; a continuation will resume the run.
    Suspended { waiting_on: Vec<String> },
    /// The run was already terminal; nothing was done.
    Inactive { status: RunStatus },
}

/// Result of starting a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedRun {
    pub run_id: RunId,
    pub outcome: TurnOutcome,
}

/// Drives workflow runs against a store and a queue.
pub struct GraphRunner<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    functions: Arc<FunctionRegistry>,
    workflows: Arc<WorkflowRegistry>,
    config: EngineConfig,
    turn_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: StepStateStore, Q: Queue> GraphRunner<S, Q> {
    #[must_use]
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        functions: Arc<FunctionRegistry>,
        workflows: Arc<WorkflowRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            functions,
            workflows,
            config,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    #[must_use]
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    #[must_use]
    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a run and drives its first turn.
    ///
    /// # Errors
    ///
    /// - `WorkflowNotFound` if no workflow has the name
    /// - `NoEntryNodesReady` if nothing can run on the trigger alone; no run
    ///   is persisted
    /// - `RunFailed` if the first turn failed the run; the failed run is
    ///   persisted and visible through [`get_run`](Self::get_run)
    #[instrument(skip(self, input), fields(workflow = %workflow))]
    pub async fn start_run(
        &self,
        workflow: &str,
        input: JsonValue,
    ) -> Result<StartedRun, Report<EngineError>> {
        Ok(self.start(workflow, input).await?)
    }

    /// Resumes a run after deferred work finished.
    ///
    /// Continuations are idempotent: a run with nothing new to fold simply
    /// re-suspends, and a terminal run is left untouched. A run whose
    /// workflow is no longer registered, or whose graph changed since it
    /// started, is failed (`workflow_not_found`, `graph_mismatch`).
    ///
    /// # Errors
    ///
    /// Returns an error if the run is missing or the store or queue fails.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn continue_graph(&self, run_id: RunId) -> Result<TurnOutcome, Report<EngineError>> {
        Ok(self.resume(run_id).await?)
    }

    /// Cancels a running run. Returns false if the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run, or a store error.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: RunId) -> Result<bool, Report<EngineError>> {
        Ok(self.cancel(run_id).await?)
    }

    /// Returns the current state of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for an unknown run, or a store error.
    pub async fn get_run(&self, run_id: RunId) -> Result<RunState, Report<EngineError>> {
        let state = self
            .store
            .load_run_state(run_id)
            .await
            .map_err(EngineError::from)?
            .ok_or(EngineError::RunNotFound { run_id })?;
        Ok(state)
    }

    async fn start(&self, name: &str, input: JsonValue) -> Result<StartedRun, EngineError> {
        let registered = self
            .workflows
            .get(name)
            .ok_or_else(|| EngineError::WorkflowNotFound {
                name: name.to_string(),
            })?;
        let graph = &registered.workflow.graph;

        if graph.entry_nodes().is_empty() {
            return Err(EngineError::NoEntryNodesReady {
                workflow: name.to_string(),
            });
        }

        let run_id = self
            .store
            .create_run(name, &input, true, Some(&registered.graph_hash))
            .await?;
        info!(run_id = %run_id, "run started");

        let state = RunState::new(
            run_id,
            name,
            registered.graph_hash.clone(),
            input,
            graph.roots(),
            Utc::now(),
        );

        let lock = self.turn_lock(run_id);
        let _turn = lock.lock().await;
        let outcome = self.drive(&registered, state).await?;

        if let TurnOutcome::Failed { error } = outcome {
            return Err(EngineError::RunFailed { run_id, error });
        }
        Ok(StartedRun { run_id, outcome })
    }

    async fn resume(&self, run_id: RunId) -> Result<TurnOutcome, EngineError> {
        let lock = self.turn_lock(run_id);
        let _turn = lock.lock().await;

        let Some(state) = self.store.load_run_state(run_id).await? else {
            self.release_turn_lock(run_id);
            return Err(EngineError::RunNotFound { run_id });
        };

        if state.is_terminal() {
            debug!(status = %state.status, "continuation for inactive run ignored");
            self.release_turn_lock(run_id);
            return Ok(TurnOutcome::Inactive {
                status: state.status,
            });
        }

        let Some(registered) = self.workflows.get(&state.workflow) else {
            let cause = EngineError::WorkflowNotFound {
                name: state.workflow.clone(),
            };
            return self.abandon(state, &cause, "workflow_not_found").await;
        };
        if registered.graph_hash != state.graph_hash {
            let cause = EngineError::GraphMismatch {
                run_id,
                expected: state.graph_hash.clone(),
                actual: registered.graph_hash.clone(),
            };
            return self.abandon(state, &cause, "graph_mismatch").await;
        }

        self.drive(&registered, state).await
    }

    /// Fails a run whose graph can no longer be driven.
    async fn abandon(
        &self,
        mut state: RunState,
        cause: &EngineError,
        code: &str,
    ) -> Result<TurnOutcome, EngineError> {
        let error = ErrorPayload::new(cause.to_string()).with_code(code);
        error!(run_id = %state.run_id, error = %error, "run cannot continue");
        state.fail(error.clone(), Utc::now());

        self.store.save_run_state(&state).await?;
        self.store
            .update_run_status(state.run_id, state.status, None, state.error.as_ref())
            .await?;
        self.release_turn_lock(state.run_id);
        Ok(TurnOutcome::Failed { error })
    }

    async fn cancel(&self, run_id: RunId) -> Result<bool, EngineError> {
        let lock = self.turn_lock(run_id);
        let _turn = lock.lock().await;

        let Some(mut state) = self.store.load_run_state(run_id).await? else {
            self.release_turn_lock(run_id);
            return Err(EngineError::RunNotFound { run_id });
        };

        if !state.cancel(Utc::now()) {
            self.release_turn_lock(run_id);
            return Ok(false);
        }
        self.store.save_run_state(&state).await?;
        self.store
            .update_run_status(run_id, RunStatus::Cancelled, None, None)
            .await?;
        self.release_turn_lock(run_id);
        info!(in_flight = state.executing.len(), "run cancelled");
        Ok(true)
    }

    /// Runs one turn and persists its result.
    async fn drive(
        &self,
        registered: &RegisteredWorkflow,
        mut state: RunState,
    ) -> Result<TurnOutcome, EngineError> {
        let graph = &registered.workflow.graph;
        let mut dispatch = Vec::new();

        let fatal = match self.fold_deferred(graph, &mut state).await? {
            Some(error) => Some(error),
            None => {
                self.execute_ready(registered, &mut state, &mut dispatch)
                    .await?
            }
        };

        let now = Utc::now();
        let outcome = if let Some(error) = fatal {
            let payload = error.to_payload();
            error!(run_id = %state.run_id, error = %error, "run failed");
            state.fail(payload.clone(), now);
            TurnOutcome::Failed { error: payload }
        } else if state.executing.is_empty() {
            let skipped = state.blocked_instances(graph);
            if !skipped.is_empty() {
                info!(run_id = %state.run_id, ?skipped, "instances unreachable under selected branches");
            }
            let output = state.collect_output();
            state.complete(output.clone(), now);
            info!(run_id = %state.run_id, "run completed");
            TurnOutcome::Completed { output }
        } else {
            state.touch(now);
            let waiting_on: Vec<String> = state.executing.iter().cloned().collect();
            debug!(run_id = %state.run_id, ?waiting_on, "run suspended");
            TurnOutcome::Suspended { waiting_on }
        };

        self.store.save_run_state(&state).await?;
        if state.is_terminal() {
            self.store
                .update_run_status(
                    state.run_id,
                    state.status,
                    state.output.as_ref(),
                    state.error.as_ref(),
                )
                .await?;
            self.release_turn_lock(state.run_id);
        }

        // Steps become visible to workers only once the snapshot that marks
        // them executing is durable.
        if matches!(outcome, TurnOutcome::Suspended { .. }) {
            for message in dispatch {
                let queue = step_queue(&message.workflow, &message.instance_id);
                let payload = envelope::seal(&message).map_err(|e| QueueError::PublishFailed {
                    queue: queue.clone(),
                    message: e.to_string(),
                })?;
                self.queue.enqueue(&queue, payload).await?;
                debug!(queue = %queue, step = %message.step_name, "step dispatched");
            }
        }

        Ok(outcome)
    }

    /// Folds finished deferred steps into the state.
    async fn fold_deferred(
        &self,
        graph: &WorkflowGraph,
        state: &mut RunState,
    ) -> Result<Option<ExecutionError>, EngineError> {
        let in_flight: Vec<String> = state.executing.iter().cloned().collect();
        for instance_id in in_flight {
            let Some(node) = graph.get(&instance_id) else {
                return Ok(Some(ExecutionError::UnknownInstance { instance_id }));
            };
            let iteration = state.iteration_of(&instance_id);
            let name = step_name(&instance_id, iteration);

            let Some(step) = self.store.get_step_state(state.run_id, &name).await? else {
                warn!(run_id = %state.run_id, step = %name, "in-flight step has no state");
                continue;
            };

            let invocation = match step.status {
                StepStatus::Done => Invocation {
                    output: Ok(step.result.unwrap_or(JsonValue::Null)),
                    branch: step.selected_branch,
                },
                StepStatus::Failed => {
                    let error = step
                        .error
                        .unwrap_or_else(|| ErrorPayload::new("step failed"));
                    Invocation {
                        output: Err(InvokeError {
                            message: error.message,
                            code: error.code,
                        }),
                        branch: None,
                    }
                }
                StepStatus::Pending | StepStatus::Running => continue,
            };

            debug!(run_id = %state.run_id, step = %name, status = %step.status, "folding deferred step");
            if let Some(error) = fold(state, &instance_id, node, iteration, invocation) {
                return Ok(Some(error));
            }
        }
        Ok(None)
    }

    /// Executes ready instances until none remain.
    ///
    /// Returns the fatal error that stopped the run, if any.
    async fn execute_ready(
        &self,
        registered: &RegisteredWorkflow,
        state: &mut RunState,
        dispatch: &mut Vec<StepMessage>,
    ) -> Result<Option<ExecutionError>, EngineError> {
        let graph = &registered.workflow.graph;
        let executor = NodeExecutor::new(self.functions.as_ref());

        loop {
            let ready = state.ready_instances(graph);
            if ready.is_empty() {
                return Ok(None);
            }

            let mut batch: Vec<(String, &NodeInstance, JsonValue, u32)> = Vec::new();
            for instance_id in ready {
                let node = match self.check_runnable(graph, state, &instance_id) {
                    Ok(node) => node,
                    Err(error) => return Ok(Some(error)),
                };
                let iteration = state.iteration_of(&instance_id);
                let input = match resolve_inputs(&instance_id, node, state) {
                    Ok(input) => input,
                    Err(error) => return Ok(Some(error)),
                };

                match self.functions.mode_for(node) {
                    ExecutionMode::Deferred => {
                        let name = step_name(&instance_id, iteration);
                        self.store
                            .insert_step_state(state.run_id, &name, &node.node_id, &input)
                            .await?;
                        state.mark_executing(&instance_id);
                        dispatch.push(StepMessage {
                            run_id: state.run_id,
                            workflow: registered.workflow.name.clone(),
                            instance_id,
                            step_name: name,
                            function: node.node_id.clone(),
                            iteration,
                            input,
                        });
                    }
                    ExecutionMode::Inline => {
                        state.take_activation(&instance_id);
                        batch.push((instance_id, node, input, iteration));
                    }
                }
            }

            let invocations = join_all(batch.iter().map(|(instance_id, node, input, iteration)| {
                executor.invoke(instance_id, node, input.clone(), *iteration)
            }))
            .await;

            for ((instance_id, node, _, iteration), invocation) in batch.into_iter().zip(invocations) {
                debug!(run_id = %state.run_id, instance = %instance_id, iteration, "instance executed inline");
                if let Some(error) = fold(state, &instance_id, node, iteration, invocation) {
                    return Ok(Some(error));
                }
            }
        }
    }

    /// Checks the instance exists, its function is registered, and it is
    /// within its iteration bound.
    fn check_runnable<'g>(
        &self,
        graph: &'g WorkflowGraph,
        state: &RunState,
        instance_id: &str,
    ) -> Result<&'g NodeInstance, ExecutionError> {
        let node = graph
            .get(instance_id)
            .ok_or_else(|| ExecutionError::UnknownInstance {
                instance_id: instance_id.to_string(),
            })?;
        if !self.functions.contains(&node.node_id) {
            return Err(ExecutionError::UnknownFunction {
                instance_id: instance_id.to_string(),
                node_id: node.node_id.clone(),
            });
        }

        let iteration = state.iteration_of(instance_id);
        let limit = node
            .max_iterations
            .unwrap_or(self.config.default_max_iterations);
        if iteration > limit {
            return Err(ExecutionError::MaxIterationsExceeded {
                instance_id: instance_id.to_string(),
                iteration,
                limit,
            });
        }
        Ok(node)
    }

    fn turn_lock(&self, run_id: RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .turn_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(run_id).or_default().clone()
    }

    fn release_turn_lock(&self, run_id: RunId) {
        self.turn_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);
    }
}

/// Interprets an invocation and records it, activating successors.
///
/// Returns the fatal error if the run cannot continue past this instance.
fn fold(
    state: &mut RunState,
    instance_id: &str,
    node: &NodeInstance,
    iteration: u32,
    invocation: Invocation,
) -> Option<ExecutionError> {
    let result = match interpret(instance_id, node, iteration, invocation) {
        Ok(result) => result,
        Err(error) => return Some(error),
    };
    match successors(instance_id, node, &result) {
        Ok(targets) => {
            state.record_result(result, &targets);
            None
        }
        Err(error) => {
            state.record_result(result, &[]);
            Some(error)
        }
    }
}
