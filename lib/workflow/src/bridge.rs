//! Deferred execution bridge.
//!
//! Deferred instances run on step workers instead of inside an orchestrator
//! turn. The runner records the step and enqueues a [`StepMessage`] on the
//! instance's step queue; the [`StepWorker`] executes it idempotently and
//! enqueues a [`ContinueMessage`] on the workflow's orchestrator queue; the
//! [`OrchestratorWorker`] resumes the run with `continue_graph`.
//!
//! Queue names:
//! - `{workflow}.step.{instance_id}` for step work
//! - `{workflow}.orchestrator` for continuations

use crate::envelope::{self, Envelope};
use crate::error::ErrorPayload;
use crate::graph::ExecutionMode;
use crate::queue::{HandlerError, Queue, QueueError, QueueHandler};
use crate::registry::{GraphContext, Invoker};
use crate::runner::{GraphRunner, TurnOutcome};
use crate::store::{StepStateStore, StepStatus};
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use stepweave_core::RunId;
use tracing::{debug, info, warn};

/// Queue carrying step work for one instance of a workflow.
#[must_use]
pub fn step_queue(workflow: &str, instance_id: &str) -> String {
    format!("{workflow}.step.{instance_id}")
}

/// Queue carrying continuations for a workflow's runs.
#[must_use]
pub fn orchestrator_queue(workflow: &str) -> String {
    format!("{workflow}.orchestrator")
}

/// Work for a step worker: one execution of a deferred instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMessage {
    pub run_id: RunId,
    pub workflow: String,
    pub instance_id: String,
    pub step_name: String,
    pub function: String,
    pub iteration: u32,
    pub input: JsonValue,
}

/// Request to resume a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueMessage {
    pub run_id: RunId,
}

/// How many times a deferred step is attempted, and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// How long a `running` step may go untouched before another worker
    /// may claim it.
    pub claim_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(300),
        }
    }
}

/// What a step worker did with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDisposition {
    /// The step ran and succeeded.
    Completed,
    /// The step failed for the last time; the runner has been notified.
    FailedFinal,
    /// The step already had a final outcome; its continuation was re-sent.
    AlreadyFinished,
    /// The run is no longer running; the work was dropped.
    Discarded,
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, HandlerError> {
    let envelope: Envelope<T> = Envelope::from_json_bytes(payload)
        .map_err(|e| HandlerError::new(format!("undecodable message: {e}")))?;
    if !envelope.is_current_version() {
        return Err(HandlerError::new(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }
    Ok(envelope.into_payload())
}

async fn enqueue_continuation<Q: Queue>(
    queue: &Q,
    workflow: &str,
    run_id: RunId,
) -> Result<(), QueueError> {
    let name = orchestrator_queue(workflow);
    let payload =
        envelope::seal(ContinueMessage { run_id }).map_err(|e| QueueError::PublishFailed {
            queue: name.clone(),
            message: e.to_string(),
        })?;
    queue.enqueue(&name, payload).await
}

/// Executes deferred steps delivered on a step queue.
pub struct StepWorker<S, Q> {
    runner: Arc<GraphRunner<S, Q>>,
    retry: RetryPolicy,
}

impl<S: StepStateStore, Q: Queue> StepWorker<S, Q> {
    #[must_use]
    pub fn new(runner: Arc<GraphRunner<S, Q>>, retry: RetryPolicy) -> Self {
        Self { runner, retry }
    }

    /// Processes one step message.
    ///
    /// # Errors
    ///
    /// Returns a retryable error while attempts remain, while another worker
    /// holds the step, or when the store or queue fails.
    pub async fn process(&self, message: &StepMessage) -> Result<StepDisposition, HandlerError> {
        let store = self.runner.store();
        let infra = |e: &dyn std::fmt::Display| HandlerError::new(e.to_string()).retry_after(self.retry.backoff);

        let Some(step) = store
            .get_step_state(message.run_id, &message.step_name)
            .await
            .map_err(|e| infra(&e))?
        else {
            warn!(run_id = %message.run_id, step = %message.step_name, "step has no state, dropping");
            return Ok(StepDisposition::Discarded);
        };

        if step.status.is_finished() {
            // The continuation for this outcome may never have been published.
            enqueue_continuation(self.runner.queue().as_ref(), &message.workflow, message.run_id)
                .await
                .map_err(|e| infra(&e))?;
            debug!(run_id = %message.run_id, step = %message.step_name, status = %step.status, "step already finished, continuation re-sent");
            return Ok(StepDisposition::AlreadyFinished);
        }

        let running = store
            .get_run(message.run_id)
            .await
            .map_err(|e| infra(&e))?
            .is_some_and(|run| !run.status.is_terminal());
        if !running {
            debug!(run_id = %message.run_id, step = %message.step_name, "run is not running, discarding step");
            return Ok(StepDisposition::Discarded);
        }

        let Some(attempt) = store
            .claim_step(step.step_id, self.retry.claim_timeout)
            .await
            .map_err(|e| infra(&e))?
        else {
            debug!(run_id = %message.run_id, step = %message.step_name, "step claimed by another worker");
            return Err(HandlerError::new(format!(
                "step '{}' is already executing",
                message.step_name
            ))
            .retry_after(self.retry.backoff));
        };

        let ctx = GraphContext::new(&message.instance_id, message.iteration);
        let outcome = self
            .runner
            .functions()
            .invoke(&message.function, message.input.clone(), ctx.clone())
            .await;

        match outcome {
            Ok(output) => {
                store
                    .set_step_result(
                        message.run_id,
                        &message.step_name,
                        &output,
                        ctx.selected_branch().as_deref(),
                    )
                    .await
                    .map_err(|e| infra(&e))?;
                enqueue_continuation(self.runner.queue().as_ref(), &message.workflow, message.run_id)
                    .await
                    .map_err(|e| infra(&e))?;
                debug!(run_id = %message.run_id, step = %message.step_name, attempt, "step completed");
                Ok(StepDisposition::Completed)
            }
            Err(e) => {
                let mut error = ErrorPayload::new(e.message);
                error.code = e.code;

                if attempt < self.retry.max_attempts {
                    store
                        .set_step_retrying(message.run_id, &message.step_name, &error)
                        .await
                        .map_err(|e| infra(&e))?;
                    warn!(run_id = %message.run_id, step = %message.step_name, attempt, error = %error, "step failed, will retry");
                    return Err(HandlerError::new(error.message).retry_after(self.retry.backoff));
                }

                store
                    .set_step_error(message.run_id, &message.step_name, &error)
                    .await
                    .map_err(|e| infra(&e))?;
                enqueue_continuation(self.runner.queue().as_ref(), &message.workflow, message.run_id)
                    .await
                    .map_err(|e| infra(&e))?;
                warn!(run_id = %message.run_id, step = %message.step_name, attempt, error = %error, "step failed, attempts exhausted");
                Ok(StepDisposition::FailedFinal)
            }
        }
    }
}

#[async_trait]
impl<S: StepStateStore + 'static, Q: Queue + 'static> QueueHandler for StepWorker<S, Q> {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let message: StepMessage = decode(payload)?;
        self.process(&message).await.map(|_| ())
    }
}

/// Resumes runs delivered on an orchestrator queue.
pub struct OrchestratorWorker<S, Q> {
    runner: Arc<GraphRunner<S, Q>>,
}

impl<S: StepStateStore, Q: Queue> OrchestratorWorker<S, Q> {
    #[must_use]
    pub fn new(runner: Arc<GraphRunner<S, Q>>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<S: StepStateStore + 'static, Q: Queue + 'static> QueueHandler for OrchestratorWorker<S, Q> {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let message: ContinueMessage = decode(payload)?;
        match self.runner.continue_graph(message.run_id).await {
            Ok(TurnOutcome::Suspended { waiting_on }) => {
                debug!(run_id = %message.run_id, ?waiting_on, "run suspended");
                Ok(())
            }
            Ok(outcome) => {
                debug!(run_id = %message.run_id, ?outcome, "continuation handled");
                Ok(())
            }
            Err(report) => {
                warn!(run_id = %message.run_id, error = %report, "continuation failed");
                Err(HandlerError::new(report.to_string()))
            }
        }
    }
}

/// Registers an orchestrator worker for every workflow and a step worker for
/// every deferred instance.
///
/// # Errors
///
/// Returns an error if the queue rejects a registration.
pub async fn register_workers<S, Q>(
    runner: Arc<GraphRunner<S, Q>>,
    retry: RetryPolicy,
) -> Result<usize, Report<QueueError>>
where
    S: StepStateStore + 'static,
    Q: Queue + 'static,
{
    let mut registered = 0;
    let queue = Arc::clone(runner.queue());

    for name in runner.workflows().names() {
        let Some(workflow) = runner.workflows().get(name) else {
            continue;
        };

        queue
            .register_worker(
                &orchestrator_queue(name),
                Arc::new(OrchestratorWorker::new(Arc::clone(&runner))),
            )
            .await?;
        registered += 1;

        for (instance_id, node) in workflow.workflow.graph.iter() {
            if runner.functions().mode_for(node) != ExecutionMode::Deferred {
                continue;
            }
            queue
                .register_worker(
                    &step_queue(name, instance_id),
                    Arc::new(StepWorker::new(Arc::clone(&runner), retry)),
                )
                .await?;
            registered += 1;
        }
    }

    info!(workers = registered, "registered queue workers");
    Ok(registered)
}
