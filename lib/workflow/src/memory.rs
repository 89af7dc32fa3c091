//! In-memory step state store for tests and single-process use.

use crate::error::ErrorPayload;
use crate::run_state::{RunState, RunStatus};
use crate::store::{RunRecord, StepState, StepStateStore, StepStatus, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stepweave_core::{RunId, StepId};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, RunRecord>,
    steps: HashMap<StepId, StepState>,
    step_index: HashMap<(RunId, String), StepId>,
    snapshots: HashMap<RunId, RunState>,
}

impl Inner {
    fn step_mut(&mut self, run_id: RunId, step_name: &str) -> Result<&mut StepState, StoreError> {
        let step_id = self
            .step_index
            .get(&(run_id, step_name.to_string()))
            .copied()
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_name: step_name.to_string(),
            })?;
        self.steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_name: step_name.to_string(),
            })
    }
}

/// Step state store backed by process memory.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStepStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStepStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs created.
    pub async fn run_count(&self) -> usize {
        self.inner.lock().await.runs.len()
    }

    /// IDs of every run created, oldest first.
    pub async fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.inner.lock().await.runs.keys().copied().collect();
        ids.sort();
        ids
    }

    /// All steps of a run, ordered by step name.
    pub async fn steps_for(&self, run_id: RunId) -> Vec<StepState> {
        let inner = self.inner.lock().await;
        let mut steps: Vec<StepState> = inner
            .steps
            .values()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.step_name.cmp(&b.step_name));
        steps
    }
}

#[async_trait]
impl StepStateStore for InMemoryStepStore {
    async fn create_run(
        &self,
        workflow: &str,
        input: &JsonValue,
        is_graph_source: bool,
        graph_hash: Option<&str>,
    ) -> Result<RunId, StoreError> {
        let run_id = RunId::new();
        let now = Utc::now();
        let record = RunRecord {
            run_id,
            workflow: workflow.to_string(),
            input: input.clone(),
            status: RunStatus::Running,
            output: None,
            error: None,
            is_graph_source,
            graph_hash: graph_hash.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().await.runs.insert(run_id, record);
        Ok(run_id)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.inner.lock().await.runs.get(&run_id).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<&JsonValue>,
        error: Option<&ErrorPayload>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound { run_id })?;
        record.status = status;
        record.output = output.cloned();
        record.error = error.cloned();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_step_state(
        &self,
        run_id: RunId,
        step_name: &str,
        rpc_name: &str,
        input: &JsonValue,
    ) -> Result<StepId, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (run_id, step_name.to_string());
        if let Some(existing) = inner.step_index.get(&key) {
            return Ok(*existing);
        }

        let step_id = StepId::new();
        let now = Utc::now();
        inner.steps.insert(
            step_id,
            StepState {
                step_id,
                run_id,
                step_name: step_name.to_string(),
                rpc_name: rpc_name.to_string(),
                input: input.clone(),
                status: StepStatus::Pending,
                result: None,
                selected_branch: None,
                error: None,
                attempt_count: 0,
                created_at: now,
                updated_at: now,
            },
        );
        inner.step_index.insert(key, step_id);
        Ok(step_id)
    }

    async fn claim_step(
        &self,
        step_id: StepId,
        stale_after: Duration,
    ) -> Result<Option<u32>, StoreError> {
        let mut inner = self.inner.lock().await;
        let step = inner
            .steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreError::Backend {
                message: format!("unknown step {step_id}"),
            })?;
        let now = Utc::now();
        let claimable = match step.status {
            StepStatus::Pending => true,
            StepStatus::Running => (now - step.updated_at)
                .to_std()
                .is_ok_and(|idle| idle >= stale_after),
            StepStatus::Done | StepStatus::Failed => false,
        };
        if !claimable {
            return Ok(None);
        }
        step.status = StepStatus::Running;
        step.attempt_count += 1;
        step.updated_at = now;
        Ok(Some(step.attempt_count))
    }

    async fn set_step_result(
        &self,
        run_id: RunId,
        step_name: &str,
        result: &JsonValue,
        selected_branch: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let step = inner.step_mut(run_id, step_name)?;
        if step.status == StepStatus::Done {
            return Ok(());
        }
        step.status = StepStatus::Done;
        step.result = Some(result.clone());
        step.selected_branch = selected_branch.map(str::to_string);
        step.error = None;
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn set_step_error(
        &self,
        run_id: RunId,
        step_name: &str,
        error: &ErrorPayload,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let step = inner.step_mut(run_id, step_name)?;
        if step.status == StepStatus::Done {
            return Ok(());
        }
        step.status = StepStatus::Failed;
        step.error = Some(error.clone());
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn set_step_retrying(
        &self,
        run_id: RunId,
        step_name: &str,
        error: &ErrorPayload,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let step = inner.step_mut(run_id, step_name)?;
        if step.status.is_finished() {
            return Ok(());
        }
        step.status = StepStatus::Pending;
        step.error = Some(error.clone());
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn get_step_state(
        &self,
        run_id: RunId,
        step_name: &str,
    ) -> Result<Option<StepState>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .step_index
            .get(&(run_id, step_name.to_string()))
            .and_then(|id| inner.steps.get(id))
            .cloned())
    }

    async fn save_run_state(&self, state: &RunState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(&state.run_id) {
            return Err(StoreError::RunNotFound {
                run_id: state.run_id,
            });
        }
        inner.snapshots.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load_run_state(&self, run_id: RunId) -> Result<Option<RunState>, StoreError> {
        Ok(self.inner.lock().await.snapshots.get(&run_id).cloned())
    }
}
