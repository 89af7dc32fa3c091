//! PostgreSQL step state store.
//!
//! Runs live in `runs`, with the runner's snapshot in the `state` column.
//! Steps live in `steps`, unique on `(run_id, step_name)`. Every step write
//! is a single conditional `UPDATE`, so a `done` row is never overwritten
//! and only one of two racing workers wins a claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;
use stepweave_core::{RunId, StepId};
use stepweave_workflow::{
    ErrorPayload, RunRecord, RunState, RunStatus, StepState, StepStateStore, StepStatus,
    StoreError,
};

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: e.to_string(),
    }
}

fn serialization(message: impl Into<String>) -> StoreError {
    StoreError::Serialization {
        message: message.into(),
    }
}

fn error_to_json(error: Option<&ErrorPayload>) -> Result<Option<JsonValue>, StoreError> {
    error
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| serialization(e.to_string()))
}

fn error_from_json(value: Option<JsonValue>) -> Result<Option<ErrorPayload>, StoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| serialization(e.to_string()))
}

/// Row type for run queries.
#[derive(FromRow)]
struct RunRow {
    run_id: String,
    workflow: String,
    input: JsonValue,
    status: String,
    output: Option<JsonValue>,
    error: Option<JsonValue>,
    is_graph_source: bool,
    graph_hash: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    fn try_into_record(self) -> Result<RunRecord, StoreError> {
        let run_id = RunId::from_str(&self.run_id)
            .map_err(|e| serialization(format!("invalid run id '{}': {e}", self.run_id)))?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| serialization(format!("invalid run status '{}'", self.status)))?;

        Ok(RunRecord {
            run_id,
            workflow: self.workflow,
            input: self.input,
            status,
            output: self.output,
            error: error_from_json(self.error)?,
            is_graph_source: self.is_graph_source,
            graph_hash: self.graph_hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for step queries.
#[derive(FromRow)]
struct StepRow {
    step_id: String,
    run_id: String,
    step_name: String,
    rpc_name: String,
    input: JsonValue,
    status: String,
    result: Option<JsonValue>,
    selected_branch: Option<String>,
    error: Option<JsonValue>,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StepRow {
    fn try_into_state(self) -> Result<StepState, StoreError> {
        let step_id = StepId::from_str(&self.step_id)
            .map_err(|e| serialization(format!("invalid step id '{}': {e}", self.step_id)))?;
        let run_id = RunId::from_str(&self.run_id)
            .map_err(|e| serialization(format!("invalid run id '{}': {e}", self.run_id)))?;
        let status = StepStatus::parse(&self.status)
            .ok_or_else(|| serialization(format!("invalid step status '{}'", self.status)))?;

        Ok(StepState {
            step_id,
            run_id,
            step_name: self.step_name,
            rpc_name: self.rpc_name,
            input: self.input,
            status,
            result: self.result,
            selected_branch: self.selected_branch,
            error: error_from_json(self.error)?,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Step state store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStepStore {
    pool: PgPool,
}

impl PgStepStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_step(&self, run_id: RunId, step_name: &str, affected: u64) -> Result<(), StoreError> {
        if affected > 0 {
            return Ok(());
        }
        // Nothing changed: either the step is missing or it is already final.
        match self.get_step_state(run_id, step_name).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::StepNotFound {
                run_id,
                step_name: step_name.to_string(),
            }),
        }
    }
}

#[async_trait]
impl StepStateStore for PgStepStore {
    async fn create_run(
        &self,
        workflow: &str,
        input: &JsonValue,
        is_graph_source: bool,
        graph_hash: Option<&str>,
    ) -> Result<RunId, StoreError> {
        let run_id = RunId::new();
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, workflow, input, status, is_graph_source, graph_hash)
            VALUES ($1, $2, $3, 'running', $4, $5)
            "#,
        )
        .bind(run_id.to_string())
        .bind(workflow)
        .bind(input)
        .bind(is_graph_source)
        .bind(graph_hash)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(run_id)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT run_id, workflow, input, status, output, error, is_graph_source,
                   graph_hash, created_at, updated_at
            FROM runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(RunRow::try_into_record).transpose()
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<&JsonValue>,
        error: Option<&ErrorPayload>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, output = $3, error = $4, updated_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(output)
        .bind(error_to_json(error)?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound { run_id });
        }
        Ok(())
    }

    async fn insert_step_state(
        &self,
        run_id: RunId,
        step_name: &str,
        rpc_name: &str,
        input: &JsonValue,
    ) -> Result<StepId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO steps (step_id, run_id, step_name, rpc_name, input, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (run_id, step_name) DO NOTHING
            "#,
        )
        .bind(StepId::new().to_string())
        .bind(run_id.to_string())
        .bind(step_name)
        .bind(rpc_name)
        .bind(input)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let (step_id,): (String,) =
            sqlx::query_as("SELECT step_id FROM steps WHERE run_id = $1 AND step_name = $2")
                .bind(run_id.to_string())
                .bind(step_name)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;

        StepId::from_str(&step_id)
            .map_err(|e| serialization(format!("invalid step id '{step_id}': {e}")))
    }

    async fn claim_step(
        &self,
        step_id: StepId,
        stale_after: Duration,
    ) -> Result<Option<u32>, StoreError> {
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE steps
            SET status = 'running', attempt_count = attempt_count + 1, updated_at = NOW()
            WHERE step_id = $1
              AND (status = 'pending'
                   OR (status = 'running'
                       AND updated_at <= NOW() - $2::FLOAT8 * INTERVAL '1 millisecond'))
            RETURNING attempt_count
            "#,
        )
        .bind(step_id.to_string())
        .bind(stale_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        claimed
            .map(|(attempts,)| {
                u32::try_from(attempts)
                    .map_err(|_| serialization(format!("negative attempt count {attempts}")))
            })
            .transpose()
    }

    async fn set_step_result(
        &self,
        run_id: RunId,
        step_name: &str,
        result: &JsonValue,
        selected_branch: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'done', result = $3, selected_branch = $4, error = NULL,
                updated_at = NOW()
            WHERE run_id = $1 AND step_name = $2 AND status <> 'done'
            "#,
        )
        .bind(run_id.to_string())
        .bind(step_name)
        .bind(result)
        .bind(selected_branch)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.ensure_step(run_id, step_name, updated.rows_affected())
            .await
    }

    async fn set_step_error(
        &self,
        run_id: RunId,
        step_name: &str,
        error: &ErrorPayload,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'failed', error = $3, updated_at = NOW()
            WHERE run_id = $1 AND step_name = $2 AND status <> 'done'
            "#,
        )
        .bind(run_id.to_string())
        .bind(step_name)
        .bind(error_to_json(Some(error))?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.ensure_step(run_id, step_name, updated.rows_affected())
            .await
    }

    async fn set_step_retrying(
        &self,
        run_id: RunId,
        step_name: &str,
        error: &ErrorPayload,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'pending', error = $3, updated_at = NOW()
            WHERE run_id = $1 AND step_name = $2 AND status NOT IN ('done', 'failed')
            "#,
        )
        .bind(run_id.to_string())
        .bind(step_name)
        .bind(error_to_json(Some(error))?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.ensure_step(run_id, step_name, updated.rows_affected())
            .await
    }

    async fn get_step_state(
        &self,
        run_id: RunId,
        step_name: &str,
    ) -> Result<Option<StepState>, StoreError> {
        let row: Option<StepRow> = sqlx::query_as(
            r#"
            SELECT step_id, run_id, step_name, rpc_name, input, status, result,
                   selected_branch, error, attempt_count, created_at, updated_at
            FROM steps
            WHERE run_id = $1 AND step_name = $2
            "#,
        )
        .bind(run_id.to_string())
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(StepRow::try_into_state).transpose()
    }

    async fn save_run_state(&self, state: &RunState) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(state).map_err(|e| serialization(e.to_string()))?;
        let result = sqlx::query("UPDATE runs SET state = $2, updated_at = NOW() WHERE run_id = $1")
            .bind(state.run_id.to_string())
            .bind(snapshot)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound {
                run_id: state.run_id,
            });
        }
        Ok(())
    }

    async fn load_run_state(&self, run_id: RunId) -> Result<Option<RunState>, StoreError> {
        let row: Option<(Option<JsonValue>,)> =
            sqlx::query_as("SELECT state FROM runs WHERE run_id = $1")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        match row {
            Some((Some(snapshot),)) => serde_json::from_value(snapshot)
                .map(Some)
                .map_err(|e| serialization(e.to_string())),
            _ => Ok(None),
        }
    }
}
