//! `core_workflow_runs`, `core_workflow_steps`, `core_workflow_events` (§6.3, §4.7).

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_types::{SpineId, StepStatus, StepType, WorkflowEvent, WorkflowRun, WorkflowRunStatus, WorkflowStep};

use crate::error::StorageError;
use crate::pool::Storage;

fn run_status_str(s: WorkflowRunStatus) -> &'static str {
    match s {
        WorkflowRunStatus::Pending => "pending",
        WorkflowRunStatus::Running => "running",
        WorkflowRunStatus::Completed => "completed",
        WorkflowRunStatus::Failed => "failed",
    }
}

fn step_status_str(s: StepStatus) -> &'static str {
    match s {
        StepStatus::Pending => "pending",
        StepStatus::Ready => "ready",
        StepStatus::Running => "running",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

impl Storage {
    pub async fn insert_workflow_run(&self, run: &WorkflowRun) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_workflow_runs (
                id, workflow_name, workflow_version, params, status, total_steps,
                completed_steps, failed_steps, skipped_steps, created_at, started_at, completed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            "#,
        )
        .bind(run.id.as_str())
        .bind(&run.workflow_name)
        .bind(&run.workflow_version)
        .bind(&run.params)
        .bind(run_status_str(run.status))
        .bind(run.total_steps as i64)
        .bind(run.completed_steps as i64)
        .bind(run.failed_steps as i64)
        .bind(run.skipped_steps as i64)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_workflow_run_counters(&self, run: &WorkflowRun) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE core_workflow_runs SET
                status = $2, completed_steps = $3, failed_steps = $4, skipped_steps = $5,
                started_at = COALESCE(started_at, $6), completed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id.as_str())
        .bind(run_status_str(run.status))
        .bind(run.completed_steps as i64)
        .bind(run.failed_steps as i64)
        .bind(run.skipped_steps as i64)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_workflow_run(&self, id: &SpineId) -> Result<WorkflowRun, StorageError> {
        let row = sqlx::query_as::<_, WorkflowRunRow>("SELECT * FROM core_workflow_runs WHERE id = $1")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    pub async fn upsert_workflow_step(&self, step: &WorkflowStep) -> Result<(), StorageError> {
        let step_type = serde_json::to_value(&step.step_type).map_err(|e| StorageError::Permanent(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO core_workflow_steps (
                run_id, step_name, attempt, step_type, depends_on, run_on_failure,
                max_attempts, status, execution_id, started_at, completed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (run_id, step_name, attempt) DO UPDATE SET
                status = EXCLUDED.status, execution_id = EXCLUDED.execution_id,
                started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(step.run_id.as_str())
        .bind(&step.step_name)
        .bind(step.attempt as i64)
        .bind(step_type)
        .bind(&step.depends_on)
        .bind(step.run_on_failure)
        .bind(step.max_attempts as i64)
        .bind(step_status_str(step.status))
        .bind(step.execution_id.as_ref().map(SpineId::as_str))
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_workflow_steps(&self, run_id: &SpineId) -> Result<Vec<WorkflowStep>, StorageError> {
        let rows = sqlx::query_as::<_, WorkflowStepRow>(
            "SELECT * FROM core_workflow_steps WHERE run_id = $1 ORDER BY step_name, attempt",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Insert a workflow event unless its idempotency key was already
    /// recorded (§4.7, §8.6): a retried step handler that re-emits the same
    /// event is a no-op, not a duplicate.
    pub async fn insert_workflow_event(&self, event: &WorkflowEvent) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_workflow_events (run_id, step_name, event_type, idempotency_key, data, timestamp)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(event.run_id.as_str())
        .bind(&event.step_name)
        .bind(&event.event_type)
        .bind(&event.idempotency_key)
        .bind(&event.data)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRunRow {
    id: String,
    workflow_name: String,
    workflow_version: String,
    params: Value,
    status: String,
    total_steps: i64,
    completed_steps: i64,
    failed_steps: i64,
    skipped_steps: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRunRow> for WorkflowRun {
    fn from(row: WorkflowRunRow) -> Self {
        WorkflowRun {
            id: SpineId::new(row.id),
            workflow_name: row.workflow_name,
            workflow_version: row.workflow_version,
            params: row.params,
            status: match row.status.as_str() {
                "running" => WorkflowRunStatus::Running,
                "completed" => WorkflowRunStatus::Completed,
                "failed" => WorkflowRunStatus::Failed,
                _ => WorkflowRunStatus::Pending,
            },
            total_steps: row.total_steps as u32,
            completed_steps: row.completed_steps as u32,
            failed_steps: row.failed_steps as u32,
            skipped_steps: row.skipped_steps as u32,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowStepRow {
    run_id: String,
    step_name: String,
    attempt: i64,
    step_type: Value,
    depends_on: Vec<String>,
    run_on_failure: bool,
    max_attempts: i64,
    status: String,
    execution_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowStepRow> for WorkflowStep {
    type Error = StorageError;

    fn try_from(row: WorkflowStepRow) -> Result<Self, StorageError> {
        Ok(WorkflowStep {
            run_id: SpineId::new(row.run_id),
            step_name: row.step_name,
            attempt: row.attempt as u32,
            step_type: serde_json::from_value::<StepType>(row.step_type)
                .map_err(|e| StorageError::Permanent(e.to_string()))?,
            depends_on: row.depends_on,
            run_on_failure: row.run_on_failure,
            max_attempts: row.max_attempts as u32,
            status: match row.status.as_str() {
                "ready" => StepStatus::Ready,
                "running" => StepStatus::Running,
                "completed" => StepStatus::Completed,
                "failed" => StepStatus::Failed,
                "skipped" => StepStatus::Skipped,
                _ => StepStatus::Pending,
            },
            execution_id: row.execution_id.map(SpineId::new),
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
