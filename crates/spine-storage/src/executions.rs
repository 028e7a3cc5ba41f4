//! `core_executions`, `core_execution_events`, `core_dead_letters` (§6.3).

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_types::{DeadLetter, Execution, ExecutionEvent, ExecutionStatus, Lane, SpineId, TriggerSource};

use crate::error::StorageError;
use crate::pool::Storage;

fn lane_str(lane: Lane) -> &'static str {
    match lane {
        Lane::Normal => "normal",
        Lane::Priority => "priority",
        Lane::Backfill => "backfill",
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
        ExecutionStatus::DeadLettered => "dead_lettered",
    }
}

fn trigger_str(trigger: TriggerSource) -> &'static str {
    match trigger {
        TriggerSource::Manual => "manual",
        TriggerSource::Scheduler => "scheduler",
        TriggerSource::Api => "api",
        TriggerSource::Workflow => "workflow",
        TriggerSource::Retry => "retry",
    }
}

impl Storage {
    /// Insert a brand-new execution (§4.3 `Submit`). Conflicts on
    /// `(pipeline, idempotency_key)` while the prior execution is
    /// non-terminal are the caller's job to check first via
    /// [`Storage::find_active_by_idempotency_key`] — this insert itself is
    /// unconditional so retries that already resolved the conflict don't
    /// race against this call.
    pub async fn insert_execution(&self, execution: &Execution) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_executions (
                id, pipeline, params, lane, trigger_source, status, created_at,
                started_at, completed_at, parent_execution_id, retry_count,
                idempotency_key, result, error, logical_key
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            "#,
        )
        .bind(execution.id.as_str())
        .bind(&execution.pipeline)
        .bind(&execution.params)
        .bind(lane_str(execution.lane))
        .bind(trigger_str(execution.trigger_source))
        .bind(status_str(execution.status))
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.parent_execution_id.as_ref().map(SpineId::as_str))
        .bind(execution.retry_count as i64)
        .bind(&execution.idempotency_key)
        .bind(&execution.result)
        .bind(execution.error.as_ref().map(|e| serde_json::to_value(e).unwrap_or(Value::Null)))
        .bind(&execution.logical_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Find a non-terminal execution by `(pipeline, idempotency_key)` for the
    /// idempotent-submit check in §4.3 step 1. Terminal executions are
    /// excluded: a completed run's idempotency key is free to be reused.
    pub async fn find_active_by_idempotency_key(
        &self,
        pipeline: &str,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, StorageError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, pipeline, params, lane, trigger_source, status, created_at,
                   started_at, completed_at, parent_execution_id, retry_count,
                   idempotency_key, result, error, logical_key
            FROM core_executions
            WHERE pipeline = $1 AND idempotency_key = $2
              AND status NOT IN ('completed','failed','cancelled','dead_lettered')
            "#,
        )
        .bind(pipeline)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_execution(&self, id: &SpineId) -> Result<Execution, StorageError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, pipeline, params, lane, trigger_source, status, created_at,
                   started_at, completed_at, parent_execution_id, retry_count,
                   idempotency_key, result, error, logical_key
            FROM core_executions WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Transition an execution's status and append the matching event in one
    /// transaction (§8.1: status transitions are never observed without
    /// their event). `next_status` of `None` means the event alone is
    /// recorded (used for `progress`/`event` labels that don't change
    /// status).
    pub async fn transition_and_log(
        &self,
        id: &SpineId,
        next_status: Option<ExecutionStatus>,
        event: &ExecutionEvent,
        completed_at: Option<DateTime<Utc>>,
        started_at: Option<DateTime<Utc>>,
        retry_count: Option<u32>,
        result: Option<&Value>,
        error: Option<&spine_types::SpineError>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        if let Some(status) = next_status {
            sqlx::query(
                r#"
                UPDATE core_executions SET
                    status = $2,
                    started_at = COALESCE(started_at, $3),
                    completed_at = COALESCE($4, completed_at),
                    retry_count = COALESCE($5, retry_count),
                    result = COALESCE($6, result),
                    error = COALESCE($7, error)
                WHERE id = $1
                "#,
            )
            .bind(id.as_str())
            .bind(status_str(status))
            .bind(started_at)
            .bind(completed_at)
            .bind(retry_count.map(|r| r as i64))
            .bind(result)
            .bind(error.map(|e| serde_json::to_value(e).unwrap_or(Value::Null)))
            .execute(&mut *tx)
            .await?;
        }

        let event_json = serde_json::to_value(&event.event).map_err(|e| StorageError::Permanent(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO core_execution_events (execution_id, timestamp, event_type, data)
            VALUES ($1,$2,$3,$4)
            "#,
        )
        .bind(id.as_str())
        .bind(event.timestamp)
        .bind(event_json.get("type").and_then(Value::as_str).unwrap_or("event"))
        .bind(&event_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_execution_events(&self, id: &SpineId) -> Result<Vec<ExecutionEvent>, StorageError> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>, Value)>(
            "SELECT execution_id, timestamp, data FROM core_execution_events WHERE execution_id = $1 ORDER BY timestamp, ctid",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(execution_id, timestamp, data)| {
                Ok(ExecutionEvent {
                    execution_id: SpineId::new(execution_id),
                    timestamp,
                    event: serde_json::from_value(data).map_err(|e| StorageError::Permanent(e.to_string()))?,
                })
            })
            .collect()
    }

    pub async fn insert_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_dead_letters (
                id, execution_id, pipeline, params, error, retry_count,
                created_at, resolved_at, resolved_by, time_to_exhaustion_ms
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(dead_letter.id.as_str())
        .bind(dead_letter.execution_id.as_str())
        .bind(&dead_letter.pipeline)
        .bind(&dead_letter.params)
        .bind(serde_json::to_value(&dead_letter.error).map_err(|e| StorageError::Permanent(e.to_string()))?)
        .bind(dead_letter.retry_count as i64)
        .bind(dead_letter.created_at)
        .bind(dead_letter.resolved_at)
        .bind(&dead_letter.resolved_by)
        .bind(dead_letter.time_to_exhaustion.map(|d| d.as_millis() as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve_dead_letter(
        &self,
        id: &SpineId,
        resolved_at: DateTime<Utc>,
        resolved_by: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE core_dead_letters SET resolved_at = $2, resolved_by = $3 WHERE id = $1")
            .bind(id.as_str())
            .bind(resolved_at)
            .bind(resolved_by)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    pipeline: String,
    params: Value,
    lane: String,
    trigger_source: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    parent_execution_id: Option<String>,
    retry_count: i64,
    idempotency_key: Option<String>,
    result: Option<Value>,
    error: Option<Value>,
    logical_key: Option<String>,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Execution {
            id: SpineId::new(row.id),
            pipeline: row.pipeline,
            params: row.params,
            lane: match row.lane.as_str() {
                "priority" => Lane::Priority,
                "backfill" => Lane::Backfill,
                _ => Lane::Normal,
            },
            trigger_source: match row.trigger_source.as_str() {
                "scheduler" => TriggerSource::Scheduler,
                "api" => TriggerSource::Api,
                "workflow" => TriggerSource::Workflow,
                "retry" => TriggerSource::Retry,
                _ => TriggerSource::Manual,
            },
            status: match row.status.as_str() {
                "running" => ExecutionStatus::Running,
                "completed" => ExecutionStatus::Completed,
                "failed" => ExecutionStatus::Failed,
                "cancelled" => ExecutionStatus::Cancelled,
                "dead_lettered" => ExecutionStatus::DeadLettered,
                _ => ExecutionStatus::Pending,
            },
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            parent_execution_id: row.parent_execution_id.map(SpineId::new),
            retry_count: row.retry_count as u32,
            idempotency_key: row.idempotency_key,
            result: row.result,
            error: row.error.and_then(|v| serde_json::from_value(v).ok()),
            logical_key: row.logical_key,
        }
    }
}
