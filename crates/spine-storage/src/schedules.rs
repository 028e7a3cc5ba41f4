//! `core_schedules`, `core_schedule_runs` (§6.3, §4.6).

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_types::{Schedule, ScheduleRun, ScheduleRunStatus, ScheduleType, SpineId};

use crate::error::StorageError;
use crate::pool::Storage;

fn type_str(t: ScheduleType) -> &'static str {
    match t {
        ScheduleType::Cron => "cron",
        ScheduleType::Interval => "interval",
        ScheduleType::At => "at",
    }
}

fn run_status_str(s: ScheduleRunStatus) -> &'static str {
    match s {
        ScheduleRunStatus::Pending => "pending",
        ScheduleRunStatus::Running => "running",
        ScheduleRunStatus::Completed => "completed",
        ScheduleRunStatus::Failed => "failed",
        ScheduleRunStatus::Skipped => "skipped",
        ScheduleRunStatus::Missed => "missed",
    }
}

impl Storage {
    pub async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let (target_type, target_name) = match &schedule.target {
            spine_types::ScheduleTarget::Pipeline { name } => ("pipeline", name.as_str()),
            spine_types::ScheduleTarget::Workflow { name } => ("workflow", name.as_str()),
        };
        sqlx::query(
            r#"
            INSERT INTO core_schedules (
                name, target_type, target_name, params, schedule_type, expression,
                timezone, enabled, max_instances, misfire_grace_seconds,
                next_run_at, last_run_at, last_run_status, version
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (name) DO UPDATE SET
                target_type = EXCLUDED.target_type, target_name = EXCLUDED.target_name,
                params = EXCLUDED.params, schedule_type = EXCLUDED.schedule_type,
                expression = EXCLUDED.expression, timezone = EXCLUDED.timezone,
                enabled = EXCLUDED.enabled, max_instances = EXCLUDED.max_instances,
                misfire_grace_seconds = EXCLUDED.misfire_grace_seconds,
                next_run_at = EXCLUDED.next_run_at, last_run_at = EXCLUDED.last_run_at,
                last_run_status = EXCLUDED.last_run_status,
                version = core_schedules.version + 1
            "#,
        )
        .bind(&schedule.name)
        .bind(target_type)
        .bind(target_name)
        .bind(&schedule.params)
        .bind(type_str(schedule.schedule_type))
        .bind(&schedule.expression)
        .bind(&schedule.timezone)
        .bind(schedule.enabled)
        .bind(schedule.max_instances as i64)
        .bind(schedule.misfire_grace_seconds)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.last_run_status.map(run_status_str))
        .bind(schedule.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, StorageError> {
        let row = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM core_schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, StorageError> {
        let rows = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM core_schedules ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_schedule_enabled(&self, name: &str, enabled: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE core_schedules SET enabled = $2 WHERE name = $1")
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Due schedules are `enabled` with `next_run_at <= now`; callers
    /// evaluate misfire grace (§4.6c) against `next_run_at` themselves since
    /// it needs `now` at the instant of decision, not of query.
    pub async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StorageError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            "SELECT * FROM core_schedules WHERE enabled AND next_run_at <= $1 ORDER BY next_run_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn record_schedule_run(&self, run: &ScheduleRun) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_schedule_runs (
                id, schedule_name, scheduled_at, started_at, completed_at,
                status, run_id, execution_id, skip_reason
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (id) DO UPDATE SET
                started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at,
                status = EXCLUDED.status, run_id = EXCLUDED.run_id,
                execution_id = EXCLUDED.execution_id, skip_reason = EXCLUDED.skip_reason
            "#,
        )
        .bind(run.id.as_str())
        .bind(&run.schedule_name)
        .bind(run.scheduled_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run_status_str(run.status))
        .bind(run.run_id.as_ref().map(SpineId::as_str))
        .bind(run.execution_id.as_ref().map(SpineId::as_str))
        .bind(&run.skip_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    name: String,
    target_type: String,
    target_name: String,
    params: Value,
    schedule_type: String,
    expression: String,
    timezone: String,
    enabled: bool,
    max_instances: i64,
    misfire_grace_seconds: i64,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_run_status: Option<String>,
    version: i64,
}

impl From<ScheduleRow> for Schedule {
    fn from(row: ScheduleRow) -> Self {
        let target = if row.target_type == "workflow" {
            spine_types::ScheduleTarget::Workflow { name: row.target_name }
        } else {
            spine_types::ScheduleTarget::Pipeline { name: row.target_name }
        };
        Schedule {
            name: row.name,
            target,
            params: row.params,
            schedule_type: match row.schedule_type.as_str() {
                "interval" => ScheduleType::Interval,
                "at" => ScheduleType::At,
                _ => ScheduleType::Cron,
            },
            expression: row.expression,
            timezone: row.timezone,
            enabled: row.enabled,
            max_instances: row.max_instances as u32,
            misfire_grace_seconds: row.misfire_grace_seconds,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            last_run_status: row.last_run_status.map(|s| match s.as_str() {
                "running" => ScheduleRunStatus::Running,
                "completed" => ScheduleRunStatus::Completed,
                "failed" => ScheduleRunStatus::Failed,
                "skipped" => ScheduleRunStatus::Skipped,
                "missed" => ScheduleRunStatus::Missed,
                _ => ScheduleRunStatus::Pending,
            }),
            version: row.version as u64,
        }
    }
}
