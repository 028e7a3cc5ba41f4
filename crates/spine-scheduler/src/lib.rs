//! Schedule evaluation tick (§4.6): one pass over the due schedules, each
//! guarded by its own [`spine_lock::ScheduleGuard`] so more than one
//! scheduler process can run concurrently without double-firing anything.

mod error;
mod fire;

pub use error::SchedulerError;
pub use fire::{coalesce, compute_next_run_at, due_fire_times, within_grace};

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::Map;
use spine_registry::PipelineRegistry;
use spine_storage::Storage;
use spine_types::{Lane, Schedule, ScheduleRun, ScheduleRunStatus, ScheduleTarget, SpineId, TriggerSource};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn new_id() -> SpineId {
    SpineId::new(Uuid::new_v4().to_string())
}

/// Extra headroom added on top of `misfire_grace_seconds` when sizing the
/// schedule lock's TTL, so a slow evaluation pass doesn't lose the lock to
/// a second scheduler mid-tick.
const LOCK_HEADROOM_SECONDS: i64 = 30;

#[derive(Debug, Default)]
pub struct TickReport {
    pub evaluated: u32,
    pub fired: u32,
    pub missed: u32,
    pub coalesced: u32,
    pub skipped_locked: u32,
}

/// One evaluation pass (§4.6, steps a-f) over every enabled, due schedule.
/// `holder` identifies this scheduler process for lock ownership; callers
/// typically pass [`spine_lock::default_holder`].
#[tracing::instrument(skip(storage, registry), fields(holder))]
pub async fn tick(storage: &Storage, registry: &PipelineRegistry, holder: &str, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
    let mut report = TickReport::default();
    let due = storage.list_due_schedules(now).await?;
    for schedule in due {
        report.evaluated += 1;
        let lock_ttl = StdDuration::from_secs((schedule.misfire_grace_seconds + LOCK_HEADROOM_SECONDS).max(0) as u64);
        let guard = match spine_lock::acquire_schedule_lock(storage, &schedule.name, holder, lock_ttl).await {
            Ok(guard) => guard,
            Err(spine_lock::LockError::Held(_)) => {
                debug!(schedule = %schedule.name, "schedule lock held elsewhere, skipping this tick");
                report.skipped_locked += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        evaluate_schedule(storage, registry, &schedule, now, &mut report).await?;
        guard.release(storage).await?;
    }
    Ok(report)
}

async fn evaluate_schedule(
    storage: &Storage,
    registry: &PipelineRegistry,
    schedule: &Schedule,
    now: DateTime<Utc>,
    report: &mut TickReport,
) -> Result<(), SchedulerError> {
    let fire_times = due_fire_times(schedule, schedule.last_run_at, now)?;
    if fire_times.is_empty() {
        return Ok(());
    }
    let (kept, dropped) = coalesce(fire_times, schedule.max_instances);
    for fire_time in &dropped {
        record_run(storage, &schedule.name, *fire_time, ScheduleRunStatus::Missed, Some("coalesced".to_string())).await?;
        report.coalesced += 1;
    }

    let mut latest_fire_time = schedule.last_run_at.unwrap_or(now);
    for fire_time in kept {
        latest_fire_time = fire_time;
        if !within_grace(fire_time, now, schedule.misfire_grace_seconds) {
            record_run(
                storage,
                &schedule.name,
                fire_time,
                ScheduleRunStatus::Missed,
                Some("outside_grace".to_string()),
            )
            .await?;
            warn!(schedule = %schedule.name, fire_time = %fire_time, "fire-time outside misfire grace window, recorded as missed");
            report.missed += 1;
            continue;
        }
        fire(storage, registry, schedule, fire_time).await?;
        report.fired += 1;
    }

    let next_run_at = compute_next_run_at(schedule, latest_fire_time, now)?;
    let mut updated = schedule.clone();
    updated.last_run_at = Some(latest_fire_time);
    updated.next_run_at = next_run_at;
    if next_run_at.is_none() {
        updated.enabled = false;
    }
    storage.upsert_schedule(&updated).await?;
    Ok(())
}

async fn fire(storage: &Storage, registry: &PipelineRegistry, schedule: &Schedule, scheduled_at: DateTime<Utc>) -> Result<(), SchedulerError> {
    let idempotency_key = format!("schedule:{}:{}", schedule.name, scheduled_at.to_rfc3339());
    match &schedule.target {
        ScheduleTarget::Pipeline { name } => {
            let raw_params: Map<String, serde_json::Value> = schedule.params.as_object().cloned().unwrap_or_default();
            let execution = spine_dispatch::submit(
                storage,
                registry,
                name,
                &raw_params,
                Lane::Normal,
                TriggerSource::Scheduler,
                Some(idempotency_key),
            )
            .await?;
            record_run_with_execution(storage, &schedule.name, scheduled_at, execution.id).await?;
            info!(schedule = %schedule.name, execution_id = %execution.id, "schedule fired pipeline execution");
        }
        ScheduleTarget::Workflow { name } => {
            let run = spine_types::WorkflowRun {
                id: new_id(),
                workflow_name: name.clone(),
                workflow_version: "latest".to_string(),
                params: schedule.params.clone(),
                status: spine_types::WorkflowRunStatus::Pending,
                total_steps: 0,
                completed_steps: 0,
                failed_steps: 0,
                skipped_steps: 0,
                created_at: scheduled_at,
                started_at: None,
                completed_at: None,
            };
            storage.insert_workflow_run(&run).await?;
            record_run(storage, &schedule.name, scheduled_at, ScheduleRunStatus::Pending, None).await?;
            info!(schedule = %schedule.name, workflow_run_id = %run.id, "schedule fired workflow run");
        }
    }
    Ok(())
}

async fn record_run(
    storage: &Storage,
    schedule_name: &str,
    scheduled_at: DateTime<Utc>,
    status: ScheduleRunStatus,
    skip_reason: Option<String>,
) -> Result<(), SchedulerError> {
    storage
        .record_schedule_run(&ScheduleRun {
            id: new_id(),
            schedule_name: schedule_name.to_string(),
            scheduled_at,
            started_at: None,
            completed_at: None,
            status,
            run_id: None,
            execution_id: None,
            skip_reason,
        })
        .await?;
    Ok(())
}

async fn record_run_with_execution(
    storage: &Storage,
    schedule_name: &str,
    scheduled_at: DateTime<Utc>,
    execution_id: SpineId,
) -> Result<(), SchedulerError> {
    storage
        .record_schedule_run(&ScheduleRun {
            id: new_id(),
            schedule_name: schedule_name.to_string(),
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: ScheduleRunStatus::Pending,
            run_id: None,
            execution_id: Some(execution_id),
            skip_reason: None,
        })
        .await?;
    Ok(())
}
