//! Watermark tracking and resumable backfill planning (§4.9). Watermark
//! advance is monotone by construction in `spine-storage`; this crate adds
//! the one operation storage deliberately keeps out of that path —
//! [`rewind`], which always pairs the decrease with a logged anomaly — plus
//! the backfill planner that expands a range into partition keys and drains
//! them through [`spine_workqueue`].

mod error;

pub use error::WatermarkError;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_storage::Storage;
use spine_types::{Anomaly, AlertSeverity, BackfillPlan, BackfillStatus, SpineId};
use tracing::{info, warn};
use uuid::Uuid;

fn new_id() -> SpineId {
    SpineId::new(Uuid::new_v4().to_string())
}

/// Force `high_water` down and log why (§4.9, §8.7). The only sanctioned way
/// to decrease a watermark; everything else goes through the monotone
/// `advance_watermark` upsert in `spine-storage`.
#[tracing::instrument(skip(storage))]
pub async fn rewind(
    storage: &Storage,
    domain: &str,
    source: &str,
    partition_key: &str,
    new_high_water: DateTime<Utc>,
    reason: &str,
) -> Result<(), WatermarkError> {
    let now = Utc::now();
    storage.rewind_watermark(domain, source, partition_key, new_high_water, now).await?;
    storage
        .insert_anomaly(&Anomaly {
            id: new_id(),
            domain: domain.to_string(),
            partition_key: Some(partition_key.to_string()),
            severity: AlertSeverity::Warn,
            category: "watermark_rewind".to_string(),
            sample_affected_records: serde_json::json!({ "reason": reason, "new_high_water": new_high_water }),
            created_at: now,
            resolved_at: None,
        })
        .await?;
    warn!(domain, source, partition_key, new_high_water = %new_high_water, reason, "watermark rewound");
    Ok(())
}

/// Expand `(domain, source)` over `all_partition_keys` (already produced by
/// the caller's domain-specific partition template, e.g. weekly dates) into
/// a resumable plan, subtracting partitions already present for
/// `terminal_stage` (§4.9 backfill planning, steps 1-3).
#[tracing::instrument(skip(storage, all_partition_keys))]
pub async fn plan(
    storage: &Storage,
    domain: &str,
    source: &str,
    terminal_stage: &str,
    mut all_partition_keys: Vec<String>,
) -> Result<BackfillPlan, WatermarkError> {
    all_partition_keys.sort();
    all_partition_keys.dedup();
    let already_present: BTreeSet<String> = storage
        .list_manifest_partition_keys(domain, terminal_stage)
        .await?
        .into_iter()
        .collect();
    let checkpoint = all_partition_keys
        .iter()
        .find(|k| !already_present.contains(*k))
        .cloned();
    let completed_keys: BTreeSet<String> = all_partition_keys
        .iter()
        .filter(|k| already_present.contains(*k))
        .cloned()
        .collect();
    let plan = BackfillPlan {
        plan_id: Uuid::new_v4().to_string(),
        domain: domain.to_string(),
        source: source.to_string(),
        partition_keys: all_partition_keys,
        completed_keys,
        failed_keys: Default::default(),
        status: BackfillStatus::Planned,
        checkpoint,
    };
    storage.upsert_backfill_plan(&plan).await?;
    info!(plan_id = %plan.plan_id, remaining = plan.remaining_keys().len(), "backfill plan created");
    Ok(plan)
}

/// Drain a `planned|running` plan by enqueueing a work item per remaining
/// partition key, bounded by `concurrency` (§4.9.4). Resuming re-invokes
/// this on the same plan: `completed_keys` are skipped and `checkpoint`
/// reflects wherever the previous run left off (§4.9.5, §8 scenario S6).
/// This call only enqueues; [`record_outcome`] is what actually advances
/// `completed_keys`/`failed_keys`/`checkpoint` once a partition's work item
/// resolves.
#[tracing::instrument(skip(storage, pipeline, params))]
pub async fn execute(
    storage: &Storage,
    plan_id: &str,
    pipeline: &str,
    params: &Value,
    desired_at: DateTime<Utc>,
    priority: i32,
    max_attempts: u32,
    concurrency: usize,
) -> Result<usize, WatermarkError> {
    let mut plan = storage.get_backfill_plan(plan_id).await?;
    if !matches!(plan.status, BackfillStatus::Planned | BackfillStatus::Running) {
        return Ok(0);
    }
    plan.status = BackfillStatus::Running;
    storage.upsert_backfill_plan(&plan).await?;

    let remaining: Vec<String> = plan.remaining_keys().into_iter().map(String::to_owned).collect();
    let domain = plan.domain.clone();
    let pipeline = pipeline.to_string();
    let params = params.clone();
    let results = spine_chunking::run_bounded(remaining, concurrency, |partition_key| {
        let domain = domain.clone();
        let pipeline = pipeline.clone();
        let params = params.clone();
        async move {
            spine_workqueue::enqueue(storage, &domain, &pipeline, &partition_key, params, desired_at, priority, max_attempts, true)
                .await
                .map(|_| ())
        }
    })
    .await;
    let enqueued = results.iter().filter(|r| r.is_ok()).count();
    if let Some(err) = results.iter().find_map(|r| r.as_ref().err()) {
        warn!(plan_id, error = %err, "one or more partitions failed to enqueue during backfill drain");
    }
    info!(plan_id, enqueued, "backfill drain enqueued partitions");
    Ok(enqueued)
}

/// Record that `partition_key`'s work item resolved, advancing
/// `completed_keys`/`failed_keys` and `checkpoint` (§4.9.4). A partition
/// already in `failed_keys` is only moved by an explicit retry, never by
/// re-running `execute` (§8 scenario S6).
#[tracing::instrument(skip(storage))]
pub async fn record_outcome(storage: &Storage, plan_id: &str, partition_key: &str, success: bool, error: Option<String>) -> Result<BackfillPlan, WatermarkError> {
    let mut plan = storage.get_backfill_plan(plan_id).await?;
    if success {
        plan.completed_keys.insert(partition_key.to_string());
        plan.failed_keys.remove(partition_key);
    } else {
        plan.failed_keys.insert(partition_key.to_string(), error.unwrap_or_default());
    }
    plan.checkpoint = plan
        .partition_keys
        .iter()
        .find(|k| !plan.completed_keys.contains(*k) && !plan.failed_keys.contains_key(*k))
        .cloned();
    if plan.checkpoint.is_none() {
        plan.status = if plan.failed_keys.is_empty() { BackfillStatus::Completed } else { BackfillStatus::Failed };
    }
    storage.upsert_backfill_plan(&plan).await?;
    info!(plan_id, partition_key, success, progress_pct = plan.progress_pct(), "backfill partition outcome recorded");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(partition_keys: Vec<&str>) -> BackfillPlan {
        BackfillPlan {
            plan_id: "p1".to_string(),
            domain: "d".to_string(),
            source: "s".to_string(),
            partition_keys: partition_keys.into_iter().map(String::from).collect(),
            completed_keys: Default::default(),
            failed_keys: Default::default(),
            status: BackfillStatus::Planned,
            checkpoint: None,
        }
    }

    #[test]
    fn remaining_keys_excludes_completed_and_failed() {
        let mut p = plan(vec!["w1", "w2", "w3"]);
        p.completed_keys.insert("w1".to_string());
        p.failed_keys.insert("w2".to_string(), "boom".to_string());
        assert_eq!(p.remaining_keys(), vec!["w3"]);
    }

    #[test]
    fn progress_pct_reflects_only_completed() {
        let mut p = plan(vec!["w1", "w2", "w3", "w4"]);
        p.completed_keys.insert("w1".to_string());
        p.failed_keys.insert("w2".to_string(), "boom".to_string());
        assert!((p.progress_pct() - 0.25).abs() < f64::EPSILON);
    }
}
