//! Work-item queue (§4.5): tracks desire (what should eventually run for a
//! `(domain, pipeline, partition_key)` slice) separately from attempt
//! (the in-flight lease driving it toward a terminal state). Used by
//! schedulers and backfill planners to fan out partition-scoped work without
//! double-running the same slice.

mod error;

pub use error::WorkQueueError;

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_retry::BackoffPolicy;
use spine_storage::Storage;
use spine_types::{SpineId, WorkItem, WorkItemState};
use tracing::{debug, info};
use uuid::Uuid;

fn new_id() -> SpineId {
    SpineId::new(Uuid::new_v4().to_string())
}

fn is_active(state: WorkItemState) -> bool {
    matches!(state, WorkItemState::Pending | WorkItemState::Leased | WorkItemState::Running)
}

/// Upsert a work item by its `(domain, pipeline, partition_key)` key
/// (§4.5 `Enqueue`). An active item at that key is returned unchanged — the
/// caller already has a claim in flight. A terminal item is reset to
/// `pending` in place with the new params/desired_at/priority/max_attempts,
/// unless it is `completed` and `skip_if_completed` is set, in which case it
/// is also returned unchanged.
#[tracing::instrument(skip(storage, params), fields(domain, pipeline, partition_key))]
pub async fn enqueue(
    storage: &Storage,
    domain: &str,
    pipeline: &str,
    partition_key: &str,
    params: Value,
    desired_at: DateTime<Utc>,
    priority: i32,
    max_attempts: u32,
    skip_if_completed: bool,
) -> Result<WorkItem, WorkQueueError> {
    if let Some(existing) = storage.find_work_item_by_key(domain, pipeline, partition_key).await? {
        if is_active(existing.state) {
            debug!(work_item_id = %existing.id, state = ?existing.state, "enqueue found active item, leaving it in place");
            return Ok(existing);
        }
        if existing.state == WorkItemState::Completed && skip_if_completed {
            debug!(work_item_id = %existing.id, "enqueue skipped reset of completed item");
            return Ok(existing);
        }
        storage
            .reset_work_item_to_pending(&existing.id, &params, desired_at, priority, max_attempts)
            .await?;
        info!(work_item_id = %existing.id, previous_state = ?existing.state, "work item reset to pending");
        return Ok(storage.get_work_item(&existing.id).await?);
    }

    let item = WorkItem {
        id: new_id(),
        domain: domain.to_string(),
        pipeline: pipeline.to_string(),
        partition_key: partition_key.to_string(),
        params,
        desired_at,
        priority,
        state: WorkItemState::Pending,
        attempt_count: 0,
        max_attempts,
        last_error: None,
        next_attempt_at: None,
        locked_by: None,
        locked_at: None,
        current_execution_id: None,
        latest_execution_id: None,
    };
    if !storage.enqueue_work_item(&item).await? {
        // Lost a race with a concurrent enqueue between the lookup and the
        // insert; the other writer's row is authoritative.
        return storage
            .find_work_item_by_key(domain, pipeline, partition_key)
            .await?
            .ok_or_else(|| WorkQueueError::NotFound(partition_key.to_string()));
    }
    info!(work_item_id = %item.id, "work item enqueued");
    Ok(item)
}

/// Claim up to `limit` ready items for `worker_id` (§4.5 `Lease`).
#[tracing::instrument(skip(storage))]
pub async fn lease(
    storage: &Storage,
    worker_id: &str,
    now: DateTime<Utc>,
    lease_ttl_ms: i64,
    limit: i64,
) -> Result<Vec<WorkItem>, WorkQueueError> {
    let items = storage.lease_work_items(worker_id, now, lease_ttl_ms, limit).await?;
    debug!(count = items.len(), worker_id, "leased work items");
    Ok(items)
}

/// Mark a leased item `running` under the execution driving it.
pub async fn start(storage: &Storage, item_id: &SpineId, execution_id: &SpineId) -> Result<(), WorkQueueError> {
    storage.mark_work_item_running(item_id, execution_id).await?;
    Ok(())
}

/// Record a successful attempt (§4.5 `Complete`).
#[tracing::instrument(skip(storage))]
pub async fn complete(storage: &Storage, item_id: &SpineId, execution_id: &SpineId) -> Result<(), WorkQueueError> {
    storage.complete_work_item(item_id, execution_id).await?;
    info!(work_item_id = %item_id, "work item completed");
    Ok(())
}

/// Record a failed attempt (§4.5 `Fail`). When `retryable` and the item still
/// has attempts left, computes the next attempt time from `backoff` and
/// leaves the item `pending`; otherwise the item goes `dead`.
#[tracing::instrument(skip(storage, backoff))]
pub async fn fail(
    storage: &Storage,
    item_id: &SpineId,
    execution_id: &SpineId,
    error: &str,
    retryable: bool,
    backoff: &BackoffPolicy,
) -> Result<WorkItem, WorkQueueError> {
    let item = storage.get_work_item(item_id).await?;
    let next_attempt_at = if retryable && !backoff.exhausted(item.attempt_count) {
        Some(Utc::now() + chrono::Duration::from_std(backoff.delay_for(item.attempt_count).with_jitter()).unwrap_or_default())
    } else {
        None
    };
    storage.fail_work_item(item_id, execution_id, error, next_attempt_at, retryable).await?;
    match (next_attempt_at, retryable) {
        (Some(at), _) => info!(work_item_id = %item_id, next_attempt_at = %at, "work item requeued for retry"),
        (None, true) => tracing::warn!(work_item_id = %item_id, attempt_count = item.attempt_count, "work item exhausted retries, marked dead"),
        (None, false) => tracing::warn!(work_item_id = %item_id, "work item failed permanently, not retryable"),
    }
    Ok(storage.get_work_item(item_id).await?)
}

/// Sweep leases that outlived their TTL back to `pending` (§4.5 `Reclaim`).
#[tracing::instrument(skip(storage))]
pub async fn reclaim(storage: &Storage, now: DateTime<Utc>, lease_ttl_ms: i64) -> Result<u64, WorkQueueError> {
    let count = storage.reclaim_expired_leases(now, lease_ttl_ms).await?;
    if count > 0 {
        info!(count, "reclaimed expired work item leases");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states_are_not_reset_candidates() {
        assert!(is_active(WorkItemState::Pending));
        assert!(is_active(WorkItemState::Leased));
        assert!(is_active(WorkItemState::Running));
        assert!(!is_active(WorkItemState::Completed));
        assert!(!is_active(WorkItemState::Failed));
        assert!(!is_active(WorkItemState::Dead));
    }
}
