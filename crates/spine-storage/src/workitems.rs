//! `core_work_items` (§6.3, §4.5). Leasing follows the `FOR UPDATE SKIP
//! LOCKED` claim pattern used for Postgres task queues: a lease is a
//! conditional update guarded by the same row lock that picks the candidate,
//! so two workers racing for the same item never both win.

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_types::{SpineId, WorkItem, WorkItemState};

use crate::error::StorageError;
use crate::pool::Storage;

fn state_str(state: WorkItemState) -> &'static str {
    match state {
        WorkItemState::Pending => "pending",
        WorkItemState::Leased => "leased",
        WorkItemState::Running => "running",
        WorkItemState::Completed => "completed",
        WorkItemState::Failed => "failed",
        WorkItemState::Dead => "dead",
    }
}

fn state_from_str(s: &str) -> WorkItemState {
    match s {
        "leased" => WorkItemState::Leased,
        "running" => WorkItemState::Running,
        "completed" => WorkItemState::Completed,
        "failed" => WorkItemState::Failed,
        "dead" => WorkItemState::Dead,
        _ => WorkItemState::Pending,
    }
}

impl Storage {
    /// Insert a work item unless its `(domain, pipeline, partition_key)`
    /// triple already has one pending/leased/running (§4.5 `Enqueue`
    /// uniqueness). Returns `false` when an active item already occupies the
    /// slot.
    pub async fn enqueue_work_item(&self, item: &WorkItem) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_work_items (
                id, domain, pipeline, partition_key, params, desired_at,
                priority, state, attempt_count, max_attempts, last_error,
                next_attempt_at, locked_by, locked_at, current_execution_id,
                latest_execution_id
            )
            SELECT $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16
            WHERE NOT EXISTS (
                SELECT 1 FROM core_work_items
                WHERE domain = $2 AND pipeline = $3 AND partition_key = $4
                  AND state IN ('pending','leased','running')
            )
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.domain)
        .bind(&item.pipeline)
        .bind(&item.partition_key)
        .bind(&item.params)
        .bind(item.desired_at)
        .bind(item.priority)
        .bind(state_str(item.state))
        .bind(item.attempt_count as i64)
        .bind(item.max_attempts as i64)
        .bind(&item.last_error)
        .bind(item.next_attempt_at)
        .bind(&item.locked_by)
        .bind(item.locked_at)
        .bind(item.current_execution_id.as_ref().map(SpineId::as_str))
        .bind(item.latest_execution_id.as_ref().map(SpineId::as_str))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Claim up to `limit` ready items (`pending` and due, or a `leased` item
    /// whose lease has expired), highest priority first, and mark them
    /// `leased` under `worker_id` in one transaction (§4.5 `Lease`).
    pub async fn lease_work_items(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl_ms: i64,
        limit: i64,
    ) -> Result<Vec<WorkItem>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT * FROM core_work_items
            WHERE desired_at <= $1
              AND (
                state = 'pending'
                OR (state = 'leased' AND locked_at < $1 - ($2 || ' milliseconds')::interval)
              )
            ORDER BY priority DESC, desired_at
            FOR UPDATE SKIP LOCKED
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(lease_ttl_ms.to_string())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query(
                "UPDATE core_work_items SET state = 'leased', locked_by = $2, locked_at = $3 WHERE id = $1",
            )
            .bind(&row.id)
            .bind(worker_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn mark_work_item_running(&self, id: &SpineId, execution_id: &SpineId) -> Result<(), StorageError> {
        sqlx::query("UPDATE core_work_items SET state = 'running', current_execution_id = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(execution_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_work_item(&self, id: &SpineId, execution_id: &SpineId) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE core_work_items SET
                state = 'completed', locked_by = NULL, locked_at = NULL,
                current_execution_id = NULL, latest_execution_id = $2
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(execution_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt (§4.5 `Fail`). `next_attempt_at = Some` keeps
    /// the item `pending` for another try. `next_attempt_at = None` means no
    /// further attempt is coming: `retryable` distinguishes an item that
    /// exhausted its attempt budget (`dead`) from one whose error was never
    /// retryable to begin with (`failed`).
    pub async fn fail_work_item(
        &self,
        id: &SpineId,
        execution_id: &SpineId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        retryable: bool,
    ) -> Result<(), StorageError> {
        let new_state = match (next_attempt_at.is_some(), retryable) {
            (true, _) => "pending",
            (false, true) => "dead",
            (false, false) => "failed",
        };
        sqlx::query(
            r#"
            UPDATE core_work_items SET
                state = $2, attempt_count = attempt_count + 1, last_error = $3,
                next_attempt_at = $4, desired_at = COALESCE($4, desired_at),
                locked_by = NULL, locked_at = NULL, current_execution_id = NULL,
                latest_execution_id = $5
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(new_state)
        .bind(error)
        .bind(next_attempt_at)
        .bind(execution_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reclaim leases that outlived `lease_ttl_ms` back to `pending` without
    /// a worker having to lose its claim first — used by the background
    /// sweep in §4.5 `Reclaim` as a belt-and-suspenders pass alongside the
    /// self-healing `lease_work_items` query above.
    pub async fn reclaim_expired_leases(&self, now: DateTime<Utc>, lease_ttl_ms: i64) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE core_work_items SET state = 'pending', locked_by = NULL, locked_at = NULL
            WHERE state = 'leased' AND locked_at < $1 - ($2 || ' milliseconds')::interval
            "#,
        )
        .bind(now)
        .bind(lease_ttl_ms.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_work_item(&self, id: &SpineId) -> Result<WorkItem, StorageError> {
        let row = sqlx::query_as::<_, WorkItemRow>("SELECT * FROM core_work_items WHERE id = $1")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    /// The one row (if any) currently occupying `(domain, pipeline,
    /// partition_key)`, regardless of state — used by `Enqueue`'s upsert
    /// check (§4.5) before deciding whether to insert or reset in place.
    pub async fn find_work_item_by_key(
        &self,
        domain: &str,
        pipeline: &str,
        partition_key: &str,
    ) -> Result<Option<WorkItem>, StorageError> {
        let row = sqlx::query_as::<_, WorkItemRow>(
            "SELECT * FROM core_work_items WHERE domain = $1 AND pipeline = $2 AND partition_key = $3",
        )
        .bind(domain)
        .bind(pipeline)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Reset a terminal work item back to `pending` in place, with fresh
    /// params/desired_at/priority/max_attempts (§4.5 `Enqueue` re-upsert).
    /// Clears attempt bookkeeping so the reset item gets a full retry budget.
    pub async fn reset_work_item_to_pending(
        &self,
        id: &SpineId,
        params: &Value,
        desired_at: DateTime<Utc>,
        priority: i32,
        max_attempts: u32,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE core_work_items SET
                state = 'pending', params = $2, desired_at = $3, priority = $4,
                max_attempts = $5, attempt_count = 0, last_error = NULL,
                next_attempt_at = NULL, locked_by = NULL, locked_at = NULL,
                current_execution_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(params)
        .bind(desired_at)
        .bind(priority)
        .bind(max_attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    domain: String,
    pipeline: String,
    partition_key: String,
    params: Value,
    desired_at: DateTime<Utc>,
    priority: i32,
    state: String,
    attempt_count: i64,
    max_attempts: i64,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    current_execution_id: Option<String>,
    latest_execution_id: Option<String>,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        WorkItem {
            id: SpineId::new(row.id),
            domain: row.domain,
            pipeline: row.pipeline,
            partition_key: row.partition_key,
            params: row.params,
            desired_at: row.desired_at,
            priority: row.priority,
            state: state_from_str(&row.state),
            attempt_count: row.attempt_count as u32,
            max_attempts: row.max_attempts as u32,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            current_execution_id: row.current_execution_id.map(SpineId::new),
            latest_execution_id: row.latest_execution_id.map(SpineId::new),
        }
    }
}
