//! `core_concurrency_locks`, `core_schedule_locks` (§6.3). Both are named,
//! TTL-bound mutexes; acquisition is a conditional insert, release an
//! idempotent delete, and an expired holder is reclaimable by anyone. The
//! locking *policy* (retry-until-available, TTL choice) lives in
//! `spine-lock`; this module only does the conditional SQL.

use chrono::{DateTime, Utc};
use spine_types::{ConcurrencyLock, SpineId};

use crate::error::StorageError;
use crate::pool::Storage;

impl Storage {
    /// Acquire `lock_key` for `execution_id` until `expires_at`, unless an
    /// unexpired holder already exists. Returns `true` iff this call won the
    /// lock (§4.4 `Acquire`).
    pub async fn try_acquire_lock(
        &self,
        lock_key: &str,
        execution_id: &SpineId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_concurrency_locks (lock_key, execution_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_key) DO UPDATE SET
                execution_id = EXCLUDED.execution_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE core_concurrency_locks.expires_at < $5
            "#,
        )
        .bind(lock_key)
        .bind(execution_id.as_str())
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Idempotent release: deleting a lock that was never held, or already
    /// released, is not an error (§4.4 `Release`).
    pub async fn release_lock(&self, lock_key: &str, execution_id: &SpineId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM core_concurrency_locks WHERE lock_key = $1 AND execution_id = $2")
            .bind(lock_key)
            .bind(execution_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_lock(&self, lock_key: &str) -> Result<Option<ConcurrencyLock>, StorageError> {
        let row = sqlx::query_as::<_, (String, String, DateTime<Utc>, DateTime<Utc>)>(
            "SELECT lock_key, execution_id, acquired_at, expires_at FROM core_concurrency_locks WHERE lock_key = $1",
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(lock_key, execution_id, acquired_at, expires_at)| ConcurrencyLock {
            lock_key,
            execution_id: SpineId::new(execution_id),
            acquired_at,
            expires_at,
        }))
    }

    pub async fn try_acquire_schedule_lock(
        &self,
        schedule_name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO core_schedule_locks (schedule_name, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (schedule_name) DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE core_schedule_locks.expires_at < $5
            "#,
        )
        .bind(schedule_name)
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_schedule_lock(&self, schedule_name: &str, holder: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM core_schedule_locks WHERE schedule_name = $1 AND holder = $2")
            .bind(schedule_name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
