use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SpineId;

/// Named distributed lock with a TTL (§3, §4.4). Acquisition is a
/// conditional insert keyed by `lock_key`; release is an idempotent delete
/// by `(lock_key, execution_id)`. A lock is considered expired, and thus
/// reclaimable, once `now > expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLock {
    pub lock_key: String,
    pub execution_id: SpineId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConcurrencyLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
