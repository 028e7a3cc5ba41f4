use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SpineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    Leased,
    Running,
    Completed,
    Failed,
    Dead,
}

/// Durable, partition-keyed task (§3 `WorkItem`). Unique per `(domain,
/// pipeline, partition_key)`. State transitions are monotone modulo retry
/// (`Leased -> Pending` on lease expiry only); `attempt_count <=
/// max_attempts`; while `Leased`, `locked_by`/`locked_at` are set and
/// `locked_at + lease_ttl > now`, or the item is reclaimable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: SpineId,
    pub domain: String,
    pub pipeline: String,
    pub partition_key: String,
    pub params: Value,
    pub desired_at: DateTime<Utc>,
    pub priority: i32,
    pub state: WorkItemState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub current_execution_id: Option<SpineId>,
    pub latest_execution_id: Option<SpineId>,
}

impl WorkItem {
    /// Whether a lease held since `locked_at` has outlived `lease_ttl_ms`
    /// and is therefore reclaimable (§4.5 `Reclaim`).
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_ttl_ms: i64) -> bool {
        match self.locked_at {
            Some(locked_at) => now > locked_at + chrono::Duration::milliseconds(lease_ttl_ms),
            None => false,
        }
    }
}
