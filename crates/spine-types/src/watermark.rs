use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per `(domain, source, partition_key)` cursor (§3 `Watermark`).
/// `high_water` is monotonically non-decreasing under normal operation;
/// explicit rewinds are logged as anomalies (§8.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    pub domain: String,
    pub source: String,
    pub partition_key: String,
    pub low_water: DateTime<Utc>,
    pub high_water: DateTime<Utc>,
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Planned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A bounded, resumable re-ingest plan (§3 `BackfillPlan`).
///
/// Invariants: `completed_keys ∪ failed_keys ⊆ partition_keys`;
/// `progress_pct = |completed_keys| / |partition_keys|` (§8.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub plan_id: String,
    pub domain: String,
    pub source: String,
    pub partition_keys: Vec<String>,
    pub completed_keys: BTreeSet<String>,
    pub failed_keys: BTreeMap<String, String>,
    pub status: BackfillStatus,
    /// Earliest unprocessed partition key; re-invoking `Execute` resumes
    /// from here (§4.9.5).
    pub checkpoint: Option<String>,
}

impl BackfillPlan {
    pub fn progress_pct(&self) -> f64 {
        if self.partition_keys.is_empty() {
            return 1.0;
        }
        self.completed_keys.len() as f64 / self.partition_keys.len() as f64
    }

    /// Partitions still needing an attempt: not completed, regardless of
    /// whether they previously failed (a failed key is only retried
    /// explicitly, per §8.8 scenario S6 — `Execute` alone does not retry
    /// `failed_keys`).
    pub fn remaining_keys(&self) -> Vec<&str> {
        self.partition_keys
            .iter()
            .map(String::as_str)
            .filter(|k| !self.completed_keys.contains(*k) && !self.failed_keys.contains_key(*k))
            .collect()
    }
}

/// `(entity_key, valid_[from,to), system_[from,to), payload, provenance)`
/// (§3 `BitemporalFact`). For a given `entity_key` the open intervals in the
/// system dimension never overlap; a write closes the current open interval
/// and opens a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitemporalFact {
    pub entity_key: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub system_from: DateTime<Utc>,
    pub system_to: Option<DateTime<Utc>>,
    pub payload: Value,
    pub provenance: String,
}
