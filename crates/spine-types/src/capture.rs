use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SpineId;

/// Identity of one attempt at producing a dataset partition (§3
/// `CaptureId`). Format: `domain:tier:partition:hash(captured_at)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(pub String);

impl CaptureId {
    /// Build the `domain:tier:partition:hash` form; `hash` is the
    /// capture-hash fragment computed by the Capture Service from
    /// `captured_at` (default: first 6 hex of SHA-256, widened to 8 hex is
    /// allowed per the open question in §9).
    pub fn new(domain: &str, tier: &str, partition: &str, hash: &str, separator: &str) -> Self {
        Self(format!("{domain}{separator}{tier}{separator}{partition}{separator}{hash}"))
    }
}

/// Per `(domain, partition_key, stage)` production record (§3 `Manifest`).
/// Updated idempotently on successful stage completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub row_count: u64,
    pub metrics: Value,
    pub execution_id: SpineId,
    pub batch_id: String,
    pub updated_at: DateTime<Utc>,
}

/// One bad input record (§3 `Reject`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reject {
    pub id: SpineId,
    pub domain: String,
    pub partition_key: String,
    pub reason_code: String,
    pub raw_payload: Value,
    pub source_locator: String,
    pub execution_id: SpineId,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub domain: String,
    pub partition_key: String,
    pub check_name: String,
    pub category: String,
    pub status: QualityStatus,
    pub actual: Value,
    pub expected: Value,
    pub details: Option<String>,
}

/// Detected deviation (§3 `Anomaly`). Also used to record
/// `watermark_rewind` and `outside_grace` style conditions raised by other
/// components per their own invariants (§8.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: SpineId,
    pub domain: String,
    pub partition_key: Option<String>,
    pub severity: crate::AlertSeverity,
    pub category: String,
    pub sample_affected_records: Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Derived readiness booleans for `(domain, partition, ready_for)` (§3
/// `DataReadiness`), maintained by a reducer over manifest + anomalies +
/// the dependency graph (`core_calc_dependencies`, `core_expected_schedules`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReadiness {
    pub domain: String,
    pub partition_key: String,
    pub ready_for: String,
    pub all_partitions_present: bool,
    pub all_stages_complete: bool,
    pub no_critical_anomalies: bool,
    pub dependencies_current: bool,
    pub age_exceeds_preliminary: bool,
    pub certifier: Option<String>,
    pub certified_at: Option<DateTime<Utc>>,
}

impl DataReadiness {
    /// The derived `is_ready` boolean (§3): all structural conditions hold
    /// and the partition has not merely aged past its preliminary window
    /// without certification.
    pub fn is_ready(&self) -> bool {
        self.all_partitions_present
            && self.all_stages_complete
            && self.no_critical_anomalies
            && self.dependencies_current
            && !self.age_exceeds_preliminary
    }
}
