use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SpineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Interval,
    /// One-shot; the schedule disables itself after firing (§4.6e).
    At,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "target_type")]
pub enum ScheduleTarget {
    Pipeline { name: String },
    Workflow { name: String },
}

/// A recurring or one-shot emission rule (§3 `Schedule`). `name` is unique;
/// `next_run_at` is monotonically non-decreasing between successful
/// computes; when `enabled = false` no runs are emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub target: ScheduleTarget,
    pub params: Value,
    pub schedule_type: ScheduleType,
    /// Cron expression, ISO-8601 interval in seconds (as a string), or an
    /// RFC 3339 instant, depending on `schedule_type`.
    pub expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub max_instances: u32,
    pub misfire_grace_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<ScheduleRunStatus>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Missed,
}

/// One emission of a schedule (§3 `ScheduleRun`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: SpineId,
    pub schedule_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScheduleRunStatus,
    pub run_id: Option<SpineId>,
    pub execution_id: Option<SpineId>,
    pub skip_reason: Option<String>,
}

/// Per-schedule mutex with TTL; identical shape to [`crate::ConcurrencyLock`]
/// but keyed by schedule name so schedule evaluation and dispatcher
/// concurrency locks never collide in the same namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleLock {
    pub schedule_name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
