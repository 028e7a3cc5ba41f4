//! # Types
//!
//! Core domain types for Market Spine: pipeline registration, executions,
//! locks, the work-item queue, schedules, the capture ledger, workflow runs,
//! watermarks/backfills, and the alert bus.
//!
//! ## Serialization
//!
//! Most types implement `Serialize`/`Deserialize` for persistence via
//! `spine-storage`. Durations are serialized as milliseconds
//! (`serde_with::DurationMilliSeconds`) for cross-dialect portability, and
//! timestamps are always UTC, matching §4.1's "portable encodings" rule.
//!
//! ## Stability
//!
//! These types mirror the persistence schema in `spine-storage`; a field
//! rename here is a migration.

mod alert;
mod capture;
mod error;
mod execution;
mod lock;
mod pipeline;
mod schedule;
mod source;
mod watermark;
mod workflow;
mod workitem;

pub use alert::{Alert, AlertChannel, AlertDelivery, AlertSeverity, AlertThrottle, DeliveryStatus};
pub use capture::{Anomaly, CaptureId, DataReadiness, Manifest, QualityCheck, QualityStatus, Reject};
pub use error::{ErrorCategory, SpineError};
pub use execution::{DeadLetter, Execution, ExecutionEvent, EventType, ExecutionStatus, Lane, TriggerSource};
pub use lock::ConcurrencyLock;
pub use pipeline::{ParamDef, ParamKind, ParamValue, PipelineSpec};
pub use schedule::{Schedule, ScheduleLock, ScheduleRun, ScheduleRunStatus, ScheduleTarget, ScheduleType};
pub use source::{Source, SourceCache, SourceFetch};
pub use watermark::{BackfillPlan, BackfillStatus, BitemporalFact, Watermark};
pub use workflow::{StepStatus, StepType, WorkflowEvent, WorkflowRun, WorkflowRunStatus, WorkflowStep};
pub use workitem::{WorkItem, WorkItemState};

/// Time-sortable identifier shared by every entity that needs one. Wraps the
/// canonical ULID-like string produced by the Clock & ID Service; kept as an
/// opaque newtype here so storage and component crates never format IDs
/// themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SpineId(pub String);

impl SpineId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SpineId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
