use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::SpineError;
use crate::SpineId;

/// An execution class with its own concurrency and retry policy (Glossary
/// "Lane"). `dispatcher.lanes` in configuration keys settings by this name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Normal,
    Priority,
    Backfill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Scheduler,
    Api,
    Workflow,
    Retry,
}

/// Persisted status of an `Execution` (§4.3). `retrying` is deliberately
/// absent here — it is a transient event label, not a status; see
/// [`EventType::Retrying`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::DeadLettered
        )
    }
}

/// The state of one pipeline run (§3 `Execution`).
///
/// Invariant: `created_at <= started_at <= completed_at` when set; a
/// terminal `status` requires `completed_at`; `idempotency_key` is unique
/// per `(pipeline, key)` while the execution is non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: SpineId,
    pub pipeline: String,
    pub params: Value,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_execution_id: Option<SpineId>,
    pub retry_count: u32,
    pub idempotency_key: Option<String>,
    pub result: Option<Value>,
    pub error: Option<SpineError>,
    pub logical_key: Option<String>,
}

/// Append-only event on an execution's history (§3 `ExecutionEvent`).
/// Ordered by `timestamp` then insertion order; the first event for any
/// execution is always `created`, the last (once terminal) one of
/// `completed|failed|cancelled|dead_lettered` (§8 invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: SpineId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    Created,
    Started,
    Progress { data: Value },
    Completed { result: Option<Value> },
    Failed { error: SpineError },
    /// Transient label recorded when a failed execution is requeued;
    /// `retry_count == |events.retrying|` is a tested invariant (§8.1).
    Retrying { next_attempt_at: DateTime<Utc> },
    Cancelled { reason: String },
    DeadLettered { dead_letter_id: SpineId },
    Event { data: Value },
}

/// Immutable snapshot of an execution that exhausted retries (§3
/// `DeadLetter`). Immutable until `resolved_at` is set.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: SpineId,
    pub execution_id: SpineId,
    pub pipeline: String,
    pub params: Value,
    pub error: SpineError,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    pub time_to_exhaustion: Option<Duration>,
}
