use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SpineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A DAG run (§3 `WorkflowRun`). Counters must equal the count of terminal
/// steps by status (§8.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: SpineId,
    pub workflow_name: String,
    pub workflow_version: String,
    pub params: Value,
    pub status: WorkflowRunStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    Pipeline { pipeline: String },
    Parallel { children: Vec<String> },
    Sequential { children: Vec<String> },
    Conditional { when: String },
    External { handle: String },
}

/// A step within a `WorkflowRun`, keyed by `(run_id, step_name, attempt)`
/// (§3 `WorkflowStep`). `run_on_failure` mirrors the edge property that
/// lets a downstream step run even when its dependency failed (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub run_id: SpineId,
    pub step_name: String,
    pub attempt: u32,
    pub step_type: StepType,
    pub depends_on: Vec<String>,
    pub run_on_failure: bool,
    pub max_attempts: u32,
    pub status: StepStatus,
    pub execution_id: Option<SpineId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only workflow log entry with a deterministic idempotency key
/// (`hash(run_id, step_id, event_type, attempt)`) so retried handlers never
/// double-record (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub run_id: SpineId,
    pub step_name: Option<String>,
    pub event_type: String,
    pub idempotency_key: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}
