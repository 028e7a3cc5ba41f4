//! Ordering and idempotency for the append-only event logs behind
//! [`Execution`](spine_types::Execution) history (§4.3) and
//! [`WorkflowRun`](spine_types::WorkflowRun) history (§4.7).
//!
//! Both logs are append-only and ordered by `(timestamp, insertion order)`,
//! and the workflow log additionally dedups by idempotency key so a retried
//! step handler never double-records an event (§4.7). [`EventSequencer`]
//! gives both callers one place to assign the insertion-order tiebreaker and
//! to decide "have I already written this one" before a row ever reaches
//! storage.
//!
//! # Example
//!
//! ```
//! use spine_events::EventSequencer;
//!
//! let mut seq = EventSequencer::new();
//! assert_eq!(seq.next_seq(), 0);
//! assert_eq!(seq.next_seq(), 1);
//!
//! assert!(seq.admit("wf-run-1/step-a/completed/0"));
//! assert!(!seq.admit("wf-run-1/step-a/completed/0"));
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use spine_types::{EventType, ExecutionEvent, SpineId, WorkflowEvent};

/// Assigns the monotone insertion-order tiebreaker for events sharing a
/// timestamp, and tracks which idempotency keys have already been admitted.
///
/// One `EventSequencer` is scoped to a single aggregate (one execution, or
/// one workflow run) — the dispatcher and workflow runner each keep one per
/// in-flight aggregate, typically loaded from the highest persisted sequence
/// number on resume.
#[derive(Debug, Default)]
pub struct EventSequencer {
    next: u64,
    seen: HashSet<String>,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a sequencer whose aggregate already has history: `last_seq` is
    /// the highest sequence number previously persisted, or `None` for a
    /// fresh aggregate.
    pub fn resume(last_seq: Option<u64>) -> Self {
        Self {
            next: last_seq.map(|n| n + 1).unwrap_or(0),
            seen: HashSet::new(),
        }
    }

    /// Hand out the next insertion-order sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// Returns `true` the first time a given idempotency key is seen, and
    /// `false` on every repeat — the caller should skip the write when this
    /// returns `false`.
    pub fn admit(&mut self, idempotency_key: &str) -> bool {
        self.seen.insert(idempotency_key.to_string())
    }
}

/// Deterministic idempotency key for a workflow event, per §4.7:
/// `hash(run_id, step_id, event_type, attempt)`. Using the plain tuple
/// rendered as a string is sufficient — the key only needs to be stable and
/// unique per `(run, step, event, attempt)`, not opaque.
pub fn workflow_idempotency_key(
    run_id: &SpineId,
    step_name: Option<&str>,
    event_type: &str,
    attempt: u32,
) -> String {
    format!(
        "{run_id}/{}/{event_type}/{attempt}",
        step_name.unwrap_or("-")
    )
}

/// Build a [`WorkflowEvent`], stamping `idempotency_key` per
/// [`workflow_idempotency_key`]. Callers still pass the result through
/// [`EventSequencer::admit`] before writing, since the sequencer — not this
/// constructor — is what decides whether a retried handler should skip the
/// write.
pub fn workflow_event(
    run_id: SpineId,
    step_name: Option<String>,
    event_type: &str,
    attempt: u32,
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
) -> WorkflowEvent {
    let idempotency_key =
        workflow_idempotency_key(&run_id, step_name.as_deref(), event_type, attempt);
    WorkflowEvent {
        run_id,
        step_name,
        event_type: event_type.to_string(),
        idempotency_key,
        data,
        timestamp,
    }
}

/// Order a batch of execution events by `(timestamp, insertion order)` as
/// required for history replay (§3 `ExecutionEvent`). The events must already
/// carry the sequence number the [`EventSequencer`] assigned at write time.
pub fn order_execution_events(events: &mut [(u64, ExecutionEvent)]) {
    events.sort_by(|a, b| {
        a.1.timestamp
            .cmp(&b.1.timestamp)
            .then_with(|| a.0.cmp(&b.0))
    });
}

/// Order a batch of workflow events the same way, and drop any whose
/// idempotency key repeats earlier in the slice — a defensive re-check for
/// callers that load history directly from storage rather than through a
/// live [`EventSequencer`].
pub fn order_workflow_events(mut events: Vec<(u64, WorkflowEvent)>) -> Vec<WorkflowEvent> {
    events.sort_by(|a, b| {
        a.1.timestamp
            .cmp(&b.1.timestamp)
            .then_with(|| a.0.cmp(&b.0))
    });
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter_map(|(_, event)| {
            if seen.insert(event.idempotency_key.clone()) {
                Some(event)
            } else {
                None
            }
        })
        .collect()
}

/// Render an [`EventType`] as the label used when mirroring execution
/// history into workflow events. The dispatcher's `Retrying` variant is
/// deliberately a transient event label, never a persisted
/// [`spine_types::ExecutionStatus`] (§3 Invariants) — this function is the
/// one place that turns it into a string for logging and workflow history.
pub fn event_type_label(event_type: &EventType) -> &'static str {
    match event_type {
        EventType::Created => "created",
        EventType::Started => "started",
        EventType::Progress { .. } => "progress",
        EventType::Completed { .. } => "completed",
        EventType::Failed { .. } => "failed",
        EventType::Retrying { .. } => "retrying",
        EventType::Cancelled { .. } => "cancelled",
        EventType::DeadLettered { .. } => "dead_lettered",
        EventType::Event { .. } => "event",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequencer_is_monotone() {
        let mut seq = EventSequencer::new();
        let seqs: Vec<u64> = (0..5).map(|_| seq.next_seq()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn resume_continues_after_last_seq() {
        let mut seq = EventSequencer::resume(Some(7));
        assert_eq!(seq.next_seq(), 8);
        assert_eq!(seq.next_seq(), 9);
    }

    #[test]
    fn admit_dedups_by_idempotency_key() {
        let mut seq = EventSequencer::new();
        assert!(seq.admit("a"));
        assert!(seq.admit("b"));
        assert!(!seq.admit("a"));
    }

    #[test]
    fn workflow_idempotency_key_is_stable() {
        let run_id = SpineId::new("wf-run-1");
        let key_a = workflow_idempotency_key(&run_id, Some("load"), "completed", 0);
        let key_b = workflow_idempotency_key(&run_id, Some("load"), "completed", 0);
        assert_eq!(key_a, key_b);

        let key_retry = workflow_idempotency_key(&run_id, Some("load"), "completed", 1);
        assert_ne!(key_a, key_retry);
    }

    #[test]
    fn order_workflow_events_drops_repeated_idempotency_keys() {
        let run_id = SpineId::new("wf-run-1");
        let now = Utc::now();
        let e1 = workflow_event(run_id, Some("load".into()), "completed", 0, serde_json::json!({}), now);
        let e2 = e1.clone();
        let ordered = order_workflow_events(vec![(0, e1), (1, e2)]);
        assert_eq!(ordered.len(), 1);
    }
}
