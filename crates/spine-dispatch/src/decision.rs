//! The retry-vs-dead-letter decision (§4.3 retry policy), split out as a
//! pure function of `(error category, retry_count, backoff policy)` so it's
//! testable without a pipeline or a database.

use std::time::Duration;

use spine_retry::BackoffPolicy;
use spine_types::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Permanent errors (validation, `PipelineNotFound`, unresolved ingest
    /// source) and timeouts never retry: terminal `failed`.
    Failed,
    /// Transient failure with retries remaining: back off and return to
    /// `pending`.
    Retry,
    /// Transient failure at `retry_count == max_retries`: terminal
    /// `dead_lettered`.
    DeadLetter,
}

pub fn decide(category: ErrorCategory, retry_count: u32, backoff: &BackoffPolicy) -> FailureOutcome {
    if !category.is_retryable() {
        return FailureOutcome::Failed;
    }
    if backoff.exhausted(retry_count) {
        return FailureOutcome::DeadLetter;
    }
    FailureOutcome::Retry
}

pub fn retry_delay(retry_count: u32, backoff: &BackoffPolicy) -> Duration {
    backoff.delay_for(retry_count).with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 10,
            cap_ms: 1_000,
            max_retries,
        }
    }

    #[test]
    fn permanent_errors_never_retry() {
        assert_eq!(
            decide(ErrorCategory::Permanent, 0, &policy(5)),
            FailureOutcome::Failed
        );
        assert_eq!(
            decide(ErrorCategory::Validation, 0, &policy(5)),
            FailureOutcome::Failed
        );
        assert_eq!(
            decide(ErrorCategory::Timeout, 0, &policy(5)),
            FailureOutcome::Failed
        );
    }

    #[test]
    fn transient_retries_until_exhausted_then_dead_letters() {
        let p = policy(2);
        assert_eq!(decide(ErrorCategory::Transient, 0, &p), FailureOutcome::Retry);
        assert_eq!(decide(ErrorCategory::Transient, 1, &p), FailureOutcome::Retry);
        assert_eq!(decide(ErrorCategory::Transient, 2, &p), FailureOutcome::DeadLetter);
        assert_eq!(decide(ErrorCategory::Transient, 3, &p), FailureOutcome::DeadLetter);
    }
}
