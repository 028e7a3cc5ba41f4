//! Pure step-graph arithmetic (§4.7): which pending steps are ready to run,
//! which pending steps have just become unreachable and should be skipped,
//! and whether a run has reached a terminal state. Takes the latest attempt
//! of each step as input so it can be unit tested against fixed fixtures
//! without a database.

use std::collections::BTreeMap;

use spine_types::{StepStatus, WorkflowRunStatus, WorkflowStep};

fn dependency_satisfied(dep_status: StepStatus, run_on_failure: bool) -> Option<bool> {
    match dep_status {
        StepStatus::Completed | StepStatus::Skipped => Some(true),
        StepStatus::Failed => Some(run_on_failure),
        StepStatus::Pending | StepStatus::Ready | StepStatus::Running => None,
    }
}

/// Step names whose dependencies are all resolved favorably and which are
/// still `pending` — these should transition to `running` this tick.
pub fn ready_steps(steps: &[WorkflowStep]) -> Vec<String> {
    let by_name: BTreeMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.step_name.as_str(), s)).collect();
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| {
            s.depends_on.iter().all(|dep| {
                by_name
                    .get(dep.as_str())
                    .and_then(|d| dependency_satisfied(d.status, s.run_on_failure))
                    .unwrap_or(false)
            })
        })
        .map(|s| s.step_name.clone())
        .collect()
}

/// Step names still `pending` whose dependencies have resolved unfavorably
/// (a failed dependency this step does not override with `run_on_failure`)
/// — these become `skipped` without ever running (§4.7).
pub fn steps_to_skip(steps: &[WorkflowStep]) -> Vec<String> {
    let by_name: BTreeMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.step_name.as_str(), s)).collect();
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| {
            s.depends_on.iter().any(|dep| {
                by_name
                    .get(dep.as_str())
                    .map(|d| dependency_satisfied(d.status, s.run_on_failure) == Some(false))
                    .unwrap_or(false)
            })
        })
        .map(|s| s.step_name.clone())
        .collect()
}

/// No step left in a non-terminal status (§4.7 "run terminates when no
/// ready steps remain" — generalized to the whole non-terminal set since a
/// step can be stuck `pending` behind a still-running dependency too).
pub fn is_run_terminal(steps: &[WorkflowStep]) -> bool {
    steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped))
}

/// `completed` iff every terminal step is `completed` or `skipped` (§4.7).
pub fn final_status(steps: &[WorkflowStep]) -> WorkflowRunStatus {
    if steps.iter().any(|s| s.status == StepStatus::Failed) {
        WorkflowRunStatus::Failed
    } else {
        WorkflowRunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spine_types::{SpineId, StepType};

    fn step(name: &str, depends_on: &[&str], status: StepStatus, run_on_failure: bool) -> WorkflowStep {
        WorkflowStep {
            run_id: SpineId::new("r1"),
            step_name: name.to_string(),
            attempt: 1,
            step_type: StepType::Pipeline { pipeline: "p".to_string() },
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            run_on_failure,
            max_attempts: 1,
            status,
            execution_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn root_steps_are_ready_immediately() {
        let steps = vec![step("a", &[], StepStatus::Pending, false)];
        assert_eq!(ready_steps(&steps), vec!["a".to_string()]);
    }

    #[test]
    fn step_waits_for_running_dependency() {
        let steps = vec![step("a", &[], StepStatus::Running, false), step("b", &["a"], StepStatus::Pending, false)];
        assert!(ready_steps(&steps).is_empty());
        assert!(steps_to_skip(&steps).is_empty());
    }

    #[test]
    fn failed_dependency_skips_downstream_without_run_on_failure() {
        let steps = vec![step("a", &[], StepStatus::Failed, false), step("b", &["a"], StepStatus::Pending, false)];
        assert_eq!(steps_to_skip(&steps), vec!["b".to_string()]);
        assert!(ready_steps(&steps).is_empty());
    }

    #[test]
    fn run_on_failure_lets_downstream_proceed_despite_failure() {
        let steps = vec![step("a", &[], StepStatus::Failed, false), step("b", &["a"], StepStatus::Pending, true)];
        assert_eq!(ready_steps(&steps), vec!["b".to_string()]);
        assert!(steps_to_skip(&steps).is_empty());
    }

    #[test]
    fn diamond_join_waits_for_both_branches() {
        let steps = vec![
            step("a", &[], StepStatus::Completed, false),
            step("b", &["a"], StepStatus::Completed, false),
            step("c", &["a"], StepStatus::Running, false),
            step("d", &["b", "c"], StepStatus::Pending, false),
        ];
        assert!(ready_steps(&steps).is_empty());
    }

    #[test]
    fn run_terminal_and_final_status_reflect_failures() {
        let steps = vec![
            step("a", &[], StepStatus::Completed, false),
            step("b", &["a"], StepStatus::Failed, false),
            step("c", &["b"], StepStatus::Skipped, false),
        ];
        assert!(is_run_terminal(&steps));
        assert_eq!(final_status(&steps), WorkflowRunStatus::Failed);
    }
}
