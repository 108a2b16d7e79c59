//! Parallel status derivation and failure messages.

use super::SuccessPolicy;
use crate::storage::{StageExecution, StageStatus};

/// Derived status of a parallel stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelStatus {
    /// Some branch is still pending or active.
    Running,
    Completed,
    Failed,
    Paused,
}

impl ParallelStatus {
    /// Matching stage status, `None` while running
    pub fn stage_status(&self) -> Option<StageStatus> {
        match self {
            ParallelStatus::Running => None,
            ParallelStatus::Completed => Some(StageStatus::Completed),
            ParallelStatus::Failed => Some(StageStatus::Failed),
            ParallelStatus::Paused => Some(StageStatus::Paused),
        }
    }
}

fn is_running(status: StageStatus) -> bool {
    matches!(status, StageStatus::Pending | StageStatus::Active)
}

/// Whether the success policy is already decided.
///
/// Returns `Some(true)` once satisfied, `Some(false)` once no remaining
/// branch can satisfy it, `None` while undecided. Paused branches count as
/// able to complete later.
pub fn policy_outcome(statuses: &[StageStatus], policy: SuccessPolicy) -> Option<bool> {
    let total = statuses.len();
    let completed = statuses
        .iter()
        .filter(|s| **s == StageStatus::Completed)
        .count();
    let lost = statuses
        .iter()
        .filter(|s| matches!(s, StageStatus::Failed | StageStatus::Cancelled))
        .count();

    match policy {
        SuccessPolicy::All if completed == total => Some(true),
        SuccessPolicy::All if lost > 0 => Some(false),
        SuccessPolicy::Any if completed > 0 => Some(true),
        SuccessPolicy::Any if lost == total => Some(false),
        _ => None,
    }
}

/// Derive a parallel stage's status from its branches.
///
/// Paused wins over everything once no branch is running, so a paused
/// branch is never silently dropped. Otherwise the policy decides.
pub fn derive_parallel_status(statuses: &[StageStatus], policy: SuccessPolicy) -> ParallelStatus {
    if statuses.iter().copied().any(is_running) {
        return ParallelStatus::Running;
    }
    if statuses.contains(&StageStatus::Paused) {
        return ParallelStatus::Paused;
    }
    match policy_outcome(statuses, policy) {
        Some(true) => ParallelStatus::Completed,
        _ => ParallelStatus::Failed,
    }
}

/// One failed (or cancelled) stage for the session error message.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage_name: String,
    pub agent: String,
    pub message: Option<String>,
}

impl StageFailure {
    /// Failure record for a stage execution
    pub fn from_execution(execution: &StageExecution) -> Self {
        Self {
            stage_name: execution.stage_name.clone(),
            agent: execution.agent.clone(),
            message: execution.error_message.clone(),
        }
    }
}

/// `Stage '<stage>' (agent: <agent>): <message>`
pub fn format_stage_failure(stage_name: &str, agent: &str, message: Option<&str>) -> String {
    let message = match message.map(str::trim) {
        Some(m) if !m.is_empty() => m,
        _ => "Failed with no error message",
    };
    format!("Stage '{}' (agent: {}): {}", stage_name, agent, message)
}

/// Combine failures into one session error message.
///
/// A single failure renders on its own line; several render as a numbered
/// list under a count header.
pub fn aggregate_branch_failures(failures: &[StageFailure]) -> String {
    let line = |f: &StageFailure| format_stage_failure(&f.stage_name, &f.agent, f.message.as_deref());

    match failures {
        [] => "Failed with no error message".to_string(),
        [single] => line(single),
        many => {
            let mut message = format!(
                "Chain processing failed with {} stage failures:",
                many.len()
            );
            for (i, failure) in many.iter().enumerate() {
                message.push_str(&format!("\n{}. {}", i + 1, line(failure)));
            }
            message
        }
    }
}
