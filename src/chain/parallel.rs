use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runner::{AgentStageRunner, RunOverrides, StagePrompt};
use super::status::{
    aggregate_branch_failures, derive_parallel_status, policy_outcome, ParallelStatus, StageFailure,
};
use super::{ChainContext, ParallelGroup, SuccessPolicy};
use crate::error::{EngineError, EngineResult};
use crate::prompts::{investigation_task, INVESTIGATION_SYSTEM_PROMPT};
use crate::session::CancellationManager;
use crate::storage::{PauseMetadata, StageExecution, StageKind, StageStatus};

/// Reason recorded on branches cancelled because their result no longer matters.
pub const STRAGGLER_CANCEL_REASON: &str = "Cancelled: parallel stage outcome already decided";

/// Result of running (or resuming) a parallel stage.
#[derive(Debug, Clone)]
pub struct ParallelStageResult {
    pub status: ParallelStatus,
    /// Branch executions ordered by parallel index.
    pub branches: Vec<StageExecution>,
    pub pause_metadata: Option<PauseMetadata>,
    /// Aggregated failure message when the stage failed.
    pub error: Option<String>,
}

/// Fans a parallel stage out to its branches and folds the results back in.
///
/// Each branch runs its own agent with its own tool client and interaction
/// log under a child cancellation token, so cancelling one branch leaves its
/// siblings running while cancelling the session stops them all.
#[derive(Clone)]
pub struct ParallelExecutionCoordinator {
    runner: AgentStageRunner,
    cancellations: CancellationManager,
}

impl ParallelExecutionCoordinator {
    /// Create a new coordinator
    pub fn new(runner: AgentStageRunner, cancellations: CancellationManager) -> Self {
        Self {
            runner,
            cancellations,
        }
    }

    /// Run the branches of `parent`.
    ///
    /// On first run the branch executions are created. On resume only
    /// branches that are still pending or paused run again; finished
    /// branches are reused as recorded.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        parent: &mut StageExecution,
        group: &ParallelGroup,
        policy: SuccessPolicy,
        context: &ChainContext,
        overrides: &RunOverrides,
        cancel: &CancellationToken,
    ) -> EngineResult<ParallelStageResult> {
        let storage = self.runner.storage().clone();
        let specs = group.branches();

        let mut children = storage.get_child_executions(&parent.execution_id).await?;
        if children.is_empty() {
            for spec in &specs {
                let child = StageExecution::new(
                    parent.session_id.clone(),
                    parent.stage_index,
                    parent.stage_name.clone(),
                    spec.name.clone(),
                    StageKind::Branch,
                )
                .with_parent(
                    parent.execution_id.clone(),
                    spec.index as i64,
                    group.parallel_type(),
                )
                .with_strategy(spec.agent.iteration_strategy);
                storage.create_stage_execution(&child).await?;
                children.push(child);
            }
        }

        parent.mark_active();
        storage.update_stage_execution(parent).await?;

        let prompt = StagePrompt::new(
            INVESTIGATION_SYSTEM_PROMPT,
            investigation_task(context, &parent.stage_name),
        );

        let mut statuses: Vec<StageStatus> = children.iter().map(|c| c.status).collect();
        let mut can_pause: HashMap<usize, bool> = HashMap::new();
        let mut tokens: HashMap<usize, CancellationToken> = HashMap::new();
        let mut running = FuturesUnordered::new();

        for (slot, child) in children.iter().enumerate() {
            if !matches!(child.status, StageStatus::Pending | StageStatus::Paused) {
                continue;
            }
            let Some(spec) = specs
                .iter()
                .find(|s| s.index as i64 == child.parallel_index)
            else {
                warn!(
                    execution_id = %child.execution_id,
                    parallel_index = child.parallel_index,
                    "Branch has no matching agent in the chain definition"
                );
                continue;
            };

            let token = self
                .cancellations
                .register_child(&child.execution_id, cancel)
                .await;
            let config = self.runner.run_config(&spec.agent, overrides);
            can_pause.insert(slot, !config.force_conclusion);
            tokens.insert(slot, token.clone());
            statuses[slot] = StageStatus::Active;

            let runner = self.runner.clone();
            let mut child = child.clone();
            let agent = spec.agent.clone();
            let prompt = prompt.clone();
            let overrides = *overrides;
            running.push(async move {
                let result = runner
                    .run(&mut child, &agent, &prompt, &overrides, &token)
                    .await;
                (slot, child, result)
            });
        }

        info!(
            session_id = %parent.session_id,
            stage = %parent.stage_name,
            branches = children.len(),
            running = running.len(),
            policy = %policy.as_str(),
            "Parallel stage started"
        );

        let mut straggling: HashSet<usize> = HashSet::new();
        while let Some((slot, mut child, result)) = running.next().await {
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    warn!(
                        session_id = %child.session_id,
                        agent = %child.agent,
                        error = %e,
                        "Branch aborted"
                    );
                    if !child.status.is_terminal() {
                        child.mark_failed(e.to_string());
                    }
                }
            }
            self.cancellations.unregister(&child.execution_id).await;
            statuses[slot] = child.status;
            children[slot] = child;

            if cancel.is_cancelled() || !straggling.is_empty() {
                continue;
            }
            if policy_outcome(&statuses, policy).is_some() {
                let active: Vec<usize> = statuses
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| **s == StageStatus::Active)
                    .map(|(i, _)| i)
                    .collect();
                let none_can_pause = active
                    .iter()
                    .all(|i| !can_pause.get(i).copied().unwrap_or(true));
                if !active.is_empty() && none_can_pause {
                    for i in active {
                        if let Some(token) = tokens.get(&i) {
                            token.cancel();
                        }
                        straggling.insert(i);
                    }
                    info!(
                        session_id = %parent.session_id,
                        stage = %parent.stage_name,
                        stragglers = straggling.len(),
                        "Parallel outcome decided, cancelling remaining branches"
                    );
                }
            }
        }

        if cancel.is_cancelled() {
            parent.mark_cancelled(crate::CANCELLED_BY_USER);
            storage.update_stage_execution(parent).await?;
            return Err(EngineError::cancelled_by_user());
        }

        for slot in straggling {
            let child = &mut children[slot];
            if child.status == StageStatus::Cancelled {
                child.error_message = Some(STRAGGLER_CANCEL_REASON.to_string());
                storage.update_stage_execution(child).await?;
            }
        }

        // A paused branch has no token, so it can be cancelled in storage
        // while its siblings are still running.
        if statuses.contains(&StageStatus::Paused) {
            let stored = storage.get_child_executions(&parent.execution_id).await?;
            for (slot, child) in children.iter_mut().enumerate() {
                if child.status != StageStatus::Paused {
                    continue;
                }
                if let Some(fresh) = stored
                    .iter()
                    .find(|s| s.execution_id == child.execution_id)
                {
                    *child = fresh.clone();
                    statuses[slot] = child.status;
                }
            }
        }

        let status = derive_parallel_status(&statuses, policy);
        let mut result = ParallelStageResult {
            status,
            branches: Vec::new(),
            pause_metadata: None,
            error: None,
        };

        match status {
            ParallelStatus::Completed => parent.mark_completed(None),
            ParallelStatus::Paused => {
                let metadata = children
                    .iter()
                    .filter(|c| c.status == StageStatus::Paused)
                    .find_map(|c| c.pause_metadata.clone())
                    .unwrap_or_else(|| PauseMetadata::max_iterations(0));
                parent.mark_paused(metadata.clone(), None);
                result.pause_metadata = Some(metadata);
            }
            ParallelStatus::Failed => {
                let failures: Vec<StageFailure> = children
                    .iter()
                    .filter(|c| c.status != StageStatus::Completed)
                    .map(StageFailure::from_execution)
                    .collect();
                let message = aggregate_branch_failures(&failures);
                parent.mark_failed(message.clone());
                result.error = Some(message);
            }
            ParallelStatus::Running => {
                return Err(EngineError::InvalidState {
                    message: format!(
                        "parallel stage '{}' finished with branches still running",
                        parent.stage_name
                    ),
                });
            }
        }
        storage.update_stage_execution(parent).await?;

        info!(
            session_id = %parent.session_id,
            stage = %parent.stage_name,
            status = %parent.status,
            "Parallel stage finished"
        );

        result.branches = children;
        Ok(result)
    }
}
