use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::parallel::ParallelExecutionCoordinator;
use super::plan::{ExecutionPlan, PlannedStage};
use super::runner::{AgentStageRunner, RunOverrides, StagePrompt, StageRunOutcome};
use super::status::{format_stage_failure, ParallelStatus};
use super::synthesis::SynthesisRunner;
use super::{ChainContext, ChainDefinition, SYNTHESIS_AGENT};
use crate::error::{EngineError, EngineResult};
use crate::prompts::{investigation_task, INVESTIGATION_SYSTEM_PROMPT};
use crate::storage::{PauseMetadata, SessionStatus, StageExecution, StageKind, StageStatus};

/// Outcome of one pass over a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainExecutionResult {
    /// `Completed`, `Paused` or `Failed`. Cancellation is returned as an error.
    pub status: SessionStatus,
    pub final_analysis: Option<String>,
    pub error: Option<String>,
    pub pause_metadata: Option<PauseMetadata>,
}

impl ChainExecutionResult {
    fn completed(final_analysis: Option<String>) -> Self {
        Self {
            status: SessionStatus::Completed,
            final_analysis,
            error: None,
            pause_metadata: None,
        }
    }

    fn paused(metadata: PauseMetadata) -> Self {
        Self {
            status: SessionStatus::Paused,
            final_analysis: None,
            error: None,
            pause_metadata: Some(metadata),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            status: SessionStatus::Failed,
            final_analysis: None,
            error: Some(error),
            pause_metadata: None,
        }
    }
}

/// Walks a chain's execution plan stage by stage.
///
/// Stage executions already recorded for the session are picked up: completed
/// ones feed their output into the context and are skipped, paused ones are
/// resumed in place. The chain stops at the first failed or paused stage.
#[derive(Clone)]
pub struct ChainExecutor {
    runner: AgentStageRunner,
    parallel: ParallelExecutionCoordinator,
    synthesis: SynthesisRunner,
}

impl ChainExecutor {
    /// Create a new executor
    pub fn new(
        runner: AgentStageRunner,
        parallel: ParallelExecutionCoordinator,
        synthesis: SynthesisRunner,
    ) -> Self {
        Self {
            runner,
            parallel,
            synthesis,
        }
    }

    /// Execute (or continue) `chain` for the session in `context`.
    pub async fn execute(
        &self,
        chain: &ChainDefinition,
        context: &mut ChainContext,
        overrides: &RunOverrides,
        cancel: &CancellationToken,
    ) -> EngineResult<ChainExecutionResult> {
        let storage = self.runner.storage().clone();
        let plan = ExecutionPlan::from_chain(chain);

        let mut recorded: HashMap<i64, StageExecution> = storage
            .get_session_stage_executions(&context.session_id)
            .await?
            .into_iter()
            .filter(|e| !e.is_branch() && e.chat_id.is_none())
            .map(|e| (e.stage_index, e))
            .collect();

        info!(
            session_id = %context.session_id,
            chain_id = %chain.chain_id,
            stages = plan.len(),
            recorded = recorded.len(),
            "Chain execution started"
        );

        for planned in &plan.stages {
            let mut execution = match recorded.remove(&planned.stage_index()) {
                Some(existing) => existing,
                None => {
                    let execution = new_execution(&context.session_id, planned);
                    storage.create_stage_execution(&execution).await?;
                    execution
                }
            };

            match execution.status {
                StageStatus::Completed => {
                    if !matches!(planned, PlannedStage::Parallel { .. }) {
                        context.add_output(
                            planned.name(),
                            execution.agent.clone(),
                            execution.stage_output.clone().unwrap_or_default(),
                        );
                    }
                    continue;
                }
                StageStatus::Failed | StageStatus::Cancelled => {
                    return Err(EngineError::InvalidState {
                        message: format!(
                            "stage '{}' is already {}",
                            execution.stage_name, execution.status
                        ),
                    });
                }
                _ => {}
            }

            if cancel.is_cancelled() {
                return Err(EngineError::cancelled_by_user());
            }

            match planned {
                PlannedStage::Single { name, agent, .. } => {
                    let prompt =
                        StagePrompt::new(INVESTIGATION_SYSTEM_PROMPT, investigation_task(context, name));
                    match self
                        .runner
                        .run(&mut execution, agent, &prompt, overrides, cancel)
                        .await?
                    {
                        StageRunOutcome::Completed { analysis } => {
                            context.add_output(name.clone(), agent.name.clone(), analysis);
                        }
                        StageRunOutcome::Paused(metadata) => {
                            return Ok(self.pause(context, name, metadata));
                        }
                        StageRunOutcome::Failed { error } => {
                            return Ok(self.fail(
                                context,
                                format_stage_failure(name, &agent.name, Some(&error)),
                            ));
                        }
                    }
                }
                PlannedStage::Parallel {
                    name,
                    group,
                    policy,
                    ..
                } => {
                    let result = self
                        .parallel
                        .run(&mut execution, group, *policy, context, overrides, cancel)
                        .await?;
                    match result.status {
                        ParallelStatus::Completed => {}
                        ParallelStatus::Paused => {
                            let metadata = result
                                .pause_metadata
                                .unwrap_or_else(|| PauseMetadata::max_iterations(0));
                            return Ok(self.pause(context, name, metadata));
                        }
                        _ => {
                            let error = result.error.unwrap_or_else(|| {
                                format_stage_failure(name, &group.display_name(), None)
                            });
                            return Ok(self.fail(context, error));
                        }
                    }
                }
                PlannedStage::Synthesis {
                    name,
                    source_stage,
                    instructions,
                    stage_index,
                } => {
                    let branches = self
                        .source_branches(&context.session_id, *stage_index - 1)
                        .await?;
                    let outcome = self
                        .synthesis
                        .run(
                            &mut execution,
                            source_stage,
                            &branches,
                            instructions.as_deref(),
                            context,
                            cancel,
                        )
                        .await?;
                    match outcome {
                        StageRunOutcome::Completed { analysis } => {
                            context.add_output(name.clone(), SYNTHESIS_AGENT, analysis);
                        }
                        StageRunOutcome::Failed { error } => {
                            return Ok(self.fail(
                                context,
                                format_stage_failure(name, SYNTHESIS_AGENT, Some(&error)),
                            ));
                        }
                        StageRunOutcome::Paused(metadata) => {
                            return Ok(self.pause(context, name, metadata));
                        }
                    }
                }
            }
        }

        info!(
            session_id = %context.session_id,
            chain_id = %chain.chain_id,
            "Chain execution completed"
        );
        Ok(ChainExecutionResult::completed(
            context.latest_analysis().map(str::to_string),
        ))
    }

    async fn source_branches(
        &self,
        session_id: &str,
        stage_index: i64,
    ) -> EngineResult<Vec<StageExecution>> {
        let storage = self.runner.storage();
        let parent = storage
            .get_session_stage_executions(session_id)
            .await?
            .into_iter()
            .find(|e| e.stage_index == stage_index && !e.is_branch() && e.chat_id.is_none())
            .ok_or_else(|| EngineError::InvalidState {
                message: format!("no parallel stage at index {}", stage_index),
            })?;
        Ok(storage.get_child_executions(&parent.execution_id).await?)
    }

    fn pause(
        &self,
        context: &ChainContext,
        stage: &str,
        metadata: PauseMetadata,
    ) -> ChainExecutionResult {
        info!(
            session_id = %context.session_id,
            stage = %stage,
            iteration = metadata.current_iteration,
            "Chain paused"
        );
        ChainExecutionResult::paused(metadata)
    }

    fn fail(&self, context: &ChainContext, error: String) -> ChainExecutionResult {
        warn!(
            session_id = %context.session_id,
            error = %error,
            "Chain stopped at failed stage"
        );
        ChainExecutionResult::failed(error)
    }
}

fn new_execution(session_id: &str, planned: &PlannedStage) -> StageExecution {
    match planned {
        PlannedStage::Single {
            stage_index,
            name,
            agent,
        } => StageExecution::new(
            session_id,
            *stage_index,
            name.clone(),
            agent.name.clone(),
            StageKind::Single,
        )
        .with_strategy(agent.iteration_strategy),
        PlannedStage::Parallel {
            stage_index,
            name,
            group,
            policy,
        } => StageExecution::new(
            session_id,
            *stage_index,
            name.clone(),
            group.display_name(),
            StageKind::Parallel,
        )
        .with_parallel(group.parallel_type(), *policy),
        PlannedStage::Synthesis {
            stage_index, name, ..
        } => StageExecution::new(
            session_id,
            *stage_index,
            name.clone(),
            SYNTHESIS_AGENT,
            StageKind::Synthesis,
        ),
    }
}
