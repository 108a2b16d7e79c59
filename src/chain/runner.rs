use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::AgentSpec;
use crate::agent::{AgentController, AgentOutcome, AgentRunConfig};
use crate::config::{EngineConfig, RequestConfig};
use crate::error::{EngineError, EngineResult};
use crate::history::InteractionLog;
use crate::llm::{Conversation, LlmClient, Message};
use crate::storage::{PauseMetadata, StageExecution, StageStatus, Storage};
use crate::tools::{ToolInvocationClient, ToolServerFactory};

/// Per-run overrides of the agent iteration budget.
///
/// Supplied on resume and by chat; unset fields fall back to the agent's
/// own settings, then to the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub max_iterations: Option<u32>,
    pub force_conclusion: Option<bool>,
}

/// Opening messages for a fresh agent run.
#[derive(Debug, Clone)]
pub struct StagePrompt {
    /// Base system prompt; the strategy adds instructions and format rules.
    pub base: String,
    /// First user message.
    pub task: String,
}

impl StagePrompt {
    /// Create a new prompt
    pub fn new(base: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            task: task.into(),
        }
    }
}

/// How a stage execution ended, short of cancellation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageRunOutcome {
    Completed { analysis: String },
    Paused(PauseMetadata),
    Failed { error: String },
}

/// Runs one agent for one stage execution and persists the result.
///
/// Cloning is cheap; parallel branches each get a clone and build their own
/// tool client and interaction log.
#[derive(Clone)]
pub struct AgentStageRunner {
    storage: Arc<dyn Storage>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolServerFactory>,
    engine: EngineConfig,
    request: RequestConfig,
    max_output_tokens: Option<u32>,
}

impl AgentStageRunner {
    /// Create a new runner
    pub fn new(
        storage: Arc<dyn Storage>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolServerFactory>,
        engine: EngineConfig,
        request: RequestConfig,
    ) -> Self {
        Self {
            storage,
            llm,
            tools,
            engine,
            request,
            max_output_tokens: None,
        }
    }

    /// Cap output tokens of every agent call
    pub fn with_max_output_tokens(mut self, max: Option<u32>) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// Storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// LLM client
    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// Retry settings for LLM calls
    pub fn request_config(&self) -> &RequestConfig {
        &self.request
    }

    /// Engine defaults
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Effective iteration budget for `agent`
    pub fn run_config(&self, agent: &AgentSpec, overrides: &RunOverrides) -> AgentRunConfig {
        AgentRunConfig {
            max_iterations: overrides
                .max_iterations
                .or(agent.max_iterations)
                .unwrap_or(self.engine.max_iterations),
            force_conclusion: overrides
                .force_conclusion
                .or(agent.force_conclusion)
                .unwrap_or(self.engine.force_conclusion),
        }
    }

    /// Run `agent` for `execution`.
    ///
    /// A paused execution resumes from its stored conversation (or, when
    /// that is missing, the snapshot of its last LLM interaction) with a
    /// fresh iteration budget; anything else starts from `prompt`. The
    /// execution record is updated in place and persisted. Cancellation marks
    /// the execution cancelled and is returned as an error.
    pub async fn run(
        &self,
        execution: &mut StageExecution,
        agent: &AgentSpec,
        prompt: &StagePrompt,
        overrides: &RunOverrides,
        cancel: &CancellationToken,
    ) -> EngineResult<StageRunOutcome> {
        let resuming = execution.status == StageStatus::Paused;
        let stored = execution.conversation.take().filter(|_| resuming);

        execution.mark_active();
        execution.iteration_strategy = Some(agent.iteration_strategy);
        self.storage.update_stage_execution(execution).await?;

        let config = self.run_config(agent, overrides);
        info!(
            session_id = %execution.session_id,
            stage = %execution.stage_name,
            agent = %execution.agent,
            execution_id = %execution.execution_id,
            resuming,
            max_iterations = config.max_iterations,
            force_conclusion = config.force_conclusion,
            "Stage execution started"
        );

        let log = InteractionLog::open(
            self.storage.clone(),
            execution.session_id.clone(),
            Some(execution.execution_id.clone()),
        )
        .await?;
        let mut tools = ToolInvocationClient::new(self.tools.clone(), agent.mcp_servers.clone())
            .with_timeout(Duration::from_millis(self.request.timeout_ms));

        let result = self
            .drive(agent, prompt, stored, resuming, &mut tools, &log, config, cancel)
            .await;
        tools.close().await;

        match result {
            Ok(outcome) => self.finish(execution, outcome).await,
            Err(e) if e.is_cancelled() => {
                let reason = match &e {
                    EngineError::Cancelled { reason } => reason.clone(),
                    _ => crate::CANCELLED_BY_USER.to_string(),
                };
                execution.mark_cancelled(reason);
                self.storage.update_stage_execution(execution).await?;
                info!(
                    session_id = %execution.session_id,
                    stage = %execution.stage_name,
                    execution_id = %execution.execution_id,
                    "Stage execution cancelled"
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    session_id = %execution.session_id,
                    stage = %execution.stage_name,
                    error = %e,
                    "Stage execution aborted"
                );
                execution.mark_failed(e.to_string());
                if let Err(update) = self.storage.update_stage_execution(execution).await {
                    warn!(error = %update, "Failed to record stage failure");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        agent: &AgentSpec,
        prompt: &StagePrompt,
        stored: Option<Conversation>,
        resuming: bool,
        tools: &mut ToolInvocationClient,
        log: &InteractionLog,
        config: AgentRunConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<AgentOutcome> {
        tools.initialize(log).await?;

        let controller = AgentController::new(
            self.llm.clone(),
            agent.iteration_strategy.strategy(),
            self.request.clone(),
        )
        .with_summarization(self.engine.summarization.clone())
        .with_max_output_tokens(self.max_output_tokens);

        let restored = match (resuming, stored) {
            (true, Some(conversation)) => Some(conversation),
            (true, None) => log.last_conversation().await?,
            (false, _) => None,
        };

        let conversation = match restored {
            Some(conversation) => conversation,
            None => {
                if resuming {
                    warn!(
                        session_id = %log.session_id(),
                        "No conversation to resume from, starting over"
                    );
                }
                vec![
                    Message::system(controller.strategy().system_prompt(
                        &prompt.base,
                        &agent.instructions,
                        tools.catalog(),
                    )),
                    Message::user(prompt.task.clone()),
                ]
            }
        };

        controller.run(conversation, tools, log, config, cancel).await
    }

    async fn finish(
        &self,
        execution: &mut StageExecution,
        outcome: AgentOutcome,
    ) -> EngineResult<StageRunOutcome> {
        let result = match outcome {
            AgentOutcome::FinalAnswer {
                analysis,
                iterations,
            }
            | AgentOutcome::ForcedConclusion {
                analysis,
                iterations,
            } => {
                execution.current_iteration = iterations;
                execution.mark_completed(Some(analysis.clone()));
                StageRunOutcome::Completed { analysis }
            }
            AgentOutcome::Paused {
                metadata,
                conversation,
            } => {
                execution.mark_paused(metadata.clone(), Some(conversation));
                StageRunOutcome::Paused(metadata)
            }
            AgentOutcome::Failed { error, iterations } => {
                execution.current_iteration = iterations;
                execution.mark_failed(error.clone());
                StageRunOutcome::Failed { error }
            }
        };
        self.storage.update_stage_execution(execution).await?;

        info!(
            session_id = %execution.session_id,
            stage = %execution.stage_name,
            execution_id = %execution.execution_id,
            status = %execution.status,
            iterations = execution.current_iteration,
            "Stage execution finished"
        );
        Ok(result)
    }
}
