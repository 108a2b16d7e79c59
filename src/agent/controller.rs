use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::{Interpretation, IterationStrategy, ToolObservation};
use super::summarizer::ToolResultSummarizer;
use crate::config::{RequestConfig, SummarizationPolicy};
use crate::error::{EngineError, EngineResult};
use crate::history::{InteractionLog, InteractionType};
use crate::llm::{
    call_with_retry, Conversation, LlmCallContext, LlmClient, LlmRequest, LlmResponse, Message,
    ToolSchema,
};
use crate::prompts::FORCED_CONCLUSION_PROMPT;
use crate::storage::PauseMetadata;
use crate::tools::{ToolInvocationClient, ToolOutcome};

/// Budget for one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentRunConfig {
    pub max_iterations: u32,
    /// At the limit, make one tool-free call for a final answer instead of
    /// pausing.
    pub force_conclusion: bool,
}

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    FinalAnswer {
        analysis: String,
        iterations: u32,
    },
    ForcedConclusion {
        analysis: String,
        iterations: u32,
    },
    /// Budget exhausted without an answer; `conversation` is what a resume
    /// continues from.
    Paused {
        metadata: PauseMetadata,
        conversation: Conversation,
    },
    Failed {
        error: String,
        iterations: u32,
    },
}

impl AgentOutcome {
    /// Analysis text for completed outcomes
    pub fn analysis(&self) -> Option<&str> {
        match self {
            AgentOutcome::FinalAnswer { analysis, .. }
            | AgentOutcome::ForcedConclusion { analysis, .. } => Some(analysis),
            _ => None,
        }
    }
}

/// Drives one agent through its iteration loop.
///
/// The counter starts at zero on every call to [`AgentController::run`], so a
/// resumed run gets a fresh budget. An iteration is one LLM round-trip that
/// produced a usable response; retried transient failures do not count.
pub struct AgentController {
    llm: Arc<dyn LlmClient>,
    strategy: Arc<dyn IterationStrategy>,
    retry: RequestConfig,
    summarizer: Option<ToolResultSummarizer>,
    max_output_tokens: Option<u32>,
}

fn checkpoint(cancel: &CancellationToken) -> EngineResult<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::cancelled_by_user());
    }
    Ok(())
}

impl AgentController {
    /// Create a new controller
    pub fn new(
        llm: Arc<dyn LlmClient>,
        strategy: Arc<dyn IterationStrategy>,
        retry: RequestConfig,
    ) -> Self {
        Self {
            llm,
            strategy,
            retry,
            summarizer: None,
            max_output_tokens: None,
        }
    }

    /// Summarize oversized tool results according to `policy`
    pub fn with_summarization(mut self, policy: SummarizationPolicy) -> Self {
        if policy.enabled {
            self.summarizer = Some(ToolResultSummarizer::new(
                self.llm.clone(),
                policy,
                self.retry.clone(),
            ));
        }
        self
    }

    /// Cap output tokens of every call
    pub fn with_max_output_tokens(mut self, max: Option<u32>) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// The strategy in use
    pub fn strategy(&self) -> &dyn IterationStrategy {
        self.strategy.as_ref()
    }

    /// Run the agent until it answers, pauses, concludes or fails.
    ///
    /// Cancellation is observed before every LLM call and every tool call and
    /// surfaces as [`EngineError::Cancelled`].
    pub async fn run(
        &self,
        conversation: Conversation,
        tools: &mut ToolInvocationClient,
        log: &InteractionLog,
        config: AgentRunConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<AgentOutcome> {
        let mut conversation = conversation;
        let schemas = self.strategy.tool_schemas(tools.catalog());
        let mut iteration: u32 = 0;

        info!(
            session_id = %log.session_id(),
            stage_execution_id = ?log.stage_execution_id(),
            strategy = %self.strategy.kind(),
            max_iterations = config.max_iterations,
            "Agent run started"
        );

        while iteration < config.max_iterations {
            checkpoint(cancel)?;

            let start = Instant::now();
            let request = self.request(
                &conversation,
                schemas.clone(),
                InteractionType::Investigation,
                log,
            );
            let response = match call_with_retry(self.llm.as_ref(), &request, &self.retry, cancel)
                .await
            {
                Ok(response) => response,
                Err(EngineError::Llm(e)) => {
                    log.record_llm_failure(
                        InteractionType::Investigation,
                        conversation,
                        e.to_string(),
                        start.elapsed().as_millis() as i64,
                    )
                    .await?;
                    warn!(
                        session_id = %log.session_id(),
                        iteration = iteration + 1,
                        error = %e,
                        "Agent LLM call failed"
                    );
                    return Ok(AgentOutcome::Failed {
                        error: format!("LLM call failed: {}", e),
                        iterations: iteration,
                    });
                }
                Err(e) => return Err(e),
            };

            iteration += 1;
            let interpretation = self.strategy.interpret(&response);
            conversation.push(self.strategy.assistant_message(&response));
            log.record_llm(
                InteractionType::Investigation,
                conversation.clone(),
                &response,
                start.elapsed().as_millis() as i64,
            )
            .await?;
            log.record_iteration(iteration).await?;

            debug!(
                session_id = %log.session_id(),
                iteration,
                tokens = response.usage.total_tokens,
                "Agent iteration completed"
            );

            match interpretation {
                Interpretation::FinalAnswer(analysis) => {
                    info!(
                        session_id = %log.session_id(),
                        stage_execution_id = ?log.stage_execution_id(),
                        iterations = iteration,
                        "Agent reached final answer"
                    );
                    return Ok(AgentOutcome::FinalAnswer {
                        analysis,
                        iterations: iteration,
                    });
                }
                Interpretation::ToolCalls(requests) => {
                    let mut observations = Vec::with_capacity(requests.len());
                    for request in requests {
                        checkpoint(cancel)?;
                        let outcome = tools
                            .invoke(&request.server, &request.tool, request.arguments.clone(), log)
                            .await?;
                        let outcome = self.maybe_summarize(&request, outcome, log, cancel).await?;
                        observations.push(ToolObservation { request, outcome });
                    }
                    conversation.extend(self.strategy.observation_messages(&observations));
                }
                other => {
                    debug!(
                        session_id = %log.session_id(),
                        iteration,
                        interpretation = ?other,
                        "Response carried no action or answer"
                    );
                    conversation.push(self.strategy.continuation_message(&other));
                }
            }
        }

        if config.force_conclusion {
            return self.force_conclusion(conversation, log, cancel, iteration).await;
        }

        let metadata = PauseMetadata::max_iterations(iteration);
        info!(
            session_id = %log.session_id(),
            stage_execution_id = ?log.stage_execution_id(),
            iterations = iteration,
            "Agent paused at iteration limit"
        );
        Ok(AgentOutcome::Paused {
            metadata,
            conversation,
        })
    }

    async fn maybe_summarize(
        &self,
        request: &super::strategy::ToolRequest,
        outcome: ToolOutcome,
        log: &InteractionLog,
        cancel: &CancellationToken,
    ) -> EngineResult<ToolOutcome> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(outcome);
        };
        let summary = match &outcome {
            ToolOutcome::Success { content } if summarizer.should_summarize(content) => {
                checkpoint(cancel)?;
                summarizer.summarize(request, content, log, cancel).await?
            }
            _ => None,
        };
        Ok(match summary {
            Some(content) => ToolOutcome::Success { content },
            None => outcome,
        })
    }

    async fn force_conclusion(
        &self,
        mut conversation: Conversation,
        log: &InteractionLog,
        cancel: &CancellationToken,
        iterations: u32,
    ) -> EngineResult<AgentOutcome> {
        checkpoint(cancel)?;
        conversation.push(Message::user(FORCED_CONCLUSION_PROMPT));

        let start = Instant::now();
        let request = self.request(
            &conversation,
            Vec::new(),
            InteractionType::ForcedConclusion,
            log,
        );

        match call_with_retry(self.llm.as_ref(), &request, &self.retry, cancel).await {
            Ok(response) => {
                let analysis = self.strategy.conclusion(&response);
                conversation.push(Message::assistant(response.text.clone()));
                log.record_llm(
                    InteractionType::ForcedConclusion,
                    conversation,
                    &response,
                    start.elapsed().as_millis() as i64,
                )
                .await?;
                info!(
                    session_id = %log.session_id(),
                    stage_execution_id = ?log.stage_execution_id(),
                    iterations,
                    "Agent conclusion forced at iteration limit"
                );
                Ok(AgentOutcome::ForcedConclusion {
                    analysis,
                    iterations,
                })
            }
            Err(EngineError::Llm(e)) => {
                log.record_llm_failure(
                    InteractionType::ForcedConclusion,
                    conversation,
                    e.to_string(),
                    start.elapsed().as_millis() as i64,
                )
                .await?;
                Ok(AgentOutcome::Failed {
                    error: format!("Forced conclusion failed: {}", e),
                    iterations,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn request(
        &self,
        conversation: &Conversation,
        schemas: Vec<ToolSchema>,
        interaction_type: InteractionType,
        log: &InteractionLog,
    ) -> LlmRequest {
        LlmRequest::new(
            conversation.clone(),
            LlmCallContext {
                session_id: log.session_id().to_string(),
                stage_execution_id: log.stage_execution_id().map(str::to_string),
                interaction_type,
            },
        )
        .with_tools(schemas)
        .with_max_output_tokens(self.max_output_tokens)
    }
}

/// One tool-free LLM call, logged with the given interaction type.
///
/// Used for synthesis and executive summaries. LLM failures come back as
/// `Err(EngineError::Llm)` after being logged.
pub async fn single_shot(
    llm: &dyn LlmClient,
    retry: &RequestConfig,
    messages: Conversation,
    interaction_type: InteractionType,
    log: &InteractionLog,
    cancel: &CancellationToken,
) -> EngineResult<LlmResponse> {
    checkpoint(cancel)?;
    let request = LlmRequest::new(
        messages.clone(),
        LlmCallContext {
            session_id: log.session_id().to_string(),
            stage_execution_id: log.stage_execution_id().map(str::to_string),
            interaction_type,
        },
    );

    let start = Instant::now();
    match call_with_retry(llm, &request, retry, cancel).await {
        Ok(response) => {
            let mut conversation = messages;
            conversation.push(Message::assistant(response.text.clone()));
            log.record_llm(
                interaction_type,
                conversation,
                &response,
                start.elapsed().as_millis() as i64,
            )
            .await?;
            Ok(response)
        }
        Err(EngineError::Llm(e)) => {
            log.record_llm_failure(
                interaction_type,
                messages,
                e.to_string(),
                start.elapsed().as_millis() as i64,
            )
            .await?;
            Err(EngineError::Llm(e))
        }
        Err(e) => Err(e),
    }
}
