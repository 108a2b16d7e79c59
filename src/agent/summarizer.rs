use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::strategy::ToolRequest;
use crate::config::{RequestConfig, SummarizationPolicy};
use crate::error::{EngineError, EngineResult};
use crate::history::{InteractionLog, InteractionType};
use crate::llm::{call_with_retry, LlmCallContext, LlmClient, LlmRequest, Message};
use crate::prompts::SUMMARIZATION_PROMPT;

/// Replaces oversized tool results with an LLM-written summary.
pub struct ToolResultSummarizer {
    llm: Arc<dyn LlmClient>,
    policy: SummarizationPolicy,
    retry: RequestConfig,
}

impl ToolResultSummarizer {
    /// Create a new summarizer
    pub fn new(llm: Arc<dyn LlmClient>, policy: SummarizationPolicy, retry: RequestConfig) -> Self {
        Self { llm, policy, retry }
    }

    /// Whether `content` exceeds the configured threshold
    pub fn should_summarize(&self, content: &str) -> bool {
        self.policy.should_summarize(content)
    }

    /// Summarize one tool result with a tool-free LLM call.
    ///
    /// The call is logged as a `summarization` interaction. A failed call is
    /// logged and yields `None` so the raw result is kept; cancellation
    /// propagates.
    pub async fn summarize(
        &self,
        request: &ToolRequest,
        content: &str,
        log: &InteractionLog,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<String>> {
        let messages = vec![
            Message::system(SUMMARIZATION_PROMPT),
            Message::user(format!(
                "Tool: {}.{}\nParameters: {}\n\nOutput:\n{}",
                request.server, request.tool, request.arguments, content
            )),
        ];
        let llm_request = LlmRequest::new(
            messages.clone(),
            LlmCallContext {
                session_id: log.session_id().to_string(),
                stage_execution_id: log.stage_execution_id().map(str::to_string),
                interaction_type: InteractionType::Summarization,
            },
        )
        .with_max_output_tokens(Some(self.policy.summary_max_tokens));

        let start = Instant::now();
        match call_with_retry(self.llm.as_ref(), &llm_request, &self.retry, cancel).await {
            Ok(response) => {
                let mut conversation = messages;
                conversation.push(Message::assistant(response.text.clone()));
                log.record_llm(
                    InteractionType::Summarization,
                    conversation,
                    &response,
                    start.elapsed().as_millis() as i64,
                )
                .await?;

                info!(
                    session_id = %log.session_id(),
                    tool = %request.tool,
                    original = self.policy.measure(content),
                    summarized = self.policy.measure(&response.text),
                    "Tool result summarized"
                );
                Ok(Some(response.text))
            }
            Err(EngineError::Llm(e)) => {
                warn!(
                    session_id = %log.session_id(),
                    tool = %request.tool,
                    error = %e,
                    "Summarization failed, keeping raw tool result"
                );
                log.record_llm_failure(
                    InteractionType::Summarization,
                    messages,
                    e.to_string(),
                    start.elapsed().as_millis() as i64,
                )
                .await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
