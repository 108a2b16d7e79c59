use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runner::StageRunOutcome;
use super::ChainContext;
use crate::agent::single_shot;
use crate::config::RequestConfig;
use crate::error::{EngineError, EngineResult};
use crate::history::{InteractionLog, InteractionType};
use crate::llm::{LlmClient, Message};
use crate::prompts::SYNTHESIS_PROMPT;
use crate::storage::{StageExecution, StageStatus, Storage};

/// Merges the branch results of a parallel stage with one tool-free call.
#[derive(Clone)]
pub struct SynthesisRunner {
    storage: Arc<dyn Storage>,
    llm: Arc<dyn LlmClient>,
    request: RequestConfig,
}

impl SynthesisRunner {
    /// Create a new synthesis runner
    pub fn new(storage: Arc<dyn Storage>, llm: Arc<dyn LlmClient>, request: RequestConfig) -> Self {
        Self {
            storage,
            llm,
            request,
        }
    }

    /// Run synthesis for `execution` over `branches`.
    ///
    /// Exactly one `final_analysis` interaction is recorded. Branches that did
    /// not complete appear with an explicit marker instead of an analysis.
    pub async fn run(
        &self,
        execution: &mut StageExecution,
        source_stage: &str,
        branches: &[StageExecution],
        instructions: Option<&str>,
        context: &ChainContext,
        cancel: &CancellationToken,
    ) -> EngineResult<StageRunOutcome> {
        execution.mark_active();
        self.storage.update_stage_execution(execution).await?;

        info!(
            session_id = %execution.session_id,
            stage = %execution.stage_name,
            branches = branches.len(),
            "Synthesis started"
        );

        let mut system = SYNTHESIS_PROMPT.to_string();
        if let Some(extra) = instructions.filter(|s| !s.trim().is_empty()) {
            system.push_str("\n\n## Additional Instructions\n");
            system.push_str(extra.trim());
        }
        let messages = vec![
            Message::system(system),
            Message::user(synthesis_input(context, source_stage, branches)),
        ];

        let log = InteractionLog::open(
            self.storage.clone(),
            execution.session_id.clone(),
            Some(execution.execution_id.clone()),
        )
        .await?;

        let result = single_shot(
            self.llm.as_ref(),
            &self.request,
            messages,
            InteractionType::FinalAnalysis,
            &log,
            cancel,
        )
        .await;

        let outcome = match result {
            Ok(response) => {
                let analysis = response.text.trim().to_string();
                execution.mark_completed(Some(analysis.clone()));
                StageRunOutcome::Completed { analysis }
            }
            Err(EngineError::Llm(e)) => {
                warn!(
                    session_id = %execution.session_id,
                    stage = %execution.stage_name,
                    error = %e,
                    "Synthesis failed"
                );
                let error = format!("LLM call failed: {}", e);
                execution.mark_failed(error.clone());
                StageRunOutcome::Failed { error }
            }
            Err(e) if e.is_cancelled() => {
                execution.mark_cancelled(crate::CANCELLED_BY_USER);
                self.storage.update_stage_execution(execution).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.storage.update_stage_execution(execution).await?;
        info!(
            session_id = %execution.session_id,
            stage = %execution.stage_name,
            status = %execution.status,
            "Synthesis finished"
        );
        Ok(outcome)
    }
}

fn synthesis_input(context: &ChainContext, source_stage: &str, branches: &[StageExecution]) -> String {
    let mut input = format!(
        "## Alert\nType: {}\n```json\n{}\n```\n\n## Parallel results of stage '{}'\n",
        context.alert.alert_type,
        serde_json::to_string_pretty(&context.alert.data).unwrap_or_default(),
        source_stage
    );

    for branch in branches {
        let body = match branch.status {
            StageStatus::Completed => branch.stage_output.clone().unwrap_or_default(),
            StageStatus::Cancelled => "[cancelled by user]".to_string(),
            StageStatus::Failed => format!(
                "[failed] {}",
                branch.error_message.as_deref().unwrap_or("no error message")
            ),
            other => format!("[{}]", other),
        };
        input.push_str(&format!("\n### {} ({})\n{}\n", branch.agent, branch.status, body));
    }

    input.push_str("\nMerge these results into one analysis.");
    input
}
