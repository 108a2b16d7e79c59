//! Shared application state.

use std::sync::Arc;

use crate::chain::AgentStageRunner;
use crate::chat::ChatService;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::session::InvestigationService;
use crate::storage::Storage;
use crate::tools::ToolServerFactory;

/// Application state shared by every entry point.
///
/// The investigation and chat services share one stage runner, so they use
/// the same storage, LLM client and tool servers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Session store.
    pub storage: Arc<dyn Storage>,
    /// Alert investigations.
    pub service: InvestigationService,
    /// Follow-up chats.
    pub chat: ChatService,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolServerFactory>,
    ) -> Self {
        let runner = AgentStageRunner::new(
            storage.clone(),
            llm,
            tools,
            config.engine.clone(),
            config.request.clone(),
        )
        .with_max_output_tokens(config.llm.max_output_tokens);

        tracing::debug!(
            max_iterations = config.engine.max_iterations,
            force_conclusion = config.engine.force_conclusion,
            summarization = config.engine.summarization.enabled,
            tool_servers = config.tool_servers.len(),
            "Application state initialized"
        );

        Self {
            service: InvestigationService::with_runner(runner.clone()),
            chat: ChatService::new(runner),
            storage,
            config,
        }
    }
}

/// Shared state handle
pub type SharedState = Arc<AppState>;
