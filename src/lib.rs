//! # Incident Engine
//!
//! An execution engine for automated incident investigations. An alert is
//! run through a chain of stages; each stage is worked by an LLM agent that
//! calls diagnostic tools on external tool servers until it can state its
//! analysis.
//!
//! ## Features
//!
//! - **Agent loop**: ReAct text protocol or native function calling, with a
//!   bounded iteration budget that either pauses or forces a conclusion
//! - **Parallel stages**: multi-agent and replica fan-out with `all`/`any`
//!   success policies and automatic synthesis
//! - **Pause/resume**: paused agents continue from their saved conversation
//! - **Cancellation**: per session or per parallel branch
//! - **Interaction history**: every LLM and tool call is recorded with token
//!   accounting
//! - **Follow-up chat** on finished investigations
//!
//! ## Architecture
//!
//! ```text
//! Alert → InvestigationService → ChainExecutor → AgentStageRunner → AgentController
//!                 ↓                                                   ↙        ↘
//!           SQLite (State)                                   LlmClient   Tool servers (stdio)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use incident_engine::{AppState, Config};
//! use incident_engine::llm::HttpLlmClient;
//! use incident_engine::storage::SqliteStorage;
//! use incident_engine::tools::StdioToolServerFactory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let llm = Arc::new(HttpLlmClient::new(&config.llm, config.request.clone())?);
//!     let tools = Arc::new(StdioToolServerFactory::new(config.tool_servers.clone()));
//!     let state = AppState::new(config, storage, llm, tools);
//!     let session_id = state.service.submit_alert(alert, chain).await?;
//!     let session = state.service.wait(&session_id).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Agent controller and iteration strategies.
pub mod agent;
/// Chain definitions and stage execution.
pub mod chain;
/// Follow-up chat on finished sessions.
pub mod chat;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Interaction history.
pub mod history;
/// LLM call boundary.
pub mod llm;
/// Prompts sent to the LLM.
pub mod prompts;
/// Session lifecycle service.
pub mod session;
/// Shared application state.
pub mod state;
/// SQLite storage layer for persistence.
pub mod storage;
/// Tool server boundary.
pub mod tools;

pub use config::Config;
pub use error::{AppError, AppResult, EngineError, EngineResult};
pub use state::{AppState, SharedState};

/// Reason recorded when a user cancels a session or branch.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";
