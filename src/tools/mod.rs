//! Tool server boundary.
//!
//! Agents reach external systems (Kubernetes, metrics, logs) through tool
//! servers. A [`ToolServer`] is one live connection; a [`ToolServerFactory`]
//! opens connections by server name. [`ToolInvocationClient`] is the
//! per-execution facade agents use: it never raises for tool failures and
//! records every exchange in the interaction log.

mod client;
mod stdio;

pub use client::ToolInvocationClient;
pub use stdio::{StdioToolServer, StdioToolServerFactory, DEFAULT_TOOL_TIMEOUT};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolResult;

/// Separator between server and tool in function-calling tool names.
pub const FUNCTION_NAME_SEPARATOR: &str = "__";

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub server: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// `server.tool`, as written in ReAct actions
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server, self.name)
    }

    /// `server__tool`, as exposed to function-calling models
    pub fn function_name(&self) -> String {
        format!("{}{}{}", self.server, FUNCTION_NAME_SEPARATOR, self.name)
    }
}

/// Split a function-calling name back into `(server, tool)`
pub fn split_function_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(FUNCTION_NAME_SEPARATOR)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

/// Raw output of a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallOutput {
    pub content: String,
    /// The server reported the call as failed.
    pub is_error: bool,
}

/// Machine-readable category of a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    ServerNotConfigured,
    ServerUnavailable,
    ToolNotFound,
    InvalidParameters,
    ServerError,
}

impl ToolErrorCode {
    /// Get the code as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorCode::ServerNotConfigured => "server_not_configured",
            ToolErrorCode::ServerUnavailable => "server_unavailable",
            ToolErrorCode::ToolNotFound => "tool_not_found",
            ToolErrorCode::InvalidParameters => "invalid_parameters",
            ToolErrorCode::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a tool invocation as seen by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success { content: String },
    Error { code: ToolErrorCode, message: String },
}

impl ToolOutcome {
    /// Create an error outcome
    pub fn error(code: ToolErrorCode, message: impl Into<String>) -> Self {
        ToolOutcome::Error {
            code,
            message: message.into(),
        }
    }

    /// Whether the call succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    /// Text fed back to the model
    pub fn render(&self) -> String {
        match self {
            ToolOutcome::Success { content } => content.clone(),
            ToolOutcome::Error { code, message } => format!("[{}] {}", code, message),
        }
    }
}

/// One live connection to a tool server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Tools the server offers.
    async fn list_tools(&self) -> ToolResult<Vec<ToolDefinition>>;
    /// Invoke one tool.
    async fn call_tool(&self, tool: &str, arguments: serde_json::Value)
        -> ToolResult<ToolCallOutput>;
    /// Release the connection.
    async fn close(&self) -> ToolResult<()>;
}

/// Opens tool server connections by name.
#[async_trait]
pub trait ToolServerFactory: Send + Sync {
    /// Whether `server` is configured at all.
    fn is_configured(&self, server: &str) -> bool;
    /// Open a connection to `server`.
    async fn connect(&self, server: &str) -> ToolResult<Box<dyn ToolServer>>;
}
