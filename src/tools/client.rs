use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::stdio::DEFAULT_TOOL_TIMEOUT;
use super::{
    ToolCallOutput, ToolDefinition, ToolErrorCode, ToolOutcome, ToolServer, ToolServerFactory,
};
use crate::error::{EngineResult, ToolError};
use crate::history::{CommunicationType, InteractionLog, ToolInteraction};

/// Per-execution facade over the tool servers an agent may use.
///
/// Each stage execution (and each parallel branch) owns its own client, so
/// connections are never shared across concurrent runs. Tool failures are
/// returned as [`ToolOutcome::Error`] values; only storage failures while
/// logging surface as errors.
pub struct ToolInvocationClient {
    factory: Arc<dyn ToolServerFactory>,
    allowed: Vec<String>,
    connections: HashMap<String, Box<dyn ToolServer>>,
    catalog: Vec<ToolDefinition>,
    timeout: Duration,
}

impl ToolInvocationClient {
    /// Create a new client restricted to `servers`
    pub fn new(factory: Arc<dyn ToolServerFactory>, servers: Vec<String>) -> Self {
        Self {
            factory,
            allowed: servers,
            connections: HashMap::new(),
            catalog: Vec::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Bound every tool call and listing by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to every allowed server and discover its tools.
    ///
    /// Servers that fail to start are logged and skipped; the agent simply
    /// does not see their tools.
    pub async fn initialize(&mut self, log: &InteractionLog) -> EngineResult<()> {
        let servers = self.allowed.clone();
        for server in servers {
            let tools = self.discover(&server, log).await?;
            debug!(server = %server, tools = tools.len(), "Tool server ready");
        }
        info!(
            session_id = %log.session_id(),
            servers = self.connections.len(),
            tools = self.catalog.len(),
            "Tool client initialized"
        );
        Ok(())
    }

    /// Discovered tools across all servers
    pub fn catalog(&self) -> &[ToolDefinition] {
        &self.catalog
    }

    /// Servers this client may reach
    pub fn servers(&self) -> &[String] {
        &self.allowed
    }

    /// List the tools of one server, recording a `tool_list` interaction.
    pub async fn discover(
        &mut self,
        server: &str,
        log: &InteractionLog,
    ) -> EngineResult<Vec<ToolDefinition>> {
        let start = Instant::now();
        let timeout = self.timeout;
        let listed = match self.connection(server).await {
            Ok(connection) => bounded(server, timeout, connection.list_tools()).await,
            Err(e) => Err(e),
        };
        if matches!(listed, Err(ToolError::Timeout { .. })) {
            self.drop_connection(server).await;
        }

        let (tools, result, error) = match listed {
            Ok(tools) => {
                let names: Vec<_> = tools.iter().map(|t| t.name.clone()).collect();
                (tools, Some(serde_json::json!(names)), None)
            }
            Err(e) => {
                warn!(server = %server, error = %e, "Tool discovery failed");
                (Vec::new(), None, Some(e.to_string()))
            }
        };

        log.record_tool(
            ToolInteraction {
                communication_type: CommunicationType::ToolList,
                server: server.to_string(),
                tool: None,
                arguments: None,
                result,
                success: error.is_none(),
                error_message: error,
            },
            start.elapsed().as_millis() as i64,
        )
        .await?;

        self.catalog.retain(|t| t.server != server);
        self.catalog.extend(tools.iter().cloned());
        Ok(tools)
    }

    /// Invoke a tool. Failures come back as error outcomes.
    pub async fn invoke(
        &mut self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        log: &InteractionLog,
    ) -> EngineResult<ToolOutcome> {
        let start = Instant::now();
        let outcome = self.call(server, tool, arguments.clone()).await;

        let (result, error) = match &outcome {
            ToolOutcome::Success { content } => (Some(serde_json::json!(content)), None),
            ToolOutcome::Error { .. } => (None, Some(outcome.render())),
        };

        debug!(
            session_id = %log.session_id(),
            server = %server,
            tool = %tool,
            success = outcome.is_success(),
            "Tool invoked"
        );

        log.record_tool(
            ToolInteraction {
                communication_type: CommunicationType::ToolCall,
                server: server.to_string(),
                tool: Some(tool.to_string()),
                arguments: Some(arguments),
                result,
                success: outcome.is_success(),
                error_message: error,
            },
            start.elapsed().as_millis() as i64,
        )
        .await?;

        Ok(outcome)
    }

    /// Close every connection. Close failures are only logged.
    pub async fn close(&mut self) {
        for (server, connection) in self.connections.drain() {
            if let Err(e) = connection.close().await {
                warn!(server = %server, error = %e, "Failed to close tool server");
            }
        }
    }

    async fn call(&mut self, server: &str, tool: &str, arguments: serde_json::Value) -> ToolOutcome {
        if !self.allowed.iter().any(|s| s == server) || !self.factory.is_configured(server) {
            return ToolOutcome::error(
                ToolErrorCode::ServerNotConfigured,
                format!("Tool server '{}' is not available to this agent", server),
            );
        }

        if !arguments.is_object() {
            return ToolOutcome::error(
                ToolErrorCode::InvalidParameters,
                format!("Parameters for '{}.{}' must be a JSON object", server, tool),
            );
        }

        let known = self
            .catalog
            .iter()
            .any(|t| t.server == server && t.name == tool);
        let discovered = self.catalog.iter().any(|t| t.server == server);
        if discovered && !known {
            return ToolOutcome::error(
                ToolErrorCode::ToolNotFound,
                format!("Tool '{}' not found on server '{}'", tool, server),
            );
        }

        let timeout = self.timeout;
        let called = match self.connection(server).await {
            Ok(connection) => bounded(server, timeout, connection.call_tool(tool, arguments)).await,
            Err(e) => {
                return ToolOutcome::error(ToolErrorCode::ServerUnavailable, e.to_string());
            }
        };

        match called {
            Ok(ToolCallOutput {
                content,
                is_error: false,
            }) => ToolOutcome::Success { content },
            Ok(ToolCallOutput {
                content,
                is_error: true,
            }) => ToolOutcome::error(ToolErrorCode::ServerError, content),
            Err(e @ ToolError::ToolNotFound { .. }) => {
                ToolOutcome::error(ToolErrorCode::ToolNotFound, e.to_string())
            }
            Err(e @ (ToolError::Closed { .. } | ToolError::Io(_) | ToolError::Timeout { .. })) => {
                self.drop_connection(server).await;
                ToolOutcome::error(ToolErrorCode::ServerUnavailable, e.to_string())
            }
            Err(e) => ToolOutcome::error(ToolErrorCode::ServerError, e.to_string()),
        }
    }

    // The next call to `server` reconnects.
    async fn drop_connection(&mut self, server: &str) {
        if let Some(connection) = self.connections.remove(server) {
            if let Err(e) = connection.close().await {
                debug!(server = %server, error = %e, "Closing dropped connection failed");
            }
        }
    }

    async fn connection(&mut self, server: &str) -> Result<&dyn ToolServer, ToolError> {
        if !self.connections.contains_key(server) {
            let connection = self.factory.connect(server).await?;
            self.connections.insert(server.to_string(), connection);
        }
        self.connections
            .get(server)
            .map(|c| c.as_ref())
            .ok_or_else(|| ToolError::Closed {
                server: server.to_string(),
            })
    }
}

async fn bounded<T>(
    server: &str,
    timeout: Duration,
    request: impl std::future::Future<Output = Result<T, ToolError>>,
) -> Result<T, ToolError> {
    tokio::time::timeout(timeout, request)
        .await
        .unwrap_or_else(|_| {
            Err(ToolError::Timeout {
                server: server.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        })
}
