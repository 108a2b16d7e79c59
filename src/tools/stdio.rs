//! Stdio transport: tool servers spawned as child processes speaking
//! newline-delimited JSON-RPC 2.0.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ToolCallOutput, ToolDefinition, ToolServer, ToolServerFactory};
use crate::config::ToolServerSpec;
use crate::error::{ToolError, ToolResult};

const PROTOCOL_VERSION: &str = "2024-11-05";
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

/// Upper bound on one request/response exchange with a tool server.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<WireTool>,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<ToolResultContent>,
    #[serde(rename = "isError", default)]
    is_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ToolResultContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

struct Pipe {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A tool server running as a child process.
pub struct StdioToolServer {
    server: String,
    child: Mutex<Child>,
    pipe: Mutex<Pipe>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl StdioToolServer {
    /// Spawn the server and perform the initialize handshake.
    ///
    /// Every request, the handshake included, must be answered within
    /// `timeout`; a server that misses it is killed.
    pub async fn spawn(server: &str, spec: &ToolServerSpec, timeout: Duration) -> ToolResult<Self> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn {
                server: server.to_string(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ToolError::Spawn {
            server: server.to_string(),
            message: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::Spawn {
            server: server.to_string(),
            message: "stdout not captured".to_string(),
        })?;

        let connection = Self {
            server: server.to_string(),
            child: Mutex::new(child),
            pipe: Mutex::new(Pipe {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
            timeout,
        };

        connection
            .request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
            )
            .await?;
        connection
            .notify("notifications/initialized", None)
            .await?;

        info!(server = %server, command = %spec.command, "Tool server started");
        Ok(connection)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> ToolResult<()> {
        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        };
        let mut pipe = self.pipe.lock().await;
        self.write(&mut pipe, &message).await
    }

    async fn request(&self, method: &str, params: Option<Value>) -> ToolResult<Value> {
        match tokio::time::timeout(self.timeout, self.exchange(method, params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    server = %self.server,
                    method = %method,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Tool server timed out, stopping it"
                );
                // A late response would desynchronize the pipe.
                if let Err(e) = self.child.lock().await.start_kill() {
                    debug!(server = %self.server, error = %e, "Kill after timeout failed");
                }
                Err(ToolError::Timeout {
                    server: self.server.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn exchange(&self, method: &str, params: Option<Value>) -> ToolResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };

        // The pipe stays locked until the matching response arrives.
        let mut pipe = self.pipe.lock().await;
        self.write(&mut pipe, &message).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = pipe.stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Err(ToolError::Closed {
                    server: self.server.clone(),
                });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
                Ok(response) => response,
                Err(e) => {
                    debug!(server = %self.server, error = %e, "Skipping non-JSON line");
                    continue;
                }
            };

            // Notifications and stale responses carry no matching id.
            if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
                continue;
            }

            if let Some(error) = response.error {
                return Err(self.rpc_error(method, params_tool(&message), error));
            }

            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    async fn write(&self, pipe: &mut Pipe, message: &JsonRpcRequest<'_>) -> ToolResult<()> {
        let json = serde_json::to_string(message)?;
        debug!(server = %self.server, request = %json, "Sending request");
        pipe.stdin.write_all(json.as_bytes()).await?;
        pipe.stdin.write_all(b"\n").await?;
        pipe.stdin.flush().await?;
        Ok(())
    }

    fn rpc_error(&self, method: &str, tool: Option<String>, error: JsonRpcError) -> ToolError {
        match (error.code, tool) {
            (METHOD_NOT_FOUND, Some(tool)) => ToolError::ToolNotFound {
                server: self.server.clone(),
                tool,
            },
            (INVALID_PARAMS, Some(tool)) => ToolError::Execution {
                server: self.server.clone(),
                tool,
                message: format!("invalid parameters: {}", error.message),
            },
            _ => ToolError::Protocol {
                server: self.server.clone(),
                message: format!("{} failed ({}): {}", method, error.code, error.message),
            },
        }
    }
}

fn params_tool(message: &JsonRpcRequest<'_>) -> Option<String> {
    message
        .params
        .as_ref()
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl ToolServer for StdioToolServer {
    async fn list_tools(&self) -> ToolResult<Vec<ToolDefinition>> {
        let result = self.request("tools/list", None).await?;
        let listed: ToolsListResult = serde_json::from_value(result)?;

        Ok(listed
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                server: self.server.clone(),
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> ToolResult<ToolCallOutput> {
        let result = self
            .request(
                "tools/call",
                Some(serde_json::json!({"name": tool, "arguments": arguments})),
            )
            .await?;
        let call: ToolCallResult = serde_json::from_value(result)?;

        let content = call
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolCallOutput {
            content,
            is_error: call.is_error.unwrap_or(false),
        })
    }

    async fn close(&self) -> ToolResult<()> {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!(server = %self.server, error = %e, "Tool server did not stop cleanly");
        }
        Ok(())
    }
}

/// Spawns stdio tool servers from configuration.
#[derive(Debug, Clone)]
pub struct StdioToolServerFactory {
    specs: HashMap<String, ToolServerSpec>,
    timeout: Duration,
}

impl Default for StdioToolServerFactory {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl StdioToolServerFactory {
    /// Create a new factory from server specs
    pub fn new(specs: HashMap<String, ToolServerSpec>) -> Self {
        Self {
            specs,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Bound each request to a spawned server by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolServerFactory for StdioToolServerFactory {
    fn is_configured(&self, server: &str) -> bool {
        self.specs.contains_key(server)
    }

    async fn connect(&self, server: &str) -> ToolResult<Box<dyn ToolServer>> {
        let spec = self
            .specs
            .get(server)
            .ok_or_else(|| ToolError::ServerNotConfigured {
                server: server.to_string(),
            })?;
        Ok(Box::new(
            StdioToolServer::spawn(server, spec, self.timeout).await?,
        ))
    }
}
