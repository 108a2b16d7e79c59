use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::types::{
    LlmRequest, LlmResponse, Message, MessageRole, TokenUsage, ToolCall, ToolSchema,
};
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};

/// The LLM call boundary.
///
/// Adapters for concrete vendor protocols implement this trait; the engine
/// only ever sees [`LlmRequest`] and [`LlmResponse`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Perform one request/response round-trip. No retries.
    async fn generate(&self, request: &LlmRequest) -> LlmResult<LlmResponse>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints
#[derive(Clone)]
pub struct HttpLlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    default_max_tokens: Option<u32>,
    request_config: RequestConfig,
}

impl HttpLlmClient {
    /// Create a new HTTP LLM client
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            default_max_tokens: config.max_output_tokens,
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, request: &LlmRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools: request
                .tools
                .as_ref()
                .map(|tools| tools.iter().map(WireTool::from).collect()),
            max_tokens: request.max_output_tokens.or(self.default_max_tokens),
            stream: false,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, request: &LlmRequest) -> LlmResult<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let start = Instant::now();

        debug!(
            session_id = %request.context.session_id,
            stage_execution_id = ?request.context.stage_execution_id,
            interaction_type = %request.context.interaction_type,
            messages = request.messages.len(),
            "Calling LLM"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else if e.is_connect() {
                    LlmError::Connection {
                        message: e.to_string(),
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let completion: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        let parsed = completion.into_response()?;

        info!(
            session_id = %request.context.session_id,
            latency_ms = start.elapsed().as_millis(),
            total_tokens = parsed.usage.total_tokens,
            "LLM call succeeded"
        );

        Ok(parsed)
    }
}

// Wire types for the chat-completions protocol

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments string.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: Option<i64>,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: function_type(),
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role: role.to_string(),
            content: Some(msg.content.clone()),
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
            reasoning_content: None,
        }
    }
}

impl From<&ToolSchema> for WireTool {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            tool_type: "function",
            function: WireFunction {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters.clone(),
            },
        }
    }
}

impl ChatCompletionResponse {
    fn into_response(self) -> LlmResult<LlmResponse> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "Response contained no choices".to_string(),
            })?;

        let mut tool_calls = Vec::new();
        for call in choice.message.tool_calls.unwrap_or_default() {
            let arguments = if call.function.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|e| {
                    LlmError::InvalidResponse {
                        message: format!(
                            "Tool call '{}' has malformed arguments: {}",
                            call.function.name, e
                        ),
                    }
                })?
            };
            tool_calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }

        let usage = self
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u
                    .total_tokens
                    .unwrap_or(u.prompt_tokens + u.completion_tokens),
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            thinking: choice.message.reasoning_content.filter(|t| !t.is_empty()),
            usage,
        })
    }
}
