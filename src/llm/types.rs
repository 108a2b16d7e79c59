use serde::{Deserialize, Serialize};

use crate::history::InteractionType;

/// A message in an agent conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Structured tool calls requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool call answered by a `tool` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Ordered messages exchanged with the LLM.
pub type Conversation = Vec<Message>;

/// A structured tool call emitted by a function-calling model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Function name as exposed to the model.
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool schema offered to a function-calling model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Explicit per-call context, passed instead of ambient state so that
/// concurrent branches never observe each other's identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCallContext {
    pub session_id: String,
    pub stage_execution_id: Option<String>,
    pub interaction_type: InteractionType,
}

/// Request sent across the LLM boundary.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    pub context: LlmCallContext,
}

/// Response received across the LLM boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Visible answer text.
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Internal reasoning trace, native-thinking models only.
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// Create an assistant message carrying structured tool calls
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(MessageRole::Assistant, content)
        }
    }

    /// Create a tool result message answering `tool_call_id`
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(MessageRole::Tool, content)
        }
    }

    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

impl LlmRequest {
    /// Create a new request for the given conversation
    pub fn new(messages: Vec<Message>, context: LlmCallContext) -> Self {
        Self {
            messages,
            tools: None,
            max_output_tokens: None,
            context,
        }
    }

    /// Offer structured tools to the model
    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self
    }

    /// Cap the number of output tokens
    pub fn with_max_output_tokens(mut self, max: Option<u32>) -> Self {
        self.max_output_tokens = max;
        self
    }
}

impl LlmResponse {
    /// Create a plain text response (used by adapters and fakes)
    pub fn text(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
            ..Default::default()
        }
    }
}

impl TokenUsage {
    /// Build usage from input and output counts
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_message_constructors() {
        let msg = Message::system("You are an SRE");
        assert_eq!(msg.role, MessageRole::System);
        assert!(msg.tool_calls.is_empty());
        assert!(msg.tool_call_id.is_none());

        let msg = Message::tool("call-1", "pod list");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_message_serialization_is_stable() {
        let conversation = vec![
            Message::system("sys"),
            Message::user("Alert: pod crashloop"),
            Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: "c1".to_string(),
                    name: "kubernetes__get_pods".to_string(),
                    arguments: serde_json::json!({"namespace": "prod"}),
                }],
            ),
            Message::tool("c1", "pod-a CrashLoopBackOff"),
        ];

        let raw = serde_json::to_string(&conversation).unwrap();
        let restored: Conversation = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, conversation);
        assert_eq!(serde_json::to_string(&restored).unwrap(), raw);
    }

    #[test]
    fn test_plain_message_omits_tool_fields() {
        let raw = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(raw, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(100, 20);
        total += TokenUsage::new(50, 5);
        assert_eq!(total, TokenUsage::new(150, 25));
        assert_eq!(total.total_tokens, 175);
    }

    #[test]
    fn test_request_with_empty_tools_is_tool_free() {
        let ctx = LlmCallContext {
            session_id: "s".into(),
            stage_execution_id: None,
            interaction_type: InteractionType::Investigation,
        };
        let req = LlmRequest::new(vec![], ctx).with_tools(vec![]);
        assert!(req.tools.is_none());
    }
}
