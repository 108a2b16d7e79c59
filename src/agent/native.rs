//! Native-thinking protocol: structured function calls plus a separate
//! reasoning trace.

use super::strategy::{
    Interpretation, IterationStrategy, StrategyKind, ToolObservation, ToolRequest,
};
use crate::llm::{LlmResponse, Message, ToolSchema};
use crate::prompts::{agent_system_prompt, NATIVE_CONTINUE_PROMPT, NATIVE_THINKING_PROMPT};
use crate::tools::{split_function_name, ToolDefinition};

/// Function-calling iteration strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeThinkingStrategy;

impl IterationStrategy for NativeThinkingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NativeThinking
    }

    fn system_prompt(&self, base: &str, instructions: &str, _tools: &[ToolDefinition]) -> String {
        agent_system_prompt(base, instructions, NATIVE_THINKING_PROMPT)
    }

    fn tool_schemas(&self, tools: &[ToolDefinition]) -> Vec<ToolSchema> {
        tools
            .iter()
            .map(|t| ToolSchema {
                name: t.function_name(),
                description: t.description.clone(),
                parameters: if t.input_schema.is_object() {
                    t.input_schema.clone()
                } else {
                    serde_json::json!({"type": "object", "properties": {}})
                },
            })
            .collect()
    }

    fn interpret(&self, response: &LlmResponse) -> Interpretation {
        if !response.tool_calls.is_empty() {
            let requests = response
                .tool_calls
                .iter()
                .map(|call| {
                    let (server, tool) = split_function_name(&call.name)
                        .map(|(s, t)| (s.to_string(), t.to_string()))
                        .unwrap_or_else(|| (String::new(), call.name.clone()));
                    ToolRequest {
                        call_id: Some(call.id.clone()),
                        server,
                        tool,
                        arguments: call.arguments.clone(),
                    }
                })
                .collect();
            return Interpretation::ToolCalls(requests);
        }

        let text = response.text.trim();
        if !text.is_empty() {
            Interpretation::FinalAnswer(text.to_string())
        } else if response.thinking.is_some() {
            Interpretation::ThinkingOnly
        } else {
            Interpretation::Unparseable("Empty response".to_string())
        }
    }

    fn assistant_message(&self, response: &LlmResponse) -> Message {
        Message::assistant_tool_calls(response.text.clone(), response.tool_calls.clone())
    }

    fn observation_messages(&self, observations: &[ToolObservation]) -> Vec<Message> {
        observations
            .iter()
            .map(|o| {
                let call_id = o.request.call_id.clone().unwrap_or_default();
                Message::tool(call_id, o.outcome.render())
            })
            .collect()
    }

    fn continuation_message(&self, _interpretation: &Interpretation) -> Message {
        Message::user(NATIVE_CONTINUE_PROMPT)
    }

    fn conclusion(&self, response: &LlmResponse) -> String {
        let text = response.text.trim();
        if text.is_empty() {
            response.thinking.clone().unwrap_or_default()
        } else {
            text.to_string()
        }
    }
}
