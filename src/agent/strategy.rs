use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::native::NativeThinkingStrategy;
use super::react::ReactStrategy;
use crate::llm::{LlmResponse, Message, ToolSchema};
use crate::tools::{ToolDefinition, ToolOutcome};

/// How an agent turns LLM responses into actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Text protocol: `Thought` / `Action` / `Action Input` / `Final Answer`.
    #[default]
    React,
    /// Structured function calling with a separate reasoning trace.
    NativeThinking,
}

impl StrategyKind {
    /// Get the strategy name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::React => "react",
            StrategyKind::NativeThinking => "native_thinking",
        }
    }

    /// Instantiate the strategy
    pub fn strategy(&self) -> Arc<dyn IterationStrategy> {
        match self {
            StrategyKind::React => Arc::new(ReactStrategy),
            StrategyKind::NativeThinking => Arc::new(NativeThinkingStrategy),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "react" => Ok(StrategyKind::React),
            "native_thinking" | "native" => Ok(StrategyKind::NativeThinking),
            _ => Err(format!("Unknown iteration strategy: {}", s)),
        }
    }
}

/// A tool call the model asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    /// Structured call id, function calling only.
    pub call_id: Option<String>,
    pub server: String,
    pub tool: String,
    pub arguments: serde_json::Value,
}

/// A tool request paired with what came back.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolObservation {
    pub request: ToolRequest,
    pub outcome: ToolOutcome,
}

/// What a response asks the controller to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// Invoke these tools, then call the model again.
    ToolCalls(Vec<ToolRequest>),
    /// The agent is done.
    FinalAnswer(String),
    /// Reasoning without an action or answer.
    ThinkingOnly,
    /// The response did not follow the expected protocol.
    Unparseable(String),
}

/// Strategy seam between the controller loop and the model protocol.
///
/// A strategy owns message formatting and response interpretation; the
/// controller owns iteration counting, checkpoints and persistence.
pub trait IterationStrategy: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> StrategyKind;

    /// System prompt for an agent with the given instructions and tools
    fn system_prompt(&self, base: &str, instructions: &str, tools: &[ToolDefinition]) -> String;

    /// Tool schemas to offer the model, if any
    fn tool_schemas(&self, tools: &[ToolDefinition]) -> Vec<ToolSchema>;

    /// Interpret one response
    fn interpret(&self, response: &LlmResponse) -> Interpretation;

    /// The assistant turn to append to the conversation
    fn assistant_message(&self, response: &LlmResponse) -> Message;

    /// Messages carrying tool results back to the model
    fn observation_messages(&self, observations: &[ToolObservation]) -> Vec<Message>;

    /// Nudge after a response with neither action nor answer
    fn continuation_message(&self, interpretation: &Interpretation) -> Message;

    /// Final analysis text from a forced-conclusion response
    fn conclusion(&self, response: &LlmResponse) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("react".parse::<StrategyKind>().unwrap(), StrategyKind::React);
        assert_eq!(
            "native_thinking".parse::<StrategyKind>().unwrap(),
            StrategyKind::NativeThinking
        );
        assert!("chain_of_thought".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::default(), StrategyKind::React);
    }

    #[test]
    fn test_strategy_factory_matches_kind() {
        for kind in [StrategyKind::React, StrategyKind::NativeThinking] {
            assert_eq!(kind.strategy().kind(), kind);
        }
    }
}
