//! ReAct text protocol.
//!
//! The model writes `Thought:` / `Action:` / `Action Input:` blocks or a
//! `Final Answer:`. Tool results go back as `Observation:` user messages.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::strategy::{
    Interpretation, IterationStrategy, StrategyKind, ToolObservation, ToolRequest,
};
use crate::llm::{LlmResponse, Message, ToolSchema};
use crate::prompts::{agent_system_prompt, REACT_FORMAT_CORRECTION, REACT_FORMAT_PROMPT};
use crate::tools::ToolDefinition;

/// ReAct iteration strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactStrategy;

fn observation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Observation[ \t]*:").expect("valid regex"))
}

fn final_answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Final Answer[ \t]*:").expect("valid regex"))
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Action[ \t]*:[ \t]*(.*)$").expect("valid regex"))
}

fn action_input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Action Input[ \t]*:").expect("valid regex"))
}

fn thought_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Thought[ \t]*:").expect("valid regex"))
}

/// Drop anything from a self-written `Observation:` onwards.
pub fn strip_hallucinated_observation(text: &str) -> &str {
    match observation_re().find(text) {
        Some(m) => text[..m.start()].trim_end(),
        None => text.trim_end(),
    }
}

/// Parse one ReAct response.
pub fn parse_react(text: &str) -> Interpretation {
    let text = strip_hallucinated_observation(text);

    let action = action_re().captures(text);
    let final_answer = final_answer_re().find(text);

    // An Action written before a Final Answer wins; the model has not seen
    // the observation yet, so the answer is premature.
    let action_first = match (&action, &final_answer) {
        (Some(a), Some(f)) => a.get(0).map(|m| m.start()).unwrap_or(0) < f.start(),
        (Some(_), None) => true,
        _ => false,
    };

    if !action_first {
        if let Some(m) = final_answer {
            let answer = text[m.end()..].trim();
            if answer.is_empty() {
                return Interpretation::Unparseable("Final Answer is empty".to_string());
            }
            return Interpretation::FinalAnswer(answer.to_string());
        }
    }

    if let Some(captures) = action {
        let target = captures
            .get(1)
            .map(|m| m.as_str().trim().trim_matches('`'))
            .unwrap_or_default();
        let Some((server, tool)) = target
            .split_once('.')
            .filter(|(s, t)| !s.is_empty() && !t.is_empty())
        else {
            return Interpretation::Unparseable(format!(
                "Action '{}' must be written as server.tool",
                target
            ));
        };

        let action_end = captures.get(0).map(|m| m.end()).unwrap_or(0);
        let arguments = match action_input_re().find_at(text, action_end) {
            Some(m) => match parse_action_input(&text[m.end()..]) {
                Some(arguments) => arguments,
                None => {
                    return Interpretation::Unparseable(
                        "Action Input must be a JSON object, not another JSON value".to_string(),
                    )
                }
            },
            None => Value::Object(Default::default()),
        };

        return Interpretation::ToolCalls(vec![ToolRequest {
            call_id: None,
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
        }]);
    }

    if thought_re().is_match(text) {
        Interpretation::ThinkingOnly
    } else {
        Interpretation::Unparseable("No Thought, Action or Final Answer found".to_string())
    }
}

/// Parameters after `Action Input:`.
///
/// Accepts a JSON object (code fences and trailing text tolerated),
/// `key: value` lines, or raw text wrapped as `{"input": text}`. Empty input
/// means no parameters. A JSON value that is not an object is rejected.
fn parse_action_input(raw: &str) -> Option<Value> {
    let mut input = raw.trim();
    if let Some(rest) = input.strip_prefix("```") {
        input = rest.trim_start_matches("json").trim();
        input = input.split("```").next().unwrap_or_default().trim();
    }
    if input.is_empty() {
        return Some(Value::Object(Default::default()));
    }

    let mut stream = serde_json::Deserializer::from_str(input).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value @ Value::Object(_))) => return Some(value),
        Some(Ok(_)) => return None,
        _ => {}
    }

    let mut params = serde_json::Map::new();
    for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.split_once(':') {
            Some((key, value)) if is_param_key(key.trim()) => {
                params.insert(
                    key.trim().to_string(),
                    Value::String(value.trim().trim_matches('"').to_string()),
                );
            }
            _ => {
                params.clear();
                break;
            }
        }
    }
    if !params.is_empty() {
        return Some(Value::Object(params));
    }

    Some(serde_json::json!({ "input": input }))
}

fn is_param_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl IterationStrategy for ReactStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::React
    }

    fn system_prompt(&self, base: &str, instructions: &str, tools: &[ToolDefinition]) -> String {
        let mut format = String::from("## Available Tools\n");
        if tools.is_empty() {
            format.push_str("No tools are available; answer from the information given.\n");
        }
        for tool in tools {
            format.push_str(&format!(
                "- {}: {}\n  Parameters: {}\n",
                tool.qualified_name(),
                tool.description,
                tool.input_schema
            ));
        }
        format.push('\n');
        format.push_str(REACT_FORMAT_PROMPT);
        agent_system_prompt(base, instructions, &format)
    }

    fn tool_schemas(&self, _tools: &[ToolDefinition]) -> Vec<ToolSchema> {
        Vec::new()
    }

    fn interpret(&self, response: &LlmResponse) -> Interpretation {
        parse_react(&response.text)
    }

    fn assistant_message(&self, response: &LlmResponse) -> Message {
        Message::assistant(strip_hallucinated_observation(&response.text))
    }

    fn observation_messages(&self, observations: &[ToolObservation]) -> Vec<Message> {
        if observations.is_empty() {
            return Vec::new();
        }
        let text = observations
            .iter()
            .map(|o| format!("Observation: {}", o.outcome.render()))
            .collect::<Vec<_>>()
            .join("\n\n");
        vec![Message::user(text)]
    }

    fn continuation_message(&self, interpretation: &Interpretation) -> Message {
        match interpretation {
            Interpretation::Unparseable(reason) => {
                Message::user(format!("{}\nProblem: {}", REACT_FORMAT_CORRECTION, reason))
            }
            _ => Message::user(REACT_FORMAT_CORRECTION),
        }
    }

    fn conclusion(&self, response: &LlmResponse) -> String {
        match parse_react(&response.text) {
            Interpretation::FinalAnswer(answer) => answer,
            _ => strip_hallucinated_observation(&response.text).trim().to_string(),
        }
    }
}
