//! Centralized prompt definitions for investigation agents
//!
//! This module contains every prompt the engine sends to the LLM.
//! Centralizing prompts makes them easier to maintain, test, and version.

use crate::chain::ChainContext;

/// Base system prompt shared by every investigation agent.
pub const INVESTIGATION_SYSTEM_PROMPT: &str = r#"You are an expert Site Reliability Engineer investigating a production incident.

Guidelines:
- Gather evidence with the available tools before drawing conclusions
- Prefer specific facts (resource names, timestamps, error messages) over speculation
- Build on the findings of previous stages instead of repeating their work
- When you have enough evidence, state the root cause, impact and recommended remediation"#;

/// Response format for ReAct agents.
pub const REACT_FORMAT_PROMPT: &str = r#"Respond using EXACTLY this format:

Thought: your reasoning about what to do next
Action: server.tool_name
Action Input: {"param": "value"}

After an Action, stop and wait. The tool result will be sent to you as an Observation.

When you have enough information, respond with:

Thought: your final reasoning
Final Answer: your complete analysis

Never write an Observation yourself. Action Input must be a JSON object."#;

/// Guidance for agents using native function calling.
pub const NATIVE_THINKING_PROMPT: &str = r#"Call the provided functions to gather evidence. You may call several functions in one turn.
When you have enough information, reply with your complete analysis as plain text without calling any function."#;

/// Sent when a ReAct response could not be parsed.
pub const REACT_FORMAT_CORRECTION: &str = r#"Your previous response did not follow the required format.
Respond with either an Action with Action Input, or a Final Answer."#;

/// Sent when a function-calling response contained only reasoning.
pub const NATIVE_CONTINUE_PROMPT: &str =
    "Continue the investigation: call a function, or give your final analysis.";

/// Sent after the iteration budget ran out when a conclusion is forced.
pub const FORCED_CONCLUSION_PROMPT: &str = r#"You have reached the maximum number of investigation steps. Do not call any more tools.
Based on the evidence gathered so far, provide your best final analysis now: the most likely root cause, the confidence you have in it, the impact and recommended next steps.
If you use the ReAct format, start your answer with "Final Answer:"."#;

/// Summarizes an oversized tool result.
pub const SUMMARIZATION_PROMPT: &str = r#"You summarize tool output for an incident investigation.
Keep every fact relevant to the investigation: resource names, states, error messages, counts and timestamps.
Drop repetition and boilerplate. Do not speculate about causes."#;

/// Merges the results of parallel branches.
pub const SYNTHESIS_PROMPT: &str = r#"You are a senior Site Reliability Engineer. Several agents investigated the same incident in parallel.
Merge their findings into a single analysis:
- Reconcile agreeing evidence and call out contradictions
- Ignore branches marked as failed or cancelled except to note the missing coverage
- State the most likely root cause, the impact and recommended remediation"#;

/// Condenses a final analysis for humans.
pub const EXECUTIVE_SUMMARY_PROMPT: &str = r#"Write a short executive summary (at most five sentences) of the incident analysis below.
State what happened, the root cause, the impact and the recommended action. No markdown headings."#;

/// System prompt for follow-up chat agents.
pub const CHAT_SYSTEM_PROMPT: &str = r#"You are an expert Site Reliability Engineer answering follow-up questions about a completed incident investigation.
The investigation history is provided below. Use tools when the question needs fresh evidence; otherwise answer from the history."#;

/// Full system prompt for an agent
pub fn agent_system_prompt(base: &str, instructions: &str, format: &str) -> String {
    let mut prompt = base.to_string();
    if !instructions.trim().is_empty() {
        prompt.push_str("\n\n## Agent Instructions\n");
        prompt.push_str(instructions.trim());
    }
    if !format.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(format);
    }
    prompt
}

/// Task message for one investigation stage
pub fn investigation_task(context: &ChainContext, stage_name: &str) -> String {
    let mut task = format!(
        "## Alert\nType: {}\n```json\n{}\n```\n",
        context.alert.alert_type,
        serde_json::to_string_pretty(&context.alert.data).unwrap_or_default()
    );

    if let Some(runbook) = &context.alert.runbook {
        task.push_str("\n## Runbook\n");
        task.push_str(runbook);
        task.push('\n');
    }

    if !context.stage_outputs.is_empty() {
        task.push_str("\n## Previous Stages\n");
        for output in &context.stage_outputs {
            task.push_str(&format!(
                "\n### {} ({})\n{}\n",
                output.stage_name, output.agent, output.analysis
            ));
        }
    }

    task.push_str(&format!(
        "\n## Task\nYou are running stage '{}'. Investigate the alert and report your findings.",
        stage_name
    ));
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Alert;

    #[test]
    fn test_agent_system_prompt_sections() {
        let prompt = agent_system_prompt("BASE", "Check pods first", REACT_FORMAT_PROMPT);
        assert!(prompt.starts_with("BASE"));
        assert!(prompt.contains("## Agent Instructions\nCheck pods first"));
        assert!(prompt.contains("Final Answer:"));

        let bare = agent_system_prompt("BASE", "  ", "");
        assert_eq!(bare, "BASE");
    }

    #[test]
    fn test_investigation_task_includes_previous_stages() {
        let mut context = ChainContext::new(
            "s1",
            Alert {
                alert_type: "PodCrashLooping".into(),
                data: serde_json::json!({"pod": "api-1"}),
                runbook: Some("Check recent deploys".into()),
            },
        );
        context.add_output("triage", "TriageAgent", "OOMKilled");

        let task = investigation_task(&context, "deep-dive");
        assert!(task.contains("Type: PodCrashLooping"));
        assert!(task.contains("\"pod\": \"api-1\""));
        assert!(task.contains("## Runbook\nCheck recent deploys"));
        assert!(task.contains("### triage (TriageAgent)\nOOMKilled"));
        assert!(task.contains("stage 'deep-dive'"));
    }
}
