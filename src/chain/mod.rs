//! Chains and their execution.
//!
//! A chain is an ordered list of stages. Each stage runs one agent or a
//! parallel group of agents; every parallel stage is followed by a synthesis
//! stage that merges the branch results.
//!
//! - [`plan`]: expands a chain into the stages that actually execute
//! - [`ChainExecutor`]: walks the plan, skipping finished stages on resume
//! - [`ParallelExecutionCoordinator`]: runs branches and applies the success policy
//! - [`AgentStageRunner`]: runs one agent for one stage execution

mod executor;
mod parallel;
pub mod plan;
mod runner;
mod status;
mod synthesis;

pub use executor::{ChainExecutionResult, ChainExecutor};
pub use parallel::{ParallelExecutionCoordinator, ParallelStageResult, STRAGGLER_CANCEL_REASON};
pub use plan::{ExecutionPlan, PlannedStage};
pub use runner::{AgentStageRunner, RunOverrides, StagePrompt, StageRunOutcome};
pub use status::{
    aggregate_branch_failures, derive_parallel_status, format_stage_failure, policy_outcome,
    ParallelStatus, StageFailure,
};
pub use synthesis::SynthesisRunner;

use serde::{Deserialize, Serialize};

use crate::agent::StrategyKind;
use crate::error::{EngineError, EngineResult};

/// Agent name used for auto-inserted synthesis stages.
pub const SYNTHESIS_AGENT: &str = "SynthesisAgent";

/// Default name of the chat agent when the chain does not configure one.
pub const CHAT_AGENT: &str = "ChatAgent";

// ============================================================================
// Definitions
// ============================================================================

/// An alert as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    /// Free-form alert payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Optional runbook text handed to every agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runbook: Option<String>,
}

/// Configuration of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    /// Agent-specific instructions appended to the system prompt.
    #[serde(default)]
    pub instructions: String,
    /// Tool servers this agent may use.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub iteration_strategy: StrategyKind,
    /// Overrides the engine default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Overrides the engine default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_conclusion: Option<bool>,
}

impl AgentSpec {
    /// Create a new agent spec with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: String::new(),
            mcp_servers: Vec::new(),
            iteration_strategy: StrategyKind::default(),
            max_iterations: None,
            force_conclusion: None,
        }
    }

    /// Set agent instructions
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Set the tool servers
    pub fn with_servers(mut self, servers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.mcp_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the iteration strategy
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.iteration_strategy = strategy;
        self
    }

    /// Set the iteration budget
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Set forced conclusion behaviour
    pub fn with_force_conclusion(mut self, force: bool) -> Self {
        self.force_conclusion = Some(force);
        self
    }
}

/// Shape of a parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelType {
    /// Different agents on the same input.
    MultiAgent,
    /// The same agent N times.
    Replica,
}

impl ParallelType {
    /// Get the type name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ParallelType::MultiAgent => "multi_agent",
            ParallelType::Replica => "replica",
        }
    }
}

impl std::str::FromStr for ParallelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "multi_agent" => Ok(ParallelType::MultiAgent),
            "replica" => Ok(ParallelType::Replica),
            _ => Err(format!("Unknown parallel type: {}", s)),
        }
    }
}

/// How branch outcomes decide a parallel stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// Every branch must complete.
    #[default]
    All,
    /// At least one branch must complete.
    Any,
}

impl SuccessPolicy {
    /// Get the policy name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            SuccessPolicy::All => "all",
            SuccessPolicy::Any => "any",
        }
    }
}

impl std::str::FromStr for SuccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(SuccessPolicy::All),
            "any" => Ok(SuccessPolicy::Any),
            _ => Err(format!("Unknown success policy: {}", s)),
        }
    }
}

/// A parallel group of agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParallelGroup {
    MultiAgent { agents: Vec<AgentSpec> },
    Replica { agent: AgentSpec, count: usize },
}

/// One branch of a resolved parallel group.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSpec {
    /// 1-based position within the group.
    pub index: usize,
    /// Display name; replicas are `<Agent>-1..<Agent>-N`.
    pub name: String,
    pub agent: AgentSpec,
}

impl ParallelGroup {
    /// Group shape
    pub fn parallel_type(&self) -> ParallelType {
        match self {
            ParallelGroup::MultiAgent { .. } => ParallelType::MultiAgent,
            ParallelGroup::Replica { .. } => ParallelType::Replica,
        }
    }

    /// Expand into concrete branches
    pub fn branches(&self) -> Vec<BranchSpec> {
        match self {
            ParallelGroup::MultiAgent { agents } => agents
                .iter()
                .enumerate()
                .map(|(i, agent)| BranchSpec {
                    index: i + 1,
                    name: agent.name.clone(),
                    agent: agent.clone(),
                })
                .collect(),
            ParallelGroup::Replica { agent, count } => (1..=*count)
                .map(|i| BranchSpec {
                    index: i,
                    name: format!("{}-{}", agent.name, i),
                    agent: agent.clone(),
                })
                .collect(),
        }
    }

    /// Display name used on the parallel parent execution
    pub fn display_name(&self) -> String {
        match self {
            ParallelGroup::MultiAgent { agents } => agents
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            ParallelGroup::Replica { agent, count } => format!("{} x{}", agent.name, count),
        }
    }
}

/// What a stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAgents {
    Agent(AgentSpec),
    Parallel(ParallelGroup),
}

/// One configured stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(flatten)]
    pub agents: StageAgents,
    #[serde(default)]
    pub success_policy: SuccessPolicy,
    /// Extra instructions for the synthesis stage that follows a parallel stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_instructions: Option<String>,
}

impl StageDefinition {
    /// Create a single-agent stage
    pub fn single(name: impl Into<String>, agent: AgentSpec) -> Self {
        Self {
            name: name.into(),
            agents: StageAgents::Agent(agent),
            success_policy: SuccessPolicy::All,
            synthesis_instructions: None,
        }
    }

    /// Create a parallel stage
    pub fn parallel(name: impl Into<String>, group: ParallelGroup, policy: SuccessPolicy) -> Self {
        Self {
            name: name.into(),
            agents: StageAgents::Parallel(group),
            success_policy: policy,
            synthesis_instructions: None,
        }
    }
}

/// An ordered list of stages for one alert type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub chain_id: String,
    pub stages: Vec<StageDefinition>,
    /// Agent used for follow-up chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_agent: Option<AgentSpec>,
    /// Overrides the engine default for executive summaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<bool>,
}

impl ChainDefinition {
    /// Create a new chain
    pub fn new(chain_id: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            chain_id: chain_id.into(),
            stages,
            chat_agent: None,
            executive_summary: None,
        }
    }

    /// Check structural validity before a session is created.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |message: String| EngineError::InvalidChain { message };

        if self.chain_id.trim().is_empty() {
            return Err(invalid("chain_id must not be empty".to_string()));
        }
        if self.stages.is_empty() {
            return Err(invalid(format!("chain '{}' has no stages", self.chain_id)));
        }

        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(invalid("stage name must not be empty".to_string()));
            }
            match &stage.agents {
                StageAgents::Agent(agent) if agent.name.trim().is_empty() => {
                    return Err(invalid(format!("stage '{}' has an unnamed agent", stage.name)));
                }
                StageAgents::Parallel(ParallelGroup::MultiAgent { agents }) if agents.is_empty() => {
                    return Err(invalid(format!("stage '{}' has no parallel agents", stage.name)));
                }
                StageAgents::Parallel(ParallelGroup::Replica { count, .. }) if *count == 0 => {
                    return Err(invalid(format!("stage '{}' has zero replicas", stage.name)));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

// ============================================================================
// Context
// ============================================================================

/// Output of a completed stage, handed to later stages.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub stage_name: String,
    pub agent: String,
    pub analysis: String,
}

/// Accumulated context passed from stage to stage.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub session_id: String,
    pub alert: Alert,
    pub stage_outputs: Vec<StageOutput>,
}

impl ChainContext {
    /// Create a new context for a session
    pub fn new(session_id: impl Into<String>, alert: Alert) -> Self {
        Self {
            session_id: session_id.into(),
            alert,
            stage_outputs: Vec::new(),
        }
    }

    /// Record a completed stage's output
    pub fn add_output(
        &mut self,
        stage_name: impl Into<String>,
        agent: impl Into<String>,
        analysis: impl Into<String>,
    ) {
        self.stage_outputs.push(StageOutput {
            stage_name: stage_name.into(),
            agent: agent.into(),
            analysis: analysis.into(),
        });
    }

    /// Analysis of the most recent stage
    pub fn latest_analysis(&self) -> Option<&str> {
        self.stage_outputs.last().map(|o| o.analysis.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replica_branch_names() {
        let group = ParallelGroup::Replica {
            agent: AgentSpec::new("KubernetesAgent"),
            count: 3,
        };
        let names: Vec<_> = group.branches().into_iter().map(|b| b.name).collect();
        assert_eq!(
            names,
            vec!["KubernetesAgent-1", "KubernetesAgent-2", "KubernetesAgent-3"]
        );
        assert_eq!(group.parallel_type(), ParallelType::Replica);
    }

    #[test]
    fn test_multi_agent_branches_keep_names() {
        let group = ParallelGroup::MultiAgent {
            agents: vec![AgentSpec::new("LogAgent"), AgentSpec::new("MetricsAgent")],
        };
        let branches = group.branches();
        assert_eq!(branches[0].index, 1);
        assert_eq!(branches[1].name, "MetricsAgent");
        assert_eq!(group.display_name(), "LogAgent, MetricsAgent");
    }

    #[test]
    fn test_chain_deserializes_from_json() {
        let raw = serde_json::json!({
            "chain_id": "k8s",
            "stages": [
                {"name": "triage", "agent": {"name": "TriageAgent", "mcp_servers": ["kubernetes"]}},
                {
                    "name": "deep-dive",
                    "parallel": {"type": "replica", "agent": {"name": "K8sAgent"}, "count": 2},
                    "success_policy": "any"
                }
            ]
        });
        let chain: ChainDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(chain.stages.len(), 2);
        assert!(matches!(chain.stages[0].agents, StageAgents::Agent(_)));
        assert_eq!(chain.stages[1].success_policy, SuccessPolicy::Any);
        assert!(chain.validate().is_ok());

        let restored: ChainDefinition =
            serde_json::from_str(&serde_json::to_string(&chain).unwrap()).unwrap();
        assert_eq!(restored, chain);
    }

    #[test]
    fn test_validate_rejects_empty_chain() {
        let chain = ChainDefinition::new("empty", vec![]);
        assert!(matches!(
            chain.validate(),
            Err(EngineError::InvalidChain { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_replicas() {
        let chain = ChainDefinition::new(
            "bad",
            vec![StageDefinition::parallel(
                "p",
                ParallelGroup::Replica {
                    agent: AgentSpec::new("A"),
                    count: 0,
                },
                SuccessPolicy::All,
            )],
        );
        assert!(chain.validate().is_err());
    }

    #[test]
    fn test_policy_and_type_parse() {
        assert_eq!("any".parse::<SuccessPolicy>().unwrap(), SuccessPolicy::Any);
        assert_eq!(
            "multi_agent".parse::<ParallelType>().unwrap(),
            ParallelType::MultiAgent
        );
        assert!("most".parse::<SuccessPolicy>().is_err());
    }
}
