//! Execution plan: the stages that actually run for a chain.
//!
//! Every parallel stage is followed by a synthesis stage named
//! `"<stage> - Synthesis"` that merges branch results. Plan positions are
//! the `stage_index` values persisted on stage executions.

use super::{
    AgentSpec, ChainDefinition, ParallelGroup, StageAgents, SuccessPolicy, SYNTHESIS_AGENT,
};

/// One entry in the execution plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedStage {
    Single {
        stage_index: i64,
        name: String,
        agent: AgentSpec,
    },
    Parallel {
        stage_index: i64,
        name: String,
        group: ParallelGroup,
        policy: SuccessPolicy,
    },
    Synthesis {
        stage_index: i64,
        name: String,
        /// Name of the parallel stage whose branches are merged.
        source_stage: String,
        instructions: Option<String>,
    },
}

impl PlannedStage {
    /// Position in the plan
    pub fn stage_index(&self) -> i64 {
        match self {
            PlannedStage::Single { stage_index, .. }
            | PlannedStage::Parallel { stage_index, .. }
            | PlannedStage::Synthesis { stage_index, .. } => *stage_index,
        }
    }

    /// Stage name
    pub fn name(&self) -> &str {
        match self {
            PlannedStage::Single { name, .. }
            | PlannedStage::Parallel { name, .. }
            | PlannedStage::Synthesis { name, .. } => name,
        }
    }

    /// Agent name recorded on the stage execution
    pub fn agent_name(&self) -> String {
        match self {
            PlannedStage::Single { agent, .. } => agent.name.clone(),
            PlannedStage::Parallel { group, .. } => group.display_name(),
            PlannedStage::Synthesis { .. } => SYNTHESIS_AGENT.to_string(),
        }
    }
}

/// Ordered stages of one chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub stages: Vec<PlannedStage>,
}

impl ExecutionPlan {
    /// Expand a chain definition
    pub fn from_chain(chain: &ChainDefinition) -> Self {
        let mut stages = Vec::with_capacity(chain.stages.len() * 2);

        for stage in &chain.stages {
            let stage_index = stages.len() as i64;
            match &stage.agents {
                StageAgents::Agent(agent) => stages.push(PlannedStage::Single {
                    stage_index,
                    name: stage.name.clone(),
                    agent: agent.clone(),
                }),
                StageAgents::Parallel(group) => {
                    stages.push(PlannedStage::Parallel {
                        stage_index,
                        name: stage.name.clone(),
                        group: group.clone(),
                        policy: stage.success_policy,
                    });
                    stages.push(PlannedStage::Synthesis {
                        stage_index: stage_index + 1,
                        name: synthesis_stage_name(&stage.name),
                        source_stage: stage.name.clone(),
                        instructions: stage.synthesis_instructions.clone(),
                    });
                }
            }
        }

        Self { stages }
    }

    /// Number of planned stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the plan is empty
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Name of the synthesis stage following `stage`
pub fn synthesis_stage_name(stage: &str) -> String {
    format!("{} - Synthesis", stage)
}
