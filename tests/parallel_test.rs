//! Parallel stages: success policies, synthesis, branch cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use incident_engine::chain::{
    AgentSpec, ChainDefinition, ParallelGroup, StageDefinition, SuccessPolicy,
    STRAGGLER_CANCEL_REASON,
};
use incident_engine::error::LlmError;
use incident_engine::history::InteractionType;
use incident_engine::llm::{LlmRequest, LlmResponse};
use incident_engine::session::CancelOutcome;
use incident_engine::storage::{SessionStatus, StageKind, StageStatus};
use incident_engine::CANCELLED_BY_USER;

fn agent(name: &str, role: &str) -> AgentSpec {
    k8s_agent(name).with_instructions(role)
}

fn parallel_chain(agents: Vec<AgentSpec>, policy: SuccessPolicy) -> ChainDefinition {
    ChainDefinition::new(
        "parallel",
        vec![StageDefinition::parallel(
            "investigate",
            ParallelGroup::MultiAgent { agents },
            policy,
        )],
    )
}

/// Branch A answers at once, branch B keeps calling tools, synthesis merges.
fn routed(request: &LlmRequest) -> Result<LlmResponse, LlmError> {
    if request.context.interaction_type == InteractionType::FinalAnalysis {
        return Ok(reply("Merged: api pods are OOMKilled"));
    }
    if system_prompt(request).contains("ROLE-A") {
        Ok(reply(react_final("A found OOMKilled pods")))
    } else {
        Ok(reply(react_action("k8s.get_pods")))
    }
}

fn tools() -> FakeTools {
    FakeTools::new().with_tool("k8s", "get_pods", "api-7f9c OOMKilled")
}

#[tokio::test]
async fn test_any_policy_continues_after_paused_branch_is_cancelled() {
    let llm = Arc::new(ScriptedLlm::new(routed));
    let (service, storage) = build_service(llm.clone(), tools(), engine_config(1, false)).await;

    let chain = parallel_chain(
        vec![agent("LogAgent", "ROLE-A"), agent("MetricsAgent", "ROLE-B")],
        SuccessPolicy::Any,
    );
    let session_id = service.submit_alert(alert("OOM"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();

    // A completed but B paused; paused takes priority.
    assert_eq!(session.status, SessionStatus::Paused);

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    let parent = stages.iter().find(|s| s.kind == StageKind::Parallel).unwrap();
    assert_eq!(parent.status, StageStatus::Paused);
    let branch_b = stages
        .iter()
        .find(|s| s.agent == "MetricsAgent")
        .unwrap()
        .clone();
    assert_eq!(branch_b.status, StageStatus::Paused);
    assert_eq!(branch_b.parallel_index, 2);
    assert_eq!(branch_b.stage_index, parent.stage_index);
    let paused_at = branch_b.paused_at.unwrap();

    let outcome = service
        .cancel_branch(&session_id, &branch_b.execution_id)
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.final_analysis.as_deref(),
        Some("Merged: api pods are OOMKilled")
    );

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    let branch_b = stages
        .iter()
        .find(|s| s.execution_id == branch_b.execution_id)
        .unwrap();
    assert_eq!(branch_b.status, StageStatus::Cancelled);
    assert_eq!(branch_b.error_message.as_deref(), Some(CANCELLED_BY_USER));
    assert_eq!(branch_b.completed_at, Some(paused_at));

    let synthesis = stages.iter().find(|s| s.kind == StageKind::Synthesis).unwrap();
    assert_eq!(synthesis.stage_name, "investigate - Synthesis");
    assert_eq!(synthesis.status, StageStatus::Completed);
    let interactions = llm_interactions(&storage, &synthesis.execution_id).await;
    assert_eq!(interactions.len(), 1);
    assert_eq!(
        interactions[0].interaction_type(),
        Some(InteractionType::FinalAnalysis)
    );

    let synthesis_requests = llm.requests_of(InteractionType::FinalAnalysis);
    assert_eq!(synthesis_requests.len(), 1);
    let input = &synthesis_requests[0].messages[1].content;
    assert!(input.contains("A found OOMKilled pods"));
    assert!(input.contains("[cancelled by user]"));

    // Resuming did not re-run the completed branch.
    let branch_a = stages.iter().find(|s| s.agent == "LogAgent").unwrap();
    assert_eq!(llm_interactions(&storage, &branch_a.execution_id).await.len(), 1);
}

#[tokio::test]
async fn test_fast_path_cancel_of_paused_parallel_session() {
    let llm = Arc::new(ScriptedLlm::new(routed));
    let (service, _storage) = build_service(llm, tools(), engine_config(1, false)).await;

    let chain = parallel_chain(
        vec![agent("LogAgent", "ROLE-B"), agent("MetricsAgent", "ROLE-B")],
        SuccessPolicy::All,
    );
    let session_id = service.submit_alert(alert("OOM"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Paused);

    let before = service.session_detail(&session_id).await.unwrap().stages;
    assert!(before.iter().all(|s| s.status == StageStatus::Paused));

    let outcome = service.cancel(&session_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let detail = service.session_detail(&session_id).await.unwrap();
    assert_eq!(detail.session.status, SessionStatus::Cancelled);
    assert!(detail.session.pause_metadata.is_none());
    for (old, new) in before.iter().zip(detail.stages.iter()) {
        assert_eq!(new.status, StageStatus::Cancelled);
        assert_eq!(new.completed_at, old.paused_at, "{}", new.agent);
    }
}

#[tokio::test]
async fn test_all_policy_failure_lists_every_failed_branch() {
    let llm = Arc::new(ScriptedLlm::new(|_| {
        Err(LlmError::Api {
            status: 401,
            message: "invalid api key".into(),
        })
    }));
    let (service, _storage) = build_service(llm, tools(), engine_config(3, false)).await;

    let chain = parallel_chain(
        vec![agent("LogAgent", "ROLE-A"), agent("MetricsAgent", "ROLE-B")],
        SuccessPolicy::All,
    );
    let session_id = service.submit_alert(alert("OOM"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    let message = session.error_message.unwrap();
    assert!(message.starts_with("Chain processing failed with 2 stage failures:"));
    assert!(message.contains("\n1. Stage 'investigate' (agent: LogAgent): LLM call failed"));
    assert!(message.contains("\n2. Stage 'investigate' (agent: MetricsAgent): LLM call failed"));

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    assert!(
        stages.iter().all(|s| s.kind != StageKind::Synthesis),
        "synthesis never runs after a failed parallel stage"
    );
}

#[tokio::test]
async fn test_decided_policy_cancels_stragglers_that_cannot_pause() {
    let llm = Arc::new(
        ScriptedLlm::new(routed).with_delay_when(
            |request| system_prompt(request).contains("ROLE-B"),
            Duration::from_millis(200),
        ),
    );
    let (service, _storage) = build_service(llm, tools(), engine_config(10, false)).await;

    let chain = parallel_chain(
        vec![
            agent("LogAgent", "ROLE-A"),
            agent("MetricsAgent", "ROLE-B").with_force_conclusion(true),
        ],
        SuccessPolicy::Any,
    );
    let session_id = service.submit_alert(alert("OOM"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    let straggler = stages.iter().find(|s| s.agent == "MetricsAgent").unwrap();
    assert_eq!(straggler.status, StageStatus::Cancelled);
    assert_eq!(
        straggler.error_message.as_deref(),
        Some(STRAGGLER_CANCEL_REASON)
    );
    let parent = stages.iter().find(|s| s.kind == StageKind::Parallel).unwrap();
    assert_eq!(parent.status, StageStatus::Completed);
    assert_eq!(parent.total_tokens, 0);
}

#[tokio::test]
async fn test_replica_branches_get_numbered_names() {
    let llm = Arc::new(ScriptedLlm::new(|request| {
        if request.context.interaction_type == InteractionType::FinalAnalysis {
            return Ok(reply("Replicas agree"));
        }
        Ok(reply(react_final("Node disk pressure")))
    }));
    let (service, _storage) = build_service(llm, tools(), engine_config(3, false)).await;

    let chain = ChainDefinition::new(
        "replicas",
        vec![
            StageDefinition::parallel(
                "investigate",
                ParallelGroup::Replica {
                    agent: k8s_agent("KubernetesAgent"),
                    count: 3,
                },
                SuccessPolicy::All,
            ),
            StageDefinition::single("report", k8s_agent("ReportAgent")),
        ],
    );
    let session_id = service.submit_alert(alert("DiskPressure"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    let mut branches: Vec<_> = stages
        .iter()
        .filter(|s| s.kind == StageKind::Branch)
        .map(|s| (s.parallel_index, s.agent.clone()))
        .collect();
    branches.sort();
    assert_eq!(
        branches,
        vec![
            (1, "KubernetesAgent-1".to_string()),
            (2, "KubernetesAgent-2".to_string()),
            (3, "KubernetesAgent-3".to_string()),
        ]
    );

    let report = stages.iter().find(|s| s.stage_name == "report").unwrap();
    assert_eq!(report.stage_index, 2);
}

/// Poll until the branch run by `agent` reaches `status`.
async fn branch_in_status(
    service: &incident_engine::session::InvestigationService,
    session_id: &str,
    agent: &str,
    status: StageStatus,
) -> incident_engine::storage::StageExecution {
    for _ in 0..200 {
        let stages = service.session_detail(session_id).await.unwrap().stages;
        if let Some(branch) = stages
            .iter()
            .find(|s| s.agent == agent && s.status == status)
        {
            return branch.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("branch {} never reached {}", agent, status);
}

#[tokio::test]
async fn test_paused_branch_cancelled_while_sibling_runs() {
    // MetricsAgent pauses at once; LogAgent answers only after a delay.
    let llm = Arc::new(
        ScriptedLlm::new(routed).with_delay_when(
            |request| system_prompt(request).contains("ROLE-A"),
            Duration::from_millis(600),
        ),
    );
    let (service, _storage) = build_service(llm, tools(), engine_config(1, false)).await;

    let chain = parallel_chain(
        vec![agent("LogAgent", "ROLE-A"), agent("MetricsAgent", "ROLE-B")],
        SuccessPolicy::Any,
    );
    let session_id = service.submit_alert(alert("OOM"), chain).await.unwrap();

    let paused = branch_in_status(&service, &session_id, "MetricsAgent", StageStatus::Paused).await;
    assert_eq!(
        service.get_session(&session_id).await.unwrap().status,
        SessionStatus::InProgress
    );

    let outcome = service
        .cancel_branch(&session_id, &paused.execution_id)
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.pause_metadata.is_none());
    assert_eq!(
        session.final_analysis.as_deref(),
        Some("Merged: api pods are OOMKilled")
    );

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    let parent = stages.iter().find(|s| s.kind == StageKind::Parallel).unwrap();
    assert_eq!(parent.status, StageStatus::Completed);
    let cancelled = stages
        .iter()
        .find(|s| s.execution_id == paused.execution_id)
        .unwrap();
    assert_eq!(cancelled.status, StageStatus::Cancelled);
    assert_eq!(cancelled.completed_at, paused.paused_at);
    assert!(stages.iter().all(|s| s.status != StageStatus::Paused));
}

#[tokio::test]
async fn test_running_branch_cancel_lets_any_policy_complete() {
    // MetricsAgent keeps calling tools slowly; LogAgent answers at once.
    let llm = Arc::new(
        ScriptedLlm::new(routed).with_delay_when(
            |request| system_prompt(request).contains("ROLE-B"),
            Duration::from_millis(100),
        ),
    );
    let (service, storage) = build_service(llm, tools(), engine_config(50, false)).await;

    let chain = parallel_chain(
        vec![agent("LogAgent", "ROLE-A"), agent("MetricsAgent", "ROLE-B")],
        SuccessPolicy::Any,
    );
    let session_id = service.submit_alert(alert("OOM"), chain).await.unwrap();

    branch_in_status(&service, &session_id, "LogAgent", StageStatus::Completed).await;
    let running = branch_in_status(&service, &session_id, "MetricsAgent", StageStatus::Active).await;

    let outcome = service
        .cancel_branch(&session_id, &running.execution_id)
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelling);

    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.final_analysis.as_deref(),
        Some("Merged: api pods are OOMKilled")
    );

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    let cancelled = stages
        .iter()
        .find(|s| s.execution_id == running.execution_id)
        .unwrap();
    assert_eq!(cancelled.status, StageStatus::Cancelled);
    assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_BY_USER));
    assert!(llm_interactions(&storage, &cancelled.execution_id).await.len() < 50);
    assert!(!service.cancellations().is_running(&running.execution_id).await);
}
