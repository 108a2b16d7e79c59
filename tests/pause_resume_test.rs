//! Pause/resume behaviour of the engine end to end.
//!
//! Sessions run against a scripted LLM and in-process tool servers on an
//! in-memory SQLite store.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::*;
use incident_engine::chain::{ChainDefinition, RunOverrides, StageDefinition};
use incident_engine::history::InteractionDetails;
use incident_engine::storage::{SessionStatus, StageStatus};

fn three_stage_chain() -> ChainDefinition {
    ChainDefinition::new(
        "pod-crash",
        vec![
            StageDefinition::single("data-collection", k8s_agent("KubernetesAgent")),
            StageDefinition::single("verification", k8s_agent("VerificationAgent")),
            StageDefinition::single("analysis", k8s_agent("AnalysisAgent")),
        ],
    )
}

#[tokio::test]
async fn test_pause_then_resume_completes_without_duplicate_interactions() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_pods")),
        Step::Text(react_action("k8s.get_pods")),
        Step::Text(react_final("Pod api-7f9c is OOMKilled")),
        Step::Text(react_final("Memory limit confirmed at 256Mi")),
        Step::Text(react_final("Root cause: memory limit too low")),
    ]));
    let tools = FakeTools::new().with_tool("k8s", "get_pods", "api-7f9c CrashLoopBackOff");
    let (service, storage) = build_service(llm.clone(), tools, engine_config(2, false)).await;

    let session_id = service
        .submit_alert(alert("PodCrashLooping"), three_stage_chain())
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Paused);
    let metadata = session.pause_metadata.expect("paused session has metadata");
    assert_eq!(metadata.current_iteration, 2);
    assert_eq!(metadata.reason.as_str(), "max_iterations_reached");

    let detail = service.session_detail(&session_id).await.unwrap();
    assert_eq!(detail.stages.len(), 1, "later stages are not created while paused");
    let collect = &detail.stages[0];
    assert_eq!(collect.status, StageStatus::Paused);
    assert_eq!(llm_interactions(&storage, &collect.execution_id).await.len(), 2);

    service
        .resume(
            &session_id,
            RunOverrides {
                max_iterations: Some(4),
                force_conclusion: None,
            },
        )
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.pause_metadata.is_none());
    assert_eq!(
        session.final_analysis.as_deref(),
        Some("Root cause: memory limit too low")
    );

    let detail = service.session_detail(&session_id).await.unwrap();
    assert_eq!(detail.stages.len(), 3);
    assert!(detail.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert_eq!(
        llm_interactions(&storage, &detail.stages[0].execution_id)
            .await
            .len(),
        3
    );
}

#[tokio::test]
async fn test_resumed_conversation_replays_paused_messages() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_pods")),
        Step::Text(react_action("k8s.get_events")),
        Step::Text(react_final("Node pressure evicted the pod")),
    ]));
    let tools = FakeTools::new()
        .with_tool("k8s", "get_pods", "api-7f9c Evicted")
        .with_tool("k8s", "get_events", "node-3 MemoryPressure");
    let (service, storage) = build_service(llm.clone(), tools, engine_config(2, false)).await;

    let session_id = service
        .submit_alert(
            alert("PodEvicted"),
            single_stage_chain(k8s_agent("KubernetesAgent")),
        )
        .await
        .unwrap();
    service.wait(&session_id).await.unwrap();

    let execution_id = service.session_detail(&session_id).await.unwrap().stages[0]
        .execution_id
        .clone();
    let before = llm_interactions(&storage, &execution_id).await;
    let InteractionDetails::Llm(last_before_pause) = &before[1].details else {
        panic!("expected an LLM interaction");
    };

    service
        .resume(&session_id, RunOverrides::default())
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    let resumed = &requests[2].messages;
    let replayed = &last_before_pause.conversation;

    // The snapshot holds the request plus the assistant reply; the resumed
    // request adds the observation of the last tool call after it.
    assert_eq!(&resumed[..replayed.len()], &replayed[..]);
    assert_eq!(resumed.len(), replayed.len() + 1);
    assert!(resumed[replayed.len()].content.contains("node-3 MemoryPressure"));
}

#[tokio::test]
async fn test_conversation_replays_across_repeated_pauses() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_pods")),
        Step::Text(react_action("k8s.get_events")),
        Step::Text(react_action("k8s.get_logs")),
        Step::Text(react_final("Kubelet killed the pod under memory pressure")),
    ]));
    let outputs = ["api-7f9c Evicted", "node-3 MemoryPressure", "kubelet: OOM kill api-7f9c"];
    let tools = FakeTools::new()
        .with_tool("k8s", "get_pods", outputs[0])
        .with_tool("k8s", "get_events", outputs[1])
        .with_tool("k8s", "get_logs", outputs[2]);
    let (service, storage) = build_service(llm.clone(), tools, engine_config(1, false)).await;

    let session_id = service
        .submit_alert(
            alert("PodEvicted"),
            single_stage_chain(k8s_agent("KubernetesAgent")),
        )
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
    let execution_id = service.session_detail(&session_id).await.unwrap().stages[0]
        .execution_id
        .clone();

    for (cycle, output) in outputs.iter().enumerate() {
        let interactions = llm_interactions(&storage, &execution_id).await;
        let InteractionDetails::Llm(last) = &interactions[interactions.len() - 1].details else {
            panic!("expected an LLM interaction");
        };
        let snapshot = last.conversation.clone();

        service
            .resume(&session_id, RunOverrides::default())
            .await
            .unwrap();
        let session = service.wait(&session_id).await.unwrap();
        let expected = if cycle + 1 < outputs.len() {
            SessionStatus::Paused
        } else {
            SessionStatus::Completed
        };
        assert_eq!(session.status, expected, "cycle {}", cycle);

        let requests = llm.requests();
        assert_eq!(requests.len(), cycle + 2);
        let resumed = &requests[cycle + 1].messages;
        assert_eq!(&resumed[..snapshot.len()], &snapshot[..], "cycle {}", cycle);
        assert_eq!(resumed.len(), snapshot.len() + 1, "cycle {}", cycle);
        assert!(resumed[snapshot.len()].content.contains(output));

        // Each resumed request extends the one sent before the pause.
        let previous = &requests[cycle].messages;
        assert_eq!(&resumed[..previous.len()], &previous[..], "cycle {}", cycle);
    }

    assert_eq!(llm_interactions(&storage, &execution_id).await.len(), 4);
}

#[tokio::test]
async fn test_resume_resets_iteration_budget() {
    let llm = Arc::new(ScriptedLlm::new(|_| Ok(reply(react_action("k8s.get_pods")))));
    let tools = FakeTools::new().with_tool("k8s", "get_pods", "all pods running");
    let (service, storage) = build_service(llm, tools, engine_config(2, false)).await;

    let session_id = service
        .submit_alert(
            alert("HighLatency"),
            single_stage_chain(k8s_agent("KubernetesAgent")),
        )
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.pause_metadata.unwrap().current_iteration, 2);

    service
        .resume(
            &session_id,
            RunOverrides {
                max_iterations: Some(1),
                force_conclusion: None,
            },
        )
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Paused);
    assert_eq!(session.pause_metadata.unwrap().current_iteration, 1);

    let execution = &service.session_detail(&session_id).await.unwrap().stages[0];
    assert_eq!(execution.current_iteration, 1);
    assert_eq!(llm_interactions(&storage, &execution.execution_id).await.len(), 3);
}

#[tokio::test]
async fn test_resume_with_forced_conclusion_finishes() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_pods")),
        Step::Text(react_action("k8s.get_pods")),
        Step::Text("Final Answer: DNS resolution failures".into()),
    ]));
    let tools = FakeTools::new().with_tool("k8s", "get_pods", "coredns CrashLoopBackOff");
    let (service, _storage) = build_service(llm, tools, engine_config(1, false)).await;

    let session_id = service
        .submit_alert(
            alert("DnsErrors"),
            single_stage_chain(k8s_agent("KubernetesAgent")),
        )
        .await
        .unwrap();
    service.wait(&session_id).await.unwrap();

    service
        .resume(
            &session_id,
            RunOverrides {
                max_iterations: Some(1),
                force_conclusion: Some(true),
            },
        )
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session
        .final_analysis
        .unwrap()
        .contains("DNS resolution failures"));
}

#[tokio::test]
async fn test_resume_rejects_session_that_is_not_paused() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![Step::Text(react_final("done"))]));
    let (service, _storage) = build_service(llm, FakeTools::new(), engine_config(2, false)).await;

    let session_id = service
        .submit_alert(alert("Noise"), single_stage_chain(k8s_agent("KubernetesAgent")))
        .await
        .unwrap();
    service.wait(&session_id).await.unwrap();

    let err = service
        .resume(&session_id, RunOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        incident_engine::EngineError::InvalidState { .. }
    ));
}
