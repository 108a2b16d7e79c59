//! Agent iteration loop behaviour seen through whole sessions.

mod common;

use std::sync::Arc;

use common::*;
use incident_engine::agent::StrategyKind;
use incident_engine::chain::{ChainDefinition, StageDefinition};
use incident_engine::config::{SizeUnit, SummarizationPolicy};
use incident_engine::history::{CommunicationType, InteractionDetails, InteractionType};
use incident_engine::llm::{LlmResponse, MessageRole, ToolCall};
use incident_engine::storage::{SessionStatus, StageStatus};

#[tokio::test]
async fn test_forced_conclusion_adds_exactly_one_interaction() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_pods")),
        Step::Text(react_action("k8s.get_pods")),
        Step::Text("Final Answer: Probably a bad deploy of api v2.3".into()),
    ]));
    let tools = FakeTools::new().with_tool("k8s", "get_pods", "api-7f9c Running");
    let (service, storage) = build_service(llm.clone(), tools, engine_config(2, true)).await;

    let session_id = service
        .submit_alert(alert("ErrorRate"), single_stage_chain(k8s_agent("KubernetesAgent")))
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.pause_metadata.is_none());
    assert!(session.final_analysis.unwrap().contains("bad deploy"));

    let execution = &service.session_detail(&session_id).await.unwrap().stages[0];
    let interactions = llm_interactions(&storage, &execution.execution_id).await;
    assert_eq!(interactions.len(), 3);
    let forced = interactions
        .iter()
        .filter(|i| i.interaction_type() == Some(InteractionType::ForcedConclusion))
        .count();
    assert_eq!(forced, 1);
    assert_eq!(
        interactions.last().unwrap().interaction_type(),
        Some(InteractionType::ForcedConclusion)
    );

    let forced_request = llm.requests_of(InteractionType::ForcedConclusion);
    assert!(forced_request[0].tools.is_none());
}

#[tokio::test]
async fn test_agent_level_force_conclusion_overrides_engine_default() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_pods")),
        Step::Text("Final Answer: inconclusive".into()),
    ]));
    let tools = FakeTools::new().with_tool("k8s", "get_pods", "ok");
    let (service, _storage) = build_service(llm, tools, engine_config(5, false)).await;

    let agent = k8s_agent("KubernetesAgent")
        .with_max_iterations(1)
        .with_force_conclusion(true);
    let session_id = service
        .submit_alert(alert("ErrorRate"), single_stage_chain(agent))
        .await
        .unwrap();

    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_tool_failure_becomes_observation() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Text(react_action("k8s.get_logs")),
        Step::Text(react_action("k8s.unknown_tool")),
        Step::Text(react_final("Logs unavailable, pods look healthy")),
    ]));
    let tools = FakeTools::new().with_failing_tool("k8s", "get_logs", "permission denied");
    let (service, storage) = build_service(llm.clone(), tools, engine_config(5, false)).await;

    let session_id = service
        .submit_alert(alert("ErrorRate"), single_stage_chain(k8s_agent("KubernetesAgent")))
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let execution = &service.session_detail(&session_id).await.unwrap().stages[0];
    let tool_calls: Vec<_> = storage
        .get_stage_interactions(&execution.execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|i| match i.details {
            InteractionDetails::Tool(t) if t.communication_type == CommunicationType::ToolCall => {
                Some(t)
            }
            _ => None,
        })
        .collect();
    assert_eq!(tool_calls.len(), 2);
    assert!(tool_calls.iter().all(|t| !t.success));
    assert!(tool_calls[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("permission denied"));

    let requests = llm.requests();
    let observation = &requests[1].messages.last().unwrap().content;
    assert!(observation.contains("[server_error]"));
    let observation = &requests[2].messages.last().unwrap().content;
    assert!(observation.contains("[tool_not_found]"));
}

#[tokio::test]
async fn test_transient_error_then_success_consumes_one_iteration() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Step::Transient,
        Step::Transient,
        Step::Text(react_final("Disk full on node-2")),
    ]));
    let (service, storage) =
        build_service(llm.clone(), FakeTools::new(), engine_config(1, false)).await;

    let session_id = service
        .submit_alert(alert("DiskFull"), single_stage_chain(k8s_agent("KubernetesAgent")))
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(llm.requests().len(), 3);

    let execution = &service.session_detail(&session_id).await.unwrap().stages[0];
    assert_eq!(execution.current_iteration, 1);
    let interactions = llm_interactions(&storage, &execution.execution_id).await;
    assert_eq!(interactions.len(), 1);
    assert!(interactions[0].success());
}

#[tokio::test]
async fn test_fatal_error_stops_chain_with_stage_message() {
    let llm = Arc::new(ScriptedLlm::sequence(vec![Step::Fatal]));
    let (service, storage) = build_service(llm, FakeTools::new(), engine_config(3, false)).await;

    let chain = ChainDefinition::new(
        "two-stage",
        vec![
            StageDefinition::single("collect", k8s_agent("KubernetesAgent")),
            StageDefinition::single("analyze", k8s_agent("AnalysisAgent")),
        ],
    );
    let session_id = service.submit_alert(alert("ErrorRate"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    let message = session.error_message.unwrap();
    assert!(
        message.starts_with("Stage 'collect' (agent: KubernetesAgent): LLM call failed"),
        "unexpected message: {}",
        message
    );

    let stages = service.session_detail(&session_id).await.unwrap().stages;
    assert_eq!(stages.len(), 1, "later stages are never created");
    assert_eq!(stages[0].status, StageStatus::Failed);
    assert!(stages[0].error_message.is_some());

    let interactions = llm_interactions(&storage, &stages[0].execution_id).await;
    assert_eq!(interactions.len(), 1);
    assert!(!interactions[0].success());
    assert_eq!(interactions[0].usage().total_tokens, 0);
}

#[tokio::test]
async fn test_summarization_logged_after_its_tool_call() {
    let llm = Arc::new(ScriptedLlm::new(|request| {
        Ok(match request.context.interaction_type {
            InteractionType::Summarization => reply("3 pods restarting, OOMKilled"),
            _ if request.messages.len() <= 2 => reply(react_action("k8s.get_logs")),
            _ => reply(react_final("Memory leak in api")),
        })
    }));
    let tools = FakeTools::new().with_tool("k8s", "get_logs", "x".repeat(500));
    let mut engine = engine_config(5, false);
    engine.summarization = SummarizationPolicy {
        enabled: true,
        threshold: 100,
        unit: SizeUnit::Chars,
        summary_max_tokens: 50,
    };
    let (service, storage) = build_service(llm.clone(), tools, engine).await;

    let session_id = service
        .submit_alert(alert("OOM"), single_stage_chain(k8s_agent("KubernetesAgent")))
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let execution = &service.session_detail(&session_id).await.unwrap().stages[0];
    let interactions = storage
        .get_stage_interactions(&execution.execution_id)
        .await
        .unwrap();
    let tool_call = interactions
        .iter()
        .position(|i| {
            matches!(&i.details, InteractionDetails::Tool(t)
                if t.communication_type == CommunicationType::ToolCall)
        })
        .unwrap();
    let summary = interactions
        .iter()
        .position(|i| i.interaction_type() == Some(InteractionType::Summarization))
        .unwrap();
    assert!(summary > tool_call);

    // Two agent iterations plus one summary, all counted on the stage.
    assert_eq!(execution.total_tokens, 3 * usage().total_tokens);

    let last_request = llm.requests_of(InteractionType::Investigation).pop().unwrap();
    let observation = &last_request.messages.last().unwrap().content;
    assert!(observation.contains("3 pods restarting, OOMKilled"));
    assert!(!observation.contains(&"x".repeat(500)));
}

#[tokio::test]
async fn test_token_totals_match_interactions() {
    let llm = Arc::new(ScriptedLlm::new(|request| {
        Ok(match request.context.interaction_type {
            InteractionType::FinalAnalysisSummary => reply("Short summary"),
            _ if request.messages.len() <= 2 => reply(react_action("k8s.get_pods")),
            _ => reply(react_final("Root cause found")),
        })
    }));
    let tools = FakeTools::new().with_tool("k8s", "get_pods", "pods");
    let mut engine = engine_config(5, false);
    engine.executive_summary_enabled = true;
    let (service, storage) = build_service(llm, tools, engine).await;

    let chain = ChainDefinition::new(
        "two-stage",
        vec![
            StageDefinition::single("collect", k8s_agent("KubernetesAgent")),
            StageDefinition::single("analyze", k8s_agent("AnalysisAgent")),
        ],
    );
    let session_id = service.submit_alert(alert("ErrorRate"), chain).await.unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.executive_summary.as_deref(), Some("Short summary"));

    let detail = service.session_detail(&session_id).await.unwrap();
    for stage in &detail.stages {
        let sum: i64 = storage
            .get_stage_interactions(&stage.execution_id)
            .await
            .unwrap()
            .iter()
            .map(|i| i.usage().total_tokens)
            .sum();
        assert_eq!(stage.total_tokens, sum, "stage {}", stage.stage_name);
    }

    let all = all_interactions(&storage, &session_id).await;
    let session_level: Vec<_> = all.iter().filter(|i| i.stage_execution_id.is_none()).collect();
    assert_eq!(session_level.len(), 1);
    assert_eq!(
        session_level[0].interaction_type(),
        Some(InteractionType::FinalAnalysisSummary)
    );

    let total: i64 = all.iter().map(|i| i.usage().total_tokens).sum();
    assert_eq!(detail.session.total_tokens, total);
    assert_eq!(total, 5 * usage().total_tokens);
}

#[tokio::test]
async fn test_native_thinking_uses_function_calls() {
    let llm = Arc::new(ScriptedLlm::new(|request| {
        if request.messages.iter().any(|m| m.role == MessageRole::Tool) {
            return Ok(LlmResponse {
                text: "Certificate expired yesterday".into(),
                thinking: Some("The TLS error explains the 503s".into()),
                usage: usage(),
                ..Default::default()
            });
        }
        Ok(LlmResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: "k8s__get_secrets".into(),
                arguments: serde_json::json!({"namespace": "prod"}),
            }],
            usage: usage(),
            ..Default::default()
        })
    }));
    let tools = FakeTools::new().with_tool("k8s", "get_secrets", "tls-cert notAfter=yesterday");
    let (service, _storage) = build_service(llm.clone(), tools.clone(), engine_config(5, false)).await;

    let agent = k8s_agent("KubernetesAgent").with_strategy(StrategyKind::NativeThinking);
    let session_id = service
        .submit_alert(alert("Http503"), single_stage_chain(agent))
        .await
        .unwrap();
    let session = service.wait(&session_id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.final_analysis.as_deref(),
        Some("Certificate expired yesterday")
    );
    assert_eq!(tools.calls(), vec!["k8s.get_secrets".to_string()]);

    let first = &llm.requests()[0];
    let schemas = first.tools.as_ref().unwrap();
    assert_eq!(schemas[0].name, "k8s__get_secrets");

    let second = &llm.requests()[1];
    let tool_message = second.messages.last().unwrap();
    assert_eq!(tool_message.role, MessageRole::Tool);
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
}
