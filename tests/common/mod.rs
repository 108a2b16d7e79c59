//! Shared fakes for end-to-end engine tests.
//!
//! `ScriptedLlm` answers every request with a handler closure and records
//! what it was sent; `FakeTools` serves canned tool results in-process.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use incident_engine::chain::{Alert, AgentSpec, ChainDefinition, StageDefinition};
use incident_engine::config::{EngineConfig, RequestConfig, SummarizationPolicy};
use incident_engine::error::{LlmError, LlmResult, ToolError, ToolResult};
use incident_engine::history::{Interaction, InteractionDetails, InteractionType};
use incident_engine::llm::{LlmClient, LlmRequest, LlmResponse, MessageRole, TokenUsage};
use incident_engine::session::InvestigationService;
use incident_engine::storage::{Page, SqliteStorage, Storage};
use incident_engine::tools::{ToolCallOutput, ToolDefinition, ToolServer, ToolServerFactory};

// ============================================================================
// LLM
// ============================================================================

type Handler = Box<dyn Fn(&LlmRequest) -> LlmResult<LlmResponse> + Send + Sync>;
type Delay = Box<dyn Fn(&LlmRequest) -> Option<Duration> + Send + Sync>;

/// LLM fake driven by a closure.
pub struct ScriptedLlm {
    handler: Handler,
    delay: Delay,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(handler: impl Fn(&LlmRequest) -> LlmResult<LlmResponse> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Box::new(|_| None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer requests in order from `steps`; an exhausted script is a fatal error.
    pub fn sequence(steps: Vec<Step>) -> Self {
        let steps = Mutex::new(VecDeque::from(steps));
        Self::new(move |_| match steps.lock().unwrap().pop_front() {
            Some(step) => step.into_result(),
            None => Err(LlmError::InvalidResponse {
                message: "script exhausted".into(),
            }),
        })
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Box::new(move |_| Some(delay));
        self
    }

    /// Sleep before answering requests matching `predicate`
    pub fn with_delay_when(
        mut self,
        predicate: impl Fn(&LlmRequest) -> bool + Send + Sync + 'static,
        delay: Duration,
    ) -> Self {
        self.delay = Box::new(move |request| predicate(request).then_some(delay));
        self
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests of one interaction type
    pub fn requests_of(&self, kind: InteractionType) -> Vec<LlmRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.context.interaction_type == kind)
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, request: &LlmRequest) -> LlmResult<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = (self.delay)(request) {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}

/// One scripted LLM answer.
pub enum Step {
    Text(String),
    Transient,
    Fatal,
}

impl Step {
    pub fn into_result(self) -> LlmResult<LlmResponse> {
        match self {
            Step::Text(text) => Ok(reply(text)),
            Step::Transient => Err(LlmError::Timeout { timeout_ms: 10 }),
            Step::Fatal => Err(LlmError::Api {
                status: 400,
                message: "bad request".into(),
            }),
        }
    }
}

pub fn usage() -> TokenUsage {
    TokenUsage::new(100, 20)
}

pub fn reply(text: impl Into<String>) -> LlmResponse {
    LlmResponse::text(text, usage())
}

/// ReAct response calling `server.tool` with no arguments
pub fn react_action(qualified_tool: &str) -> String {
    format!(
        "Thought: I need more data.\nAction: {}\nAction Input: {{}}",
        qualified_tool
    )
}

/// ReAct response with a final answer
pub fn react_final(answer: &str) -> String {
    format!("Thought: I know enough.\nFinal Answer: {}", answer)
}

/// The system prompt of a request
pub fn system_prompt(request: &LlmRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

// ============================================================================
// Tools
// ============================================================================

#[derive(Clone)]
enum FakeResult {
    Ok(String),
    Err(String),
}

/// In-process tool servers with canned results.
#[derive(Clone, Default)]
pub struct FakeTools {
    servers: HashMap<String, Vec<(String, FakeResult)>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, server: &str, tool: &str, output: impl Into<String>) -> Self {
        self.servers
            .entry(server.to_string())
            .or_default()
            .push((tool.to_string(), FakeResult::Ok(output.into())));
        self
    }

    pub fn with_failing_tool(mut self, server: &str, tool: &str, message: &str) -> Self {
        self.servers
            .entry(server.to_string())
            .or_default()
            .push((tool.to_string(), FakeResult::Err(message.to_string())));
        self
    }

    /// `server.tool` of every call made so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolServerFactory for FakeTools {
    fn is_configured(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }

    async fn connect(&self, server: &str) -> ToolResult<Box<dyn ToolServer>> {
        let tools = self
            .servers
            .get(server)
            .cloned()
            .ok_or_else(|| ToolError::ServerNotConfigured {
                server: server.to_string(),
            })?;
        Ok(Box::new(FakeServer {
            server: server.to_string(),
            tools,
            calls: self.calls.clone(),
        }))
    }
}

struct FakeServer {
    server: String,
    tools: Vec<(String, FakeResult)>,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ToolServer for FakeServer {
    async fn list_tools(&self) -> ToolResult<Vec<ToolDefinition>> {
        Ok(self
            .tools
            .iter()
            .map(|(name, _)| ToolDefinition {
                server: self.server.clone(),
                name: name.clone(),
                description: format!("Fake {}", name),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        _arguments: serde_json::Value,
    ) -> ToolResult<ToolCallOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}.{}", self.server, tool));
        match self.tools.iter().find(|(name, _)| name == tool) {
            Some((_, FakeResult::Ok(content))) => Ok(ToolCallOutput {
                content: content.clone(),
                is_error: false,
            }),
            Some((_, FakeResult::Err(message))) => Err(ToolError::Execution {
                server: self.server.clone(),
                tool: tool.to_string(),
                message: message.clone(),
            }),
            None => Err(ToolError::ToolNotFound {
                server: self.server.clone(),
                tool: tool.to_string(),
            }),
        }
    }

    async fn close(&self) -> ToolResult<()> {
        Ok(())
    }
}

// ============================================================================
// Engine setup
// ============================================================================

/// Engine defaults for tests: no summaries, small iteration budget.
pub fn engine_config(max_iterations: u32, force_conclusion: bool) -> EngineConfig {
    EngineConfig {
        max_iterations,
        force_conclusion,
        executive_summary_enabled: false,
        summarization: SummarizationPolicy {
            enabled: false,
            ..SummarizationPolicy::default()
        },
    }
}

pub fn request_config() -> RequestConfig {
    RequestConfig {
        timeout_ms: 1000,
        max_retries: 2,
        retry_delay_ms: 1,
    }
}

pub async fn build_service(
    llm: Arc<ScriptedLlm>,
    tools: FakeTools,
    engine: EngineConfig,
) -> (InvestigationService, Arc<dyn Storage>) {
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage"),
    );
    let service = InvestigationService::new(
        storage.clone(),
        llm,
        Arc::new(tools),
        engine,
        request_config(),
    );
    (service, storage)
}

pub fn alert(alert_type: &str) -> Alert {
    Alert {
        alert_type: alert_type.to_string(),
        data: serde_json::json!({"namespace": "prod", "pod": "api-7f9c"}),
        runbook: None,
    }
}

pub fn k8s_agent(name: &str) -> AgentSpec {
    AgentSpec::new(name).with_servers(["k8s"])
}

pub fn single_stage_chain(agent: AgentSpec) -> ChainDefinition {
    ChainDefinition::new("test-chain", vec![StageDefinition::single("collect", agent)])
}

/// LLM interactions of a stage execution, in order
pub async fn llm_interactions(storage: &Arc<dyn Storage>, execution_id: &str) -> Vec<Interaction> {
    storage
        .get_stage_interactions(execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| matches!(i.details, InteractionDetails::Llm(_)))
        .collect()
}

pub async fn all_interactions(storage: &Arc<dyn Storage>, session_id: &str) -> Vec<Interaction> {
    storage
        .get_session_interactions(session_id, Page::new(0, 1000))
        .await
        .unwrap()
        .items
}
