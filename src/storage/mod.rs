//! Storage layer for investigation session persistence.
//!
//! This module defines the records the engine persists (sessions, stage
//! executions, chats) and the [`Storage`] trait that is the session-store
//! boundary. [`SqliteStorage`] is the shipped implementation.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::StrategyKind;
use crate::chain::{Alert, ChainDefinition, ParallelType, SuccessPolicy};
use crate::error::StorageResult;
use crate::history::Interaction;
use crate::llm::Conversation;

// ============================================================================
// Status vocabulary
// ============================================================================

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Submitted, not yet picked up.
    #[default]
    Pending,
    /// A background task is executing the chain.
    InProgress,
    /// Waiting for a resume; nothing is executing.
    Paused,
    /// Every stage completed.
    Completed,
    /// A stage failed and the chain halted.
    Failed,
    /// Cancelled by user.
    Cancelled,
}

impl SessionStatus {
    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled sessions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "in_progress" => Ok(SessionStatus::InProgress),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Lifecycle status of a stage execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl StageStatus {
    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Active => "active",
            StageStatus::Paused => "paused",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled executions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StageStatus::Pending),
            "active" => Ok(StageStatus::Active),
            "paused" => Ok(StageStatus::Paused),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            "cancelled" => Ok(StageStatus::Cancelled),
            _ => Err(format!("Unknown stage status: {}", s)),
        }
    }
}

/// What kind of unit a stage execution represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// One agent run.
    #[default]
    Single,
    /// Parent of N parallel branches; owns no interactions itself.
    Parallel,
    /// One branch of a parallel stage.
    Branch,
    /// Auto-inserted synthesis after a parallel stage.
    Synthesis,
    /// Follow-up chat response.
    Chat,
}

impl StageKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Single => "single",
            StageKind::Parallel => "parallel",
            StageKind::Branch => "branch",
            StageKind::Synthesis => "synthesis",
            StageKind::Chat => "chat",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(StageKind::Single),
            "parallel" => Ok(StageKind::Parallel),
            "branch" => Ok(StageKind::Branch),
            "synthesis" => Ok(StageKind::Synthesis),
            "chat" => Ok(StageKind::Chat),
            _ => Err(format!("Unknown stage kind: {}", s)),
        }
    }
}

// ============================================================================
// Pause metadata
// ============================================================================

/// Why an agent run paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// The iteration budget ran out without a final answer.
    MaxIterationsReached,
}

impl PauseReason {
    /// Get the reason as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::MaxIterationsReached => "max_iterations_reached",
        }
    }
}

/// Pause state, present only while some part of a session is paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseMetadata {
    pub reason: PauseReason,
    /// Iterations completed in the run that paused (not cumulative).
    pub current_iteration: u32,
    pub message: String,
    pub paused_at: DateTime<Utc>,
}

impl PauseMetadata {
    /// Pause caused by exhausting the iteration budget
    pub fn max_iterations(current_iteration: u32) -> Self {
        Self {
            reason: PauseReason::MaxIterationsReached,
            current_iteration,
            message: format!(
                "Paused after {} iterations - resume to continue the investigation",
                current_iteration
            ),
            // Stored timestamps keep microseconds; match them so a paused
            // execution's `completed_at` compares equal to `paused_at`.
            paused_at: Utc::now().trunc_subsecs(6),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Top-level unit of work for one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// The alert being investigated.
    pub alert: Alert,
    /// Dedup fingerprint of the alert.
    pub alert_fingerprint: String,
    /// Snapshot of the chain so a resume survives restarts.
    pub chain: ChainDefinition,
    pub status: SessionStatus,
    pub error_message: Option<String>,
    pub final_analysis: Option<String>,
    pub executive_summary: Option<String>,
    pub pause_metadata: Option<PauseMetadata>,
    /// Token totals, maintained by [`Storage::append_interaction`].
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of a stage, branch, synthesis or chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub execution_id: String,
    pub session_id: String,
    /// Strictly increasing across top-level executions; branches share
    /// their parent's index.
    pub stage_index: i64,
    /// 1..N for parallel branches, 0 otherwise.
    pub parallel_index: i64,
    pub stage_name: String,
    /// Agent name (replicas are suffixed `-1..-N`).
    pub agent: String,
    pub kind: StageKind,
    pub parent_execution_id: Option<String>,
    pub parallel_type: Option<ParallelType>,
    pub success_policy: Option<SuccessPolicy>,
    pub iteration_strategy: Option<StrategyKind>,
    pub chat_id: Option<String>,
    pub status: StageStatus,
    /// Iterations in the current run; resets on every resume.
    pub current_iteration: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// The analysis this execution produced.
    pub stage_output: Option<String>,
    pub pause_metadata: Option<PauseMetadata>,
    /// Conversation as it stood at pause time.
    pub conversation: Option<Conversation>,
    /// Token totals, maintained by [`Storage::append_interaction`].
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
}

/// A follow-up chat attached to a terminal session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    pub session_id: String,
    pub created_by: String,
    /// Rendered investigation history the chat agent is seeded with.
    pub context_snapshot: String,
    pub created_at: DateTime<Utc>,
}

/// Who wrote a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(ChatRole::User),
            "assistant" => Ok(ChatRole::Assistant),
            _ => Err(format!("Unknown chat role: {}", s)),
        }
    }
}

/// One message in a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub chat_id: String,
    pub role: ChatRole,
    pub author: String,
    pub content: String,
    /// Stage execution that produced an assistant reply.
    pub stage_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Pagination & filters
// ============================================================================

/// Offset/limit page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Page {
    /// Create a page request
    pub fn new(offset: i64, limit: i64) -> Self {
        Self {
            offset: offset.max(0),
            limit: limit.clamp(1, 1000),
        }
    }
}

/// One page of results plus the total count.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
}

// ============================================================================
// Constructors & transitions
// ============================================================================

impl Session {
    /// Create a new pending session for an alert
    pub fn new(alert: Alert, fingerprint: impl Into<String>, chain: ChainDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            alert,
            alert_fingerprint: fingerprint.into(),
            chain,
            status: SessionStatus::Pending,
            error_message: None,
            final_analysis: None,
            executive_summary: None,
            pause_metadata: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// A background task started (or resumed) executing the chain.
    pub fn mark_in_progress(&mut self) {
        let now = Utc::now();
        self.status = SessionStatus::InProgress;
        self.started_at.get_or_insert(now);
        self.pause_metadata = None;
        self.error_message = None;
        self.updated_at = now;
    }

    /// Record a pause.
    pub fn mark_paused(&mut self, metadata: PauseMetadata) {
        self.status = SessionStatus::Paused;
        self.pause_metadata = Some(metadata);
        self.updated_at = Utc::now();
    }

    /// Record successful completion.
    pub fn mark_completed(&mut self, final_analysis: Option<String>) {
        let now = Utc::now();
        self.status = SessionStatus::Completed;
        self.final_analysis = final_analysis;
        self.pause_metadata = None;
        self.error_message = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Record failure with the aggregated error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = SessionStatus::Failed;
        self.error_message = Some(error.into());
        self.pause_metadata = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Record cancellation.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) {
        let now = Utc::now();
        self.status = SessionStatus::Cancelled;
        self.error_message = Some(reason.into());
        self.pause_metadata = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

impl StageExecution {
    /// Create a new pending stage execution
    pub fn new(
        session_id: impl Into<String>,
        stage_index: i64,
        stage_name: impl Into<String>,
        agent: impl Into<String>,
        kind: StageKind,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            stage_index,
            parallel_index: 0,
            stage_name: stage_name.into(),
            agent: agent.into(),
            kind,
            parent_execution_id: None,
            parallel_type: None,
            success_policy: None,
            iteration_strategy: None,
            chat_id: None,
            status: StageStatus::Pending,
            current_iteration: 0,
            started_at: None,
            paused_at: None,
            completed_at: None,
            error_message: None,
            stage_output: None,
            pause_metadata: None,
            conversation: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            created_at: Utc::now(),
        }
    }

    /// Make this a branch of a parallel parent
    pub fn with_parent(
        mut self,
        parent_execution_id: impl Into<String>,
        parallel_index: i64,
        parallel_type: ParallelType,
    ) -> Self {
        self.parent_execution_id = Some(parent_execution_id.into());
        self.parallel_index = parallel_index;
        self.parallel_type = Some(parallel_type);
        self
    }

    /// Set the parallel group shape and success policy of a parent
    pub fn with_parallel(mut self, parallel_type: ParallelType, policy: SuccessPolicy) -> Self {
        self.parallel_type = Some(parallel_type);
        self.success_policy = Some(policy);
        self
    }

    /// Set the iteration strategy used by the agent
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.iteration_strategy = Some(strategy);
        self
    }

    /// Attach to a chat
    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Start (or restart after a resume) executing.
    pub fn mark_active(&mut self) {
        self.status = StageStatus::Active;
        self.started_at.get_or_insert_with(Utc::now);
        self.current_iteration = 0;
        self.paused_at = None;
        self.pause_metadata = None;
        self.error_message = None;
        self.completed_at = None;
    }

    /// Record a pause together with the conversation needed to resume.
    pub fn mark_paused(&mut self, metadata: PauseMetadata, conversation: Option<Conversation>) {
        self.status = StageStatus::Paused;
        self.current_iteration = metadata.current_iteration;
        self.paused_at = Some(metadata.paused_at);
        self.pause_metadata = Some(metadata);
        self.conversation = conversation;
    }

    /// Record successful completion.
    pub fn mark_completed(&mut self, output: Option<String>) {
        self.status = StageStatus::Completed;
        self.stage_output = output;
        self.completed_at = Some(Utc::now());
        self.pause_metadata = None;
        self.paused_at = None;
        self.conversation = None;
    }

    /// Record failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StageStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
        self.pause_metadata = None;
        self.conversation = None;
    }

    /// Record cancellation.
    ///
    /// A paused execution is considered to have ended when it paused, so its
    /// `completed_at` is the pause time and the recorded duration covers
    /// active compute only.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) {
        let ended_at = match (self.status, self.paused_at) {
            (StageStatus::Paused, Some(paused_at)) => paused_at,
            _ => Utc::now(),
        };
        self.status = StageStatus::Cancelled;
        self.error_message = Some(reason.into());
        self.completed_at = Some(ended_at);
        self.pause_metadata = None;
        self.conversation = None;
    }

    /// Whether this execution is a branch of a parallel stage
    pub fn is_branch(&self) -> bool {
        self.parent_execution_id.is_some()
    }

    /// Wall-clock duration between start and completion
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

impl Chat {
    /// Create a new chat for a session
    pub fn new(
        session_id: impl Into<String>,
        created_by: impl Into<String>,
        context_snapshot: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            created_by: created_by.into(),
            context_snapshot: context_snapshot.into(),
            created_at: Utc::now(),
        }
    }
}

impl ChatMessage {
    /// Create a new chat message
    pub fn new(
        chat_id: impl Into<String>,
        role: ChatRole,
        author: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            role,
            author: author.into(),
            content: content.into(),
            stage_execution_id: None,
            created_at: Utc::now(),
        }
    }

    /// Link an assistant reply to the execution that produced it
    pub fn with_stage_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.stage_execution_id = Some(execution_id.into());
        self
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Storage trait for the session store.
///
/// The engine requires only these operations; any engine that provides them
/// with the documented atomicity can back it.
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Create a new session.
    async fn create_session(&self, session: &Session) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;
    /// Update an existing session. Token counters are not written.
    async fn update_session(&self, session: &Session) -> StorageResult<()>;
    /// List sessions, newest first.
    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        page: Page,
    ) -> StorageResult<Paged<Session>>;

    // Stage execution operations

    /// Create a new stage execution.
    async fn create_stage_execution(&self, execution: &StageExecution) -> StorageResult<()>;
    /// Get a stage execution by ID.
    async fn get_stage_execution(&self, id: &str) -> StorageResult<Option<StageExecution>>;
    /// Update an existing stage execution. Token counters are not written.
    async fn update_stage_execution(&self, execution: &StageExecution) -> StorageResult<()>;
    /// Persist the current iteration counter of a running execution.
    async fn set_stage_iteration(&self, id: &str, iteration: u32) -> StorageResult<()>;
    /// All executions of a session ordered by stage index then parallel index.
    async fn get_session_stage_executions(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<StageExecution>>;
    /// Branches of a parallel parent ordered by parallel index.
    async fn get_child_executions(&self, parent_id: &str) -> StorageResult<Vec<StageExecution>>;

    // Interaction operations

    /// Append an interaction and add its tokens to the owning stage
    /// execution and session, atomically.
    async fn append_interaction(&self, interaction: &Interaction) -> StorageResult<()>;
    /// Interactions of one stage execution in chronological order.
    async fn get_stage_interactions(&self, execution_id: &str) -> StorageResult<Vec<Interaction>>;
    /// The most recent interaction of a stage execution, or of the
    /// session-level log when `execution_id` is `None`.
    async fn get_last_interaction(
        &self,
        session_id: &str,
        execution_id: Option<&str>,
    ) -> StorageResult<Option<Interaction>>;
    /// Interactions of a whole session in chronological order.
    async fn get_session_interactions(
        &self,
        session_id: &str,
        page: Page,
    ) -> StorageResult<Paged<Interaction>>;

    // Chat operations

    /// Create a new chat.
    async fn create_chat(&self, chat: &Chat) -> StorageResult<()>;
    /// Get a chat by ID.
    async fn get_chat(&self, id: &str) -> StorageResult<Option<Chat>>;
    /// Chats of a session, oldest first.
    async fn get_session_chats(&self, session_id: &str) -> StorageResult<Vec<Chat>>;
    /// Append a chat message.
    async fn append_chat_message(&self, message: &ChatMessage) -> StorageResult<()>;
    /// List chat messages chronologically.
    async fn list_chat_messages(
        &self,
        chat_id: &str,
        page: Page,
    ) -> StorageResult<Paged<ChatMessage>>;
}
