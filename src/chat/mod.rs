//! Follow-up chat on finished investigations.
//!
//! A chat captures the analyses of a terminal session once. Every posted
//! question runs the chain's chat agent as a new stage execution, seeded with
//! that snapshot and the earlier exchanges of the chat. Chat runs always
//! conclude at the iteration limit instead of pausing.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{AgentSpec, AgentStageRunner, RunOverrides, StagePrompt, StageRunOutcome, CHAT_AGENT};
use crate::error::{EngineError, EngineResult, StorageError};
use crate::prompts::CHAT_SYSTEM_PROMPT;
use crate::storage::{
    Chat, ChatMessage, ChatRole, Page, Paged, Session, StageExecution, StageKind, StageStatus,
    Storage,
};

/// Stage name recorded on chat executions.
pub const CHAT_STAGE_NAME: &str = "chat";

/// Creates chats and answers their messages.
#[derive(Clone)]
pub struct ChatService {
    storage: Arc<dyn Storage>,
    runner: AgentStageRunner,
    // Serializes stage index allocation across concurrent posts. Agent runs
    // happen outside it.
    post_lock: Arc<Mutex<()>>,
}

impl ChatService {
    /// Create a new chat service
    pub fn new(runner: AgentStageRunner) -> Self {
        Self {
            storage: runner.storage().clone(),
            runner,
            post_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Start a chat on a terminal session.
    pub async fn create_chat(&self, session_id: &str, created_by: &str) -> EngineResult<Chat> {
        let session = self.load_session(session_id).await?;
        if !session.status.is_terminal() {
            return Err(EngineError::InvalidState {
                message: format!(
                    "session {} is {}, chats need a finished session",
                    session_id, session.status
                ),
            });
        }

        let stages = self.storage.get_session_stage_executions(session_id).await?;
        let chat = Chat::new(session_id, created_by, context_snapshot(&session, &stages));
        self.storage.create_chat(&chat).await?;

        info!(
            session_id = %session_id,
            chat_id = %chat.chat_id,
            created_by = %created_by,
            "Chat created"
        );
        Ok(chat)
    }

    /// Post a question and run the chat agent on it.
    ///
    /// Returns the assistant reply. When the agent run fails the user
    /// message stays stored and the error is returned.
    pub async fn post_message(
        &self,
        chat_id: &str,
        content: &str,
        author: &str,
    ) -> EngineResult<ChatMessage> {
        let chat = self
            .storage
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| StorageError::ChatNotFound {
                chat_id: chat_id.to_string(),
            })?;
        let session = self.load_session(&chat.session_id).await?;
        let agent = session
            .chain
            .chat_agent
            .clone()
            .unwrap_or_else(|| AgentSpec::new(CHAT_AGENT));

        let guard = self.post_lock.lock().await;

        let history = self
            .storage
            .list_chat_messages(chat_id, Page::new(0, 1000))
            .await?
            .items;
        let question = ChatMessage::new(chat_id, ChatRole::User, author, content);
        self.storage.append_chat_message(&question).await?;

        let stage_index = self
            .storage
            .get_session_stage_executions(&session.id)
            .await?
            .iter()
            .map(|e| e.stage_index)
            .max()
            .map_or(0, |i| i + 1);
        let mut execution = StageExecution::new(
            session.id.clone(),
            stage_index,
            CHAT_STAGE_NAME,
            agent.name.clone(),
            StageKind::Chat,
        )
        .with_chat(chat_id)
        .with_strategy(agent.iteration_strategy);
        self.storage.create_stage_execution(&execution).await?;
        drop(guard);

        info!(
            session_id = %session.id,
            chat_id = %chat_id,
            execution_id = %execution.execution_id,
            agent = %agent.name,
            "Chat message posted"
        );

        let prompt = StagePrompt::new(
            CHAT_SYSTEM_PROMPT,
            chat_task(&chat.context_snapshot, &history, content),
        );
        let overrides = RunOverrides {
            max_iterations: None,
            force_conclusion: Some(true),
        };

        let outcome = self
            .runner
            .run(
                &mut execution,
                &agent,
                &prompt,
                &overrides,
                &CancellationToken::new(),
            )
            .await?;

        let answer = match outcome {
            StageRunOutcome::Completed { analysis } => analysis,
            StageRunOutcome::Failed { error } => {
                warn!(chat_id = %chat_id, error = %error, "Chat agent failed");
                return Err(EngineError::Internal {
                    message: format!("chat agent failed: {}", error),
                });
            }
            StageRunOutcome::Paused(_) => {
                return Err(EngineError::InvalidState {
                    message: "chat agent paused despite forced conclusion".to_string(),
                });
            }
        };

        let reply = ChatMessage::new(chat_id, ChatRole::Assistant, agent.name, answer)
            .with_stage_execution(execution.execution_id);
        self.storage.append_chat_message(&reply).await?;
        Ok(reply)
    }

    /// Messages of a chat in chronological order
    pub async fn list_messages(&self, chat_id: &str, page: Page) -> EngineResult<Paged<ChatMessage>> {
        Ok(self.storage.list_chat_messages(chat_id, page).await?)
    }

    /// Chats of a session
    pub async fn session_chats(&self, session_id: &str) -> EngineResult<Vec<Chat>> {
        Ok(self.storage.get_session_chats(session_id).await?)
    }

    async fn load_session(&self, session_id: &str) -> EngineResult<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }
}

/// Render the investigation history a chat is seeded with.
fn context_snapshot(session: &Session, stages: &[StageExecution]) -> String {
    let mut snapshot = format!(
        "## Alert\nType: {}\n```json\n{}\n```\n\n## Investigation ({})\n",
        session.alert.alert_type,
        serde_json::to_string_pretty(&session.alert.data).unwrap_or_default(),
        session.status
    );

    for stage in stages
        .iter()
        .filter(|s| s.chat_id.is_none() && s.status == StageStatus::Completed)
    {
        if let Some(output) = stage.stage_output.as_deref().filter(|o| !o.is_empty()) {
            snapshot.push_str(&format!(
                "\n### {} ({})\n{}\n",
                stage.stage_name, stage.agent, output
            ));
        }
    }

    if let Some(analysis) = &session.final_analysis {
        snapshot.push_str("\n## Final Analysis\n");
        snapshot.push_str(analysis);
        snapshot.push('\n');
    }
    if let Some(error) = &session.error_message {
        snapshot.push_str("\n## Outcome\n");
        snapshot.push_str(error);
        snapshot.push('\n');
    }
    snapshot
}

fn chat_task(snapshot: &str, history: &[ChatMessage], question: &str) -> String {
    let mut task = snapshot.to_string();
    if !history.is_empty() {
        task.push_str("\n## Conversation So Far\n");
        for message in history {
            task.push_str(&format!(
                "\n**{} ({})**: {}\n",
                message.author, message.role, message.content
            ));
        }
    }
    task.push_str("\n## Question\n");
    task.push_str(question);
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Alert, ChainDefinition};

    fn finished_session() -> Session {
        let mut session = Session::new(
            Alert {
                alert_type: "DiskFull".into(),
                data: serde_json::json!({"node": "n1"}),
                runbook: None,
            },
            "fp",
            ChainDefinition::new("disk", vec![]),
        );
        session.mark_completed(Some("Log rotation was disabled".into()));
        session
    }

    #[test]
    fn test_snapshot_skips_unfinished_and_chat_stages() {
        let session = finished_session();
        let mut done = StageExecution::new(&session.id, 0, "collect", "DiskAgent", StageKind::Single);
        done.mark_completed(Some("/var/log is 98% full".into()));
        let mut failed = StageExecution::new(&session.id, 1, "verify", "LogAgent", StageKind::Single);
        failed.mark_failed("boom");
        let mut chat = StageExecution::new(&session.id, 2, CHAT_STAGE_NAME, CHAT_AGENT, StageKind::Chat)
            .with_chat("c1");
        chat.mark_completed(Some("earlier answer".into()));

        let snapshot = context_snapshot(&session, &[done, failed, chat]);
        assert!(snapshot.contains("### collect (DiskAgent)\n/var/log is 98% full"));
        assert!(!snapshot.contains("LogAgent"));
        assert!(!snapshot.contains("earlier answer"));
        assert!(snapshot.contains("## Final Analysis\nLog rotation was disabled"));
    }

    #[test]
    fn test_chat_task_includes_history() {
        let history = vec![
            ChatMessage::new("c1", ChatRole::User, "alice", "Which node?"),
            ChatMessage::new("c1", ChatRole::Assistant, CHAT_AGENT, "n1"),
        ];
        let task = chat_task("SNAPSHOT", &history, "Is it fixed?");
        assert!(task.starts_with("SNAPSHOT"));
        assert!(task.contains("**alice (user)**: Which node?"));
        assert!(task.contains("**ChatAgent (assistant)**: n1"));
        assert!(task.ends_with("## Question\nIs it fixed?"));
    }
}
