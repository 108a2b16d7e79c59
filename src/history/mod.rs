//! Interaction history.
//!
//! Every LLM round-trip and every tool discovery or call is recorded as an
//! [`Interaction`]. An [`InteractionLog`] is the single writer for one stage
//! execution (or for the session-level log when there is none); it assigns
//! sequence numbers and strictly increasing timestamps so that reading the
//! log back yields the exact chronological order.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::llm::{Conversation, LlmResponse, TokenUsage};
use crate::storage::Storage;

/// Purpose of an LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    /// Regular agent iteration.
    Investigation,
    /// Summary of an oversized tool result.
    Summarization,
    /// Extra tool-free call after the iteration budget ran out.
    ForcedConclusion,
    /// Synthesis of parallel branch results.
    FinalAnalysis,
    /// Executive summary of a completed session.
    FinalAnalysisSummary,
}

impl InteractionType {
    /// Get the type name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Investigation => "investigation",
            InteractionType::Summarization => "summarization",
            InteractionType::ForcedConclusion => "forced_conclusion",
            InteractionType::FinalAnalysis => "final_analysis",
            InteractionType::FinalAnalysisSummary => "final_analysis_summary",
        }
    }
}

impl std::fmt::Display for InteractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InteractionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "investigation" => Ok(InteractionType::Investigation),
            "summarization" => Ok(InteractionType::Summarization),
            "forced_conclusion" => Ok(InteractionType::ForcedConclusion),
            "final_analysis" => Ok(InteractionType::FinalAnalysis),
            "final_analysis_summary" => Ok(InteractionType::FinalAnalysisSummary),
            _ => Err(format!("Unknown interaction type: {}", s)),
        }
    }
}

/// Kind of tool server communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    ToolList,
    ToolCall,
}

/// One LLM round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmInteraction {
    pub interaction_type: InteractionType,
    /// Messages sent plus, on success, the assistant reply.
    pub conversation: Conversation,
    #[serde(default)]
    pub thinking: Option<String>,
    pub usage: TokenUsage,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One tool server exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInteraction {
    pub communication_type: CommunicationType,
    pub server: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
    /// Tool output, or the discovered tool names for a listing.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Payload of an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionDetails {
    Llm(LlmInteraction),
    Tool(ToolInteraction),
}

/// A recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub session_id: String,
    /// `None` for session-level calls such as the executive summary.
    pub stage_execution_id: Option<String>,
    /// Position within the owning log, starting at 1.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub details: InteractionDetails,
}

impl Interaction {
    /// Token usage carried by this interaction (zero for tool interactions)
    pub fn usage(&self) -> TokenUsage {
        match &self.details {
            InteractionDetails::Llm(llm) => llm.usage,
            InteractionDetails::Tool(_) => TokenUsage::default(),
        }
    }

    /// LLM interaction type, if this is an LLM interaction
    pub fn interaction_type(&self) -> Option<InteractionType> {
        match &self.details {
            InteractionDetails::Llm(llm) => Some(llm.interaction_type),
            InteractionDetails::Tool(_) => None,
        }
    }

    /// Whether the interaction succeeded
    pub fn success(&self) -> bool {
        match &self.details {
            InteractionDetails::Llm(llm) => llm.success,
            InteractionDetails::Tool(tool) => tool.success,
        }
    }
}

struct Cursor {
    next_sequence: i64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only writer for one execution unit's interactions.
pub struct InteractionLog {
    storage: Arc<dyn Storage>,
    session_id: String,
    stage_execution_id: Option<String>,
    cursor: Mutex<Cursor>,
}

impl InteractionLog {
    /// Open the log for a stage execution (or the session-level log),
    /// continuing after whatever was recorded before.
    pub async fn open(
        storage: Arc<dyn Storage>,
        session_id: impl Into<String>,
        stage_execution_id: Option<String>,
    ) -> StorageResult<Self> {
        let session_id = session_id.into();
        let last = storage
            .get_last_interaction(&session_id, stage_execution_id.as_deref())
            .await?;

        let cursor = match last {
            Some(interaction) => Cursor {
                next_sequence: interaction.sequence + 1,
                last_timestamp: Some(interaction.created_at),
            },
            None => Cursor {
                next_sequence: 1,
                last_timestamp: None,
            },
        };

        Ok(Self {
            storage,
            session_id,
            stage_execution_id,
            cursor: Mutex::new(cursor),
        })
    }

    /// Session this log belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stage execution this log belongs to
    pub fn stage_execution_id(&self) -> Option<&str> {
        self.stage_execution_id.as_deref()
    }

    /// Storage backing this log
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Append an interaction. Tokens roll up into the owning execution and
    /// session in the same storage transaction.
    pub async fn append(
        &self,
        details: InteractionDetails,
        duration_ms: i64,
    ) -> StorageResult<Interaction> {
        let mut cursor = self.cursor.lock().await;

        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(last) = cursor.last_timestamp {
            if created_at <= last {
                created_at = last + Duration::microseconds(1);
            }
        }

        let interaction = Interaction {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            stage_execution_id: self.stage_execution_id.clone(),
            sequence: cursor.next_sequence,
            created_at,
            duration_ms,
            details,
        };

        self.storage.append_interaction(&interaction).await?;

        cursor.next_sequence += 1;
        cursor.last_timestamp = Some(created_at);

        debug!(
            session_id = %self.session_id,
            stage_execution_id = ?self.stage_execution_id,
            sequence = interaction.sequence,
            "Interaction recorded"
        );

        Ok(interaction)
    }

    /// Record a successful LLM call. `conversation` must already contain the
    /// assistant reply.
    pub async fn record_llm(
        &self,
        interaction_type: InteractionType,
        conversation: Conversation,
        response: &LlmResponse,
        duration_ms: i64,
    ) -> StorageResult<Interaction> {
        self.append(
            InteractionDetails::Llm(LlmInteraction {
                interaction_type,
                conversation,
                thinking: response.thinking.clone(),
                usage: response.usage,
                success: true,
                error_message: None,
            }),
            duration_ms,
        )
        .await
    }

    /// Record a failed LLM call with zero tokens.
    pub async fn record_llm_failure(
        &self,
        interaction_type: InteractionType,
        conversation: Conversation,
        error: impl Into<String>,
        duration_ms: i64,
    ) -> StorageResult<Interaction> {
        self.append(
            InteractionDetails::Llm(LlmInteraction {
                interaction_type,
                conversation,
                thinking: None,
                usage: TokenUsage::default(),
                success: false,
                error_message: Some(error.into()),
            }),
            duration_ms,
        )
        .await
    }

    /// Record a tool server exchange.
    pub async fn record_tool(
        &self,
        interaction: ToolInteraction,
        duration_ms: i64,
    ) -> StorageResult<Interaction> {
        self.append(InteractionDetails::Tool(interaction), duration_ms)
            .await
    }

    /// Persist the running iteration counter of the owning execution.
    pub async fn record_iteration(&self, iteration: u32) -> StorageResult<()> {
        match &self.stage_execution_id {
            Some(id) => self.storage.set_stage_iteration(id, iteration).await,
            None => Ok(()),
        }
    }

    /// Conversation of the most recent successful LLM interaction in this log.
    pub async fn last_conversation(&self) -> StorageResult<Option<Conversation>> {
        let Some(id) = &self.stage_execution_id else {
            return Ok(None);
        };
        let interactions = self.storage.get_stage_interactions(id).await?;
        Ok(last_llm_conversation(&interactions))
    }
}

/// Conversation snapshot of the last successful LLM interaction in `interactions`.
pub fn last_llm_conversation(interactions: &[Interaction]) -> Option<Conversation> {
    interactions.iter().rev().find_map(|i| match &i.details {
        InteractionDetails::Llm(llm) if llm.success => Some(llm.conversation.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn llm(conversation: Conversation, success: bool) -> Interaction {
        Interaction {
            id: Uuid::new_v4().to_string(),
            session_id: "s".into(),
            stage_execution_id: Some("e".into()),
            sequence: 1,
            created_at: Utc::now(),
            duration_ms: 5,
            details: InteractionDetails::Llm(LlmInteraction {
                interaction_type: InteractionType::Investigation,
                conversation,
                thinking: None,
                usage: TokenUsage::new(10, 2),
                success,
                error_message: None,
            }),
        }
    }

    #[test]
    fn test_interaction_type_roundtrip() {
        for t in [
            InteractionType::Investigation,
            InteractionType::Summarization,
            InteractionType::ForcedConclusion,
            InteractionType::FinalAnalysis,
            InteractionType::FinalAnalysisSummary,
        ] {
            assert_eq!(t.as_str().parse::<InteractionType>().unwrap(), t);
        }
        assert!("bogus".parse::<InteractionType>().is_err());
    }

    #[test]
    fn test_tool_interaction_has_no_tokens() {
        let interaction = Interaction {
            details: InteractionDetails::Tool(ToolInteraction {
                communication_type: CommunicationType::ToolCall,
                server: "kubernetes".into(),
                tool: Some("get_pods".into()),
                arguments: None,
                result: None,
                success: true,
                error_message: None,
            }),
            ..llm(vec![], true)
        };
        assert_eq!(interaction.usage(), TokenUsage::default());
        assert_eq!(interaction.interaction_type(), None);
    }

    #[test]
    fn test_last_llm_conversation_skips_failures() {
        let good = vec![Message::user("first"), Message::assistant("reply")];
        let interactions = vec![llm(good.clone(), true), llm(vec![Message::user("x")], false)];
        assert_eq!(last_llm_conversation(&interactions), Some(good));
        assert_eq!(last_llm_conversation(&[]), None);
    }

    #[test]
    fn test_details_serialize_with_kind_tag() {
        let value = serde_json::to_value(llm(vec![], true).details).unwrap();
        assert_eq!(value["kind"], "llm");
        assert_eq!(value["interaction_type"], "investigation");
    }
}
