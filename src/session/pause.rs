use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::storage::{
    PauseMetadata, Session, SessionStatus, StageExecution, StageKind, StageStatus, Storage,
};

/// Pause bookkeeping at the session level.
///
/// Stage executions record their own pause (status, metadata and the
/// conversation to resume from); this type keeps the session's view in step
/// with them.
#[derive(Clone)]
pub struct PauseResumeCoordinator {
    storage: Arc<dyn Storage>,
}

impl PauseResumeCoordinator {
    /// Create a new coordinator
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Record a chain pause on the session, replacing any earlier metadata.
    pub async fn record_pause(
        &self,
        session: &mut Session,
        metadata: PauseMetadata,
    ) -> EngineResult<()> {
        info!(
            session_id = %session.id,
            iteration = metadata.current_iteration,
            reason = %metadata.reason.as_str(),
            "Session paused"
        );
        session.mark_paused(metadata);
        self.storage.update_session(session).await?;
        Ok(())
    }

    /// Load a session that is about to be resumed.
    pub async fn begin_resume(&self, session_id: &str) -> EngineResult<Session> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        if session.status != SessionStatus::Paused {
            return Err(EngineError::InvalidState {
                message: format!(
                    "session {} is {}, only paused sessions can be resumed",
                    session_id, session.status
                ),
            });
        }
        Ok(session)
    }

    /// Every paused execution of a session, parents and branches alike
    pub async fn paused_executions(&self, session_id: &str) -> EngineResult<Vec<StageExecution>> {
        Ok(self
            .storage
            .get_session_stage_executions(session_id)
            .await?
            .into_iter()
            .filter(|e| e.status == StageStatus::Paused)
            .collect())
    }

    /// Whether any agent run of the session is still paused.
    ///
    /// Parallel parents only mirror their branches and are not counted.
    pub async fn any_paused(&self, session_id: &str) -> EngineResult<bool> {
        Ok(self
            .paused_executions(session_id)
            .await?
            .iter()
            .any(|e| e.kind != StageKind::Parallel))
    }

    /// Cancel every paused execution of a session.
    ///
    /// Each one ends at its pause time. Returns how many were cancelled.
    pub async fn cancel_paused(&self, session_id: &str, reason: &str) -> EngineResult<usize> {
        let paused = self.paused_executions(session_id).await?;
        for mut execution in paused.iter().cloned() {
            execution.mark_cancelled(reason);
            self.storage.update_stage_execution(&execution).await?;
        }
        Ok(paused.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Alert, ChainDefinition, ParallelType};
    use crate::storage::SqliteStorage;

    async fn setup() -> (Arc<dyn Storage>, Session) {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let session = Session::new(
            Alert {
                alert_type: "Test".into(),
                data: serde_json::json!({}),
                runbook: None,
            },
            "fp",
            ChainDefinition::new("c", vec![]),
        );
        storage.create_session(&session).await.unwrap();
        (storage, session)
    }

    #[tokio::test]
    async fn test_begin_resume_requires_paused_session() {
        let (storage, mut session) = setup().await;
        let pauses = PauseResumeCoordinator::new(storage.clone());

        assert!(matches!(
            pauses.begin_resume(&session.id).await,
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            pauses.begin_resume("missing").await,
            Err(EngineError::SessionNotFound { .. })
        ));

        pauses
            .record_pause(&mut session, PauseMetadata::max_iterations(2))
            .await
            .unwrap();
        let loaded = pauses.begin_resume(&session.id).await.unwrap();
        assert_eq!(loaded.pause_metadata.unwrap().current_iteration, 2);
    }

    #[tokio::test]
    async fn test_cancel_paused_keeps_pause_time() {
        let (storage, session) = setup().await;
        let pauses = PauseResumeCoordinator::new(storage.clone());

        let mut execution = StageExecution::new(&session.id, 0, "collect", "A", StageKind::Single);
        storage.create_stage_execution(&execution).await.unwrap();
        execution.mark_active();
        let metadata = PauseMetadata::max_iterations(1);
        let paused_at = metadata.paused_at;
        execution.mark_paused(metadata, None);
        storage.update_stage_execution(&execution).await.unwrap();

        assert!(pauses.any_paused(&session.id).await.unwrap());
        assert_eq!(
            pauses.cancel_paused(&session.id, crate::CANCELLED_BY_USER).await.unwrap(),
            1
        );
        assert!(!pauses.any_paused(&session.id).await.unwrap());

        let stored = storage
            .get_stage_execution(&execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, StageStatus::Cancelled);
        assert_eq!(stored.completed_at, Some(paused_at));
        assert_eq!(stored.error_message.as_deref(), Some(crate::CANCELLED_BY_USER));
    }

    #[tokio::test]
    async fn test_paused_parent_without_paused_branch_is_not_paused() {
        let (storage, session) = setup().await;
        let pauses = PauseResumeCoordinator::new(storage.clone());

        let mut parent =
            StageExecution::new(&session.id, 0, "investigate", "parallel", StageKind::Parallel);
        storage.create_stage_execution(&parent).await.unwrap();
        let mut branch = StageExecution::new(&session.id, 0, "investigate", "A", StageKind::Branch)
            .with_parent(parent.execution_id.clone(), 1, ParallelType::MultiAgent);
        storage.create_stage_execution(&branch).await.unwrap();

        parent.mark_active();
        parent.mark_paused(PauseMetadata::max_iterations(1), None);
        storage.update_stage_execution(&parent).await.unwrap();
        branch.mark_active();
        branch.mark_paused(PauseMetadata::max_iterations(1), None);
        storage.update_stage_execution(&branch).await.unwrap();
        assert!(pauses.any_paused(&session.id).await.unwrap());

        branch.mark_cancelled(crate::CANCELLED_BY_USER);
        storage.update_stage_execution(&branch).await.unwrap();
        assert_eq!(pauses.paused_executions(&session.id).await.unwrap().len(), 1);
        assert!(!pauses.any_paused(&session.id).await.unwrap());
    }
}
