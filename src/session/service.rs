use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cancel::CancellationManager;
use super::dedup::{alert_fingerprint, AlertDeduplicator};
use super::pause::PauseResumeCoordinator;
use crate::agent::single_shot;
use crate::chain::{
    derive_parallel_status, Alert, AgentStageRunner, ChainContext, ChainDefinition,
    ChainExecutor, ParallelExecutionCoordinator, ParallelStatus, RunOverrides, SuccessPolicy,
    SynthesisRunner,
};
use crate::config::{EngineConfig, RequestConfig};
use crate::error::{EngineError, EngineResult};
use crate::history::{Interaction, InteractionLog, InteractionType};
use crate::llm::{LlmClient, Message};
use crate::prompts::EXECUTIVE_SUMMARY_PROMPT;
use crate::storage::{
    Page, Paged, Session, SessionFilter, SessionStatus, StageExecution, StageStatus, Storage,
};
use crate::tools::ToolServerFactory;

/// Error message for sessions found `in_progress` at startup.
pub const ORPHAN_ERROR_MESSAGE: &str =
    "Processing interrupted: service restarted while session was in progress";

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Nothing was running; the records were cancelled immediately.
    Cancelled,
    /// A running task was signalled and will stop at its next checkpoint.
    Cancelling,
}

/// A session with its stage executions.
#[derive(Debug, Clone)]
pub struct SessionDetail {
    pub session: Session,
    /// Ordered by stage index, then parallel index.
    pub stages: Vec<StageExecution>,
}

/// Entry point for alert investigations.
///
/// Each submitted alert becomes a session processed by one background task.
/// Status changes of a session are serialized through a per-session lock so
/// that completion, pause and cancellation never interleave.
#[derive(Clone)]
pub struct InvestigationService {
    storage: Arc<dyn Storage>,
    llm: Arc<dyn LlmClient>,
    request: RequestConfig,
    engine: EngineConfig,
    executor: ChainExecutor,
    cancellations: CancellationManager,
    dedup: AlertDeduplicator,
    pauses: PauseResumeCoordinator,
    tasks: Arc<Mutex<HashMap<String, SessionTask>>>,
    generations: Arc<AtomicU64>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Background task of a session. `generation` tells a finished task apart
/// from one spawned after it for the same session.
struct SessionTask {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl InvestigationService {
    /// Create a new service
    pub fn new(
        storage: Arc<dyn Storage>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolServerFactory>,
        engine: EngineConfig,
        request: RequestConfig,
    ) -> Self {
        Self::with_runner(AgentStageRunner::new(
            storage,
            llm,
            tools,
            engine,
            request,
        ))
    }

    /// Create a service around a configured stage runner
    pub fn with_runner(runner: AgentStageRunner) -> Self {
        let storage = runner.storage().clone();
        let llm = runner.llm().clone();
        let request = runner.request_config().clone();
        let engine = runner.engine_config().clone();
        let cancellations = CancellationManager::new();

        let executor = ChainExecutor::new(
            runner.clone(),
            ParallelExecutionCoordinator::new(runner, cancellations.clone()),
            SynthesisRunner::new(storage.clone(), llm.clone(), request.clone()),
        );

        Self {
            pauses: PauseResumeCoordinator::new(storage.clone()),
            storage,
            llm,
            request,
            engine,
            executor,
            cancellations,
            dedup: AlertDeduplicator::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Cancellation registry shared with running tasks
    pub fn cancellations(&self) -> &CancellationManager {
        &self.cancellations
    }

    // ========================================================================
    // Submission and processing
    // ========================================================================

    /// Submit an alert for investigation and start processing it.
    ///
    /// Returns the new session id. An identical alert that is still being
    /// processed is rejected with [`EngineError::DuplicateAlert`].
    pub async fn submit_alert(&self, alert: Alert, chain: ChainDefinition) -> EngineResult<String> {
        chain.validate()?;

        let fingerprint = alert_fingerprint(&alert);
        if !self.dedup.try_register(&fingerprint).await {
            warn!(fingerprint = %fingerprint, "Duplicate alert rejected");
            return Err(EngineError::DuplicateAlert { fingerprint });
        }

        let session = Session::new(alert, fingerprint.clone(), chain);
        if let Err(e) = self.storage.create_session(&session).await {
            self.dedup.release(&fingerprint).await;
            return Err(e.into());
        }

        info!(
            session_id = %session.id,
            alert_type = %session.alert.alert_type,
            chain_id = %session.chain.chain_id,
            "Alert submitted"
        );

        self.spawn(session.id.clone(), RunOverrides::default())
            .await;
        Ok(session.id)
    }

    /// Resume a paused session in the background.
    ///
    /// `overrides` apply to every agent run of the resumed execution.
    pub async fn resume(&self, session_id: &str, overrides: RunOverrides) -> EngineResult<()> {
        let _guard = self.lock_session(session_id).await;
        self.resume_locked(session_id, overrides).await
    }

    // Caller holds the session lock.
    async fn resume_locked(&self, session_id: &str, overrides: RunOverrides) -> EngineResult<()> {
        if self.cancellations.is_running(session_id).await {
            return Err(EngineError::InvalidState {
                message: format!("session {} is already running", session_id),
            });
        }
        let mut session = self.pauses.begin_resume(session_id).await?;
        session.mark_in_progress();
        self.storage.update_session(&session).await?;

        info!(
            session_id = %session_id,
            max_iterations = ?overrides.max_iterations,
            force_conclusion = ?overrides.force_conclusion,
            "Session resumed"
        );
        self.spawn(session_id.to_string(), overrides).await;
        Ok(())
    }

    /// Wait for the background task of a session, then return the session.
    pub async fn wait(&self, session_id: &str) -> EngineResult<Session> {
        let handle = self
            .tasks
            .lock()
            .await
            .get_mut(session_id)
            .and_then(|task| task.handle.take());
        if let Some(handle) = handle {
            handle.await.map_err(|e| EngineError::Internal {
                message: format!("session task failed: {}", e),
            })?;
        }
        self.get_session(session_id).await
    }

    // Registration and teardown both happen under the tasks lock, and
    // teardown only touches its own generation, so a task that is finishing
    // never removes the handle or token of a task spawned after it.
    async fn spawn(&self, session_id: String, overrides: RunOverrides) {
        let mut tasks = self.tasks.lock().await;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let token = self.cancellations.register_session(&session_id).await;
        let service = self.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = service.process(&id, overrides, &token).await {
                error!(session_id = %id, error = %e, "Session processing failed");
            }
            let mut tasks = service.tasks.lock().await;
            if tasks.get(&id).map(|t| t.generation) == Some(generation) {
                tasks.remove(&id);
                service.cancellations.unregister(&id).await;
            }
        });
        tasks.insert(
            session_id,
            SessionTask {
                generation,
                handle: Some(handle),
            },
        );
    }

    async fn process(
        &self,
        session_id: &str,
        overrides: RunOverrides,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let mut session = {
            let _guard = self.lock_session(session_id).await;
            let mut session = self.load(session_id).await?;
            if session.status.is_terminal() {
                return Ok(());
            }
            session.mark_in_progress();
            self.storage.update_session(&session).await?;
            session
        };

        info!(session_id = %session_id, "Session processing started");

        let (result, summary, _guard) = loop {
            let mut context = ChainContext::new(session.id.clone(), session.alert.clone());
            let result = self
                .executor
                .execute(&session.chain, &mut context, &overrides, cancel)
                .await;

            let summary = match &result {
                Ok(r) if r.status == SessionStatus::Completed => {
                    self.executive_summary(&session, r.final_analysis.as_deref(), cancel)
                        .await
                }
                _ => Ok(None),
            };

            let guard = self.lock_session(session_id).await;
            let paused = matches!(&result, Ok(r) if r.status == SessionStatus::Paused);
            if !paused || cancel.is_cancelled() || self.pauses.any_paused(session_id).await? {
                break (result, summary, guard);
            }
            // Every paused branch was cancelled while siblings were running.
            info!(session_id = %session_id, "No paused branch left, re-evaluating chain");
        };

        session = self.load(session_id).await?;

        match (result, summary) {
            (Ok(r), Ok(summary)) => match r.status {
                SessionStatus::Completed => {
                    session.executive_summary = summary;
                    session.mark_completed(r.final_analysis);
                    self.storage.update_session(&session).await?;
                    info!(session_id = %session_id, "Session completed");
                }
                SessionStatus::Paused => {
                    let metadata = r.pause_metadata.ok_or_else(|| EngineError::Internal {
                        message: "paused chain without pause metadata".to_string(),
                    })?;
                    self.pauses.record_pause(&mut session, metadata).await?;
                }
                _ => {
                    let message = r
                        .error
                        .unwrap_or_else(|| "Failed with no error message".to_string());
                    warn!(session_id = %session_id, error = %message, "Session failed");
                    session.mark_failed(message);
                    self.storage.update_session(&session).await?;
                }
            },
            (Err(e), _) | (Ok(_), Err(e)) if e.is_cancelled() => {
                let reason = match e {
                    EngineError::Cancelled { reason } => reason,
                    _ => crate::CANCELLED_BY_USER.to_string(),
                };
                self.pauses.cancel_paused(session_id, &reason).await?;
                session.mark_cancelled(reason);
                self.storage.update_session(&session).await?;
                info!(session_id = %session_id, "Session cancelled");
            }
            (Err(e), _) | (Ok(_), Err(e)) => {
                error!(session_id = %session_id, error = %e, "Session aborted");
                session.mark_failed(e.to_string());
                self.storage.update_session(&session).await?;
            }
        }

        // Still under the session lock: once the outcome is recorded the
        // session is no longer running, so cancel and resume see it as idle.
        self.cancellations.unregister(session_id).await;
        if session.status != SessionStatus::Paused {
            self.dedup.release(&session.alert_fingerprint).await;
        }
        if session.status.is_terminal() {
            self.forget_lock(session_id).await;
        }
        Ok(())
    }

    async fn executive_summary(
        &self,
        session: &Session,
        analysis: Option<&str>,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<String>> {
        let enabled = session
            .chain
            .executive_summary
            .unwrap_or(self.engine.executive_summary_enabled);
        let Some(analysis) = analysis.filter(|a| enabled && !a.trim().is_empty()) else {
            return Ok(None);
        };

        let log = InteractionLog::open(self.storage.clone(), session.id.clone(), None).await?;
        let messages = vec![
            Message::system(EXECUTIVE_SUMMARY_PROMPT),
            Message::user(analysis.to_string()),
        ];

        match single_shot(
            self.llm.as_ref(),
            &self.request,
            messages,
            InteractionType::FinalAnalysisSummary,
            &log,
            cancel,
        )
        .await
        {
            Ok(response) => Ok(Some(response.text.trim().to_string())),
            Err(EngineError::Llm(e)) => {
                warn!(session_id = %session.id, error = %e, "Executive summary failed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a session.
    ///
    /// A running session is signalled and stops at its next checkpoint. A
    /// paused session has no running task, so it and every paused execution
    /// are cancelled on the spot.
    pub async fn cancel(&self, session_id: &str) -> EngineResult<CancelOutcome> {
        let _guard = self.lock_session(session_id).await;
        let mut session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Err(EngineError::InvalidState {
                message: format!("session {} is already {}", session_id, session.status),
            });
        }

        if self.cancellations.cancel(session_id).await {
            info!(session_id = %session_id, "Session cancellation requested");
            return Ok(CancelOutcome::Cancelling);
        }

        let cancelled = self
            .pauses
            .cancel_paused(session_id, crate::CANCELLED_BY_USER)
            .await?;
        session.mark_cancelled(crate::CANCELLED_BY_USER);
        self.storage.update_session(&session).await?;
        self.dedup.release(&session.alert_fingerprint).await;
        self.forget_lock(session_id).await;

        info!(
            session_id = %session_id,
            executions = cancelled,
            "Paused session cancelled"
        );
        Ok(CancelOutcome::Cancelled)
    }

    /// Cancel one branch of a parallel stage.
    ///
    /// Siblings keep running. When the branch was paused and the stage no
    /// longer has any paused branch, the success policy is re-evaluated by
    /// resuming the session, which continues past the stage if the policy is
    /// already satisfied. If the session is still running, its task picks the
    /// cancelled branch up when the stage finishes.
    pub async fn cancel_branch(
        &self,
        session_id: &str,
        execution_id: &str,
    ) -> EngineResult<CancelOutcome> {
        let _guard = self.lock_session(session_id).await;
        let mut execution = self
            .storage
            .get_stage_execution(execution_id)
            .await?
            .filter(|e| e.session_id == session_id)
            .ok_or_else(|| EngineError::StageExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let Some(parent_id) = execution.parent_execution_id.clone() else {
            return Err(EngineError::InvalidState {
                message: format!("execution {} is not a parallel branch", execution_id),
            });
        };

        if self.cancellations.cancel(execution_id).await {
            info!(
                session_id = %session_id,
                execution_id = %execution_id,
                "Branch cancellation requested"
            );
            return Ok(CancelOutcome::Cancelling);
        }

        if execution.status != StageStatus::Paused {
            return Err(EngineError::InvalidState {
                message: format!(
                    "branch {} is {}, only running or paused branches can be cancelled",
                    execution_id, execution.status
                ),
            });
        }

        execution.mark_cancelled(crate::CANCELLED_BY_USER);
        self.storage.update_stage_execution(&execution).await?;
        info!(
            session_id = %session_id,
            execution_id = %execution_id,
            agent = %execution.agent,
            "Paused branch cancelled"
        );

        if self.cancellations.is_running(session_id).await {
            return Ok(CancelOutcome::Cancelled);
        }

        let parent = self
            .storage
            .get_stage_execution(&parent_id)
            .await?
            .ok_or_else(|| EngineError::StageExecutionNotFound {
                execution_id: parent_id.clone(),
            })?;
        let statuses: Vec<StageStatus> = self
            .storage
            .get_child_executions(&parent_id)
            .await?
            .iter()
            .map(|c| c.status)
            .collect();
        let policy = parent.success_policy.unwrap_or(SuccessPolicy::All);

        if derive_parallel_status(&statuses, policy) == ParallelStatus::Paused {
            self.refresh_pause_metadata(session_id).await?;
            return Ok(CancelOutcome::Cancelled);
        }

        self.resume_locked(session_id, RunOverrides::default()).await?;
        Ok(CancelOutcome::Cancelled)
    }

    async fn refresh_pause_metadata(&self, session_id: &str) -> EngineResult<()> {
        let metadata = self
            .pauses
            .paused_executions(session_id)
            .await?
            .into_iter()
            .find_map(|e| e.pause_metadata);
        if let Some(metadata) = metadata {
            let mut session = self.load(session_id).await?;
            session.pause_metadata = Some(metadata);
            self.storage.update_session(&session).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a session by id
    pub async fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        self.load(session_id).await
    }

    /// A session together with its stage executions
    pub async fn session_detail(&self, session_id: &str) -> EngineResult<SessionDetail> {
        let session = self.load(session_id).await?;
        let stages = self.storage.get_session_stage_executions(session_id).await?;
        Ok(SessionDetail { session, stages })
    }

    /// List sessions, newest first
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        page: Page,
    ) -> EngineResult<Paged<Session>> {
        Ok(self.storage.list_sessions(filter, page).await?)
    }

    /// Interactions of a session in chronological order
    pub async fn interactions(
        &self,
        session_id: &str,
        page: Page,
    ) -> EngineResult<Paged<Interaction>> {
        self.load(session_id).await?;
        Ok(self
            .storage
            .get_session_interactions(session_id, page)
            .await?)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Fail sessions left `in_progress` by a previous process.
    ///
    /// Call once at startup, before accepting work. Returns the number of
    /// sessions recovered.
    pub async fn recover_orphans(&self) -> EngineResult<usize> {
        let filter = SessionFilter {
            status: Some(SessionStatus::InProgress),
        };
        let mut recovered = 0;

        loop {
            // Recovered sessions leave the filter, so always read the first page.
            let page = self.storage.list_sessions(&filter, Page::default()).await?;
            if page.items.is_empty() {
                break;
            }

            for mut session in page.items {
                for mut execution in self
                    .storage
                    .get_session_stage_executions(&session.id)
                    .await?
                {
                    if matches!(execution.status, StageStatus::Active | StageStatus::Pending) {
                        execution.mark_failed(ORPHAN_ERROR_MESSAGE);
                        self.storage.update_stage_execution(&execution).await?;
                    }
                }
                session.mark_failed(ORPHAN_ERROR_MESSAGE);
                self.storage.update_session(&session).await?;
                recovered += 1;
                warn!(session_id = %session.id, "Orphaned session marked failed");
            }
        }

        if recovered > 0 {
            info!(sessions = recovered, "Orphan recovery finished");
        }
        Ok(recovered)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(&self, session_id: &str) -> EngineResult<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    // Terminal sessions take no further status changes.
    async fn forget_lock(&self, session_id: &str) {
        self.locks.lock().await.remove(session_id);
    }

    async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AgentSpec, StageDefinition};
    use crate::error::LlmResult;
    use crate::llm::{LlmRequest, LlmResponse, TokenUsage};
    use crate::storage::SqliteStorage;
    use crate::tools::StdioToolServerFactory;
    use async_trait::async_trait;

    struct Answering;

    #[async_trait]
    impl LlmClient for Answering {
        async fn generate(&self, _request: &LlmRequest) -> LlmResult<LlmResponse> {
            Ok(LlmResponse::text(
                "Thought: done.\nFinal Answer: disk full on node-3",
                TokenUsage::new(10, 5),
            ))
        }
    }

    #[tokio::test]
    async fn test_terminal_session_releases_its_lock() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let service = InvestigationService::new(
            storage,
            Arc::new(Answering),
            Arc::new(StdioToolServerFactory::default()),
            EngineConfig::default(),
            RequestConfig::default(),
        );
        let chain = ChainDefinition::new(
            "disk",
            vec![StageDefinition::single("collect", AgentSpec::new("NodeAgent"))],
        );
        let alert = Alert {
            alert_type: "DiskFull".into(),
            data: serde_json::json!({"node": "node-3"}),
            runbook: None,
        };

        let session_id = service.submit_alert(alert, chain).await.unwrap();
        let session = service.wait(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        assert!(service.locks.lock().await.is_empty());
        assert!(service.tasks.lock().await.is_empty());
        assert!(!service.cancellations.is_running(&session_id).await);
    }
}
