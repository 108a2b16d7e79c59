use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry of cancellation tokens for running sessions and branches.
///
/// Session tokens are roots; branch tokens are children of their session's
/// token, so cancelling a session reaches every branch while cancelling a
/// branch leaves its siblings alone.
#[derive(Debug, Clone, Default)]
pub struct CancellationManager {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a session's background task
    pub async fn register_session(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .await
            .insert(session_id.to_string(), token.clone());
        debug!(session_id = %session_id, "Cancellation token registered");
        token
    }

    /// Register a token for a running branch, derived from `parent`
    pub async fn register_child(
        &self,
        execution_id: &str,
        parent: &CancellationToken,
    ) -> CancellationToken {
        let token = parent.child_token();
        self.tokens
            .lock()
            .await
            .insert(execution_id.to_string(), token.clone());
        token
    }

    /// Forget a finished session or branch
    pub async fn unregister(&self, id: &str) {
        self.tokens.lock().await.remove(id);
    }

    /// Cancel a registered session or branch.
    ///
    /// Returns `false` when nothing is running under `id`.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.tokens.lock().await.get(id) {
            Some(token) => {
                token.cancel();
                debug!(id = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether a task is registered under `id`
    pub async fn is_running(&self, id: &str) -> bool {
        self.tokens.lock().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_branch_cancel_leaves_siblings() {
        let manager = CancellationManager::new();
        let session = manager.register_session("s1").await;
        let a = manager.register_child("a", &session).await;
        let b = manager.register_child("b", &session).await;

        assert!(manager.cancel("a").await);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn test_session_cancel_reaches_branches() {
        let manager = CancellationManager::new();
        let session = manager.register_session("s1").await;
        let branch = manager.register_child("a", &session).await;

        assert!(manager.cancel("s1").await);
        assert!(branch.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_cancelled() {
        let manager = CancellationManager::new();
        manager.register_session("s1").await;
        manager.unregister("s1").await;
        assert!(!manager.cancel("s1").await);
        assert!(!manager.is_running("s1").await);
    }
}
