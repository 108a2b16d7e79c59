use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::client::LlmClient;
use super::types::{LlmRequest, LlmResponse};
use crate::config::RequestConfig;
use crate::error::{EngineError, EngineResult, LlmError};

/// Longest wait between two attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Back-off before retry number `retry` (1-based): `base_ms * 2^(retry - 1)`,
/// capped at [`MAX_RETRY_DELAY`].
pub fn retry_delay(base_ms: u64, retry: u32) -> Duration {
    let factor = 2_u64
        .checked_pow(retry.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Call the LLM, retrying transient failures with exponential back-off.
///
/// The cancellation token is checked before every attempt; a cancelled token
/// surfaces as [`EngineError::Cancelled`]. Fatal errors return immediately.
/// When retries are exhausted the last error is wrapped in
/// [`LlmError::Unavailable`].
pub async fn call_with_retry(
    client: &dyn LlmClient,
    request: &LlmRequest,
    config: &RequestConfig,
    cancel: &CancellationToken,
) -> EngineResult<LlmResponse> {
    let mut last_error = None;
    let mut retries = 0;

    while retries <= config.max_retries {
        if retries > 0 {
            let delay = retry_delay(config.retry_delay_ms, retries);
            warn!(
                session_id = %request.context.session_id,
                retry = retries,
                delay_ms = delay.as_millis(),
                "Retrying LLM request"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::cancelled_by_user());
        }

        let start = Instant::now();

        match client.generate(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() => {
                warn!(
                    session_id = %request.context.session_id,
                    error = %e,
                    latency_ms = start.elapsed().as_millis(),
                    retry = retries,
                    "Transient LLM failure"
                );
                last_error = Some(e);
                retries += 1;
            }
            Err(e) => {
                error!(
                    session_id = %request.context.session_id,
                    error = %e,
                    "LLM call failed"
                );
                return Err(e.into());
            }
        }
    }

    Err(LlmError::Unavailable {
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string()),
        retries: retries.saturating_sub(1),
    }
    .into())
}
