//! External collaborator seams
//!
//! The engine never talks to a chat platform directly. The adapter layer
//! supplies an [`ActionExecutor`] that applies real-world effects and an
//! [`EventSink`] that receives structured case lifecycle events for the
//! operator's log channel.

use crate::cases::Case;
use crate::error::ExecutorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded retry policy for transient executor failures
const EXECUTOR_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Applies moderation effects on the chat platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn apply_ban(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: Option<String>,
    ) -> Result<(), ExecutorError>;

    async fn apply_kick(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: Option<String>,
    ) -> Result<(), ExecutorError>;

    async fn apply_timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        until: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), ExecutorError>;

    async fn remove_timeout(&self, guild_id: u64, user_id: u64) -> Result<(), ExecutorError>;

    async fn remove_ban(&self, guild_id: u64, user_id: u64) -> Result<(), ExecutorError>;

    /// Best-effort user-facing notice (warning received, limit reached)
    async fn send_notification(
        &self,
        guild_id: u64,
        user_id: u64,
        message: String,
    ) -> Result<(), ExecutorError>;
}

/// Run an executor call, retrying transient failures with doubling
/// backoff. Permanent failures surface immediately; the last transient
/// error surfaces once the attempt budget is spent.
pub async fn with_retry<F, Fut>(mut op: F) -> Result<(), ExecutorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ExecutorError>>,
{
    let mut backoff = RETRY_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(ExecutorError::Transient(msg)) if attempt < EXECUTOR_ATTEMPTS => {
                warn!(
                    target: crate::ERROR_TARGET,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or_default(),
                    "Transient executor failure, retrying: {msg}"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Receives structured case lifecycle events
pub trait EventSink: Send + Sync {
    fn case_created(&self, case: &Case);
    fn case_reversed(&self, source: &Case, reversal: &Case);
    fn scheduler_failure(&self, case: &Case, error: &ExecutorError);
}

/// Default sink: structured tracing events on the audit targets, which
/// the JSON file layer set up by [`crate::logging::init`] picks up
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn case_created(&self, case: &Case) {
        info!(
            target: crate::CASE_TARGET,
            guild_id = case.guild_id,
            case_id = case.case_id,
            kind = %case.kind,
            target_user_id = case.target_user_id,
            actor_id = case.actor_id,
            active = case.active,
            expires_at = ?case.expires_at,
            event = "case_created",
            "Moderation case created"
        );
    }

    fn case_reversed(&self, source: &Case, reversal: &Case) {
        info!(
            target: crate::CASE_TARGET,
            guild_id = source.guild_id,
            source_case_id = source.case_id,
            reversal_case_id = reversal.case_id,
            kind = %reversal.kind,
            target_user_id = source.target_user_id,
            event = "case_reversed",
            "Moderation case reversed"
        );
    }

    fn scheduler_failure(&self, case: &Case, error: &ExecutorError) {
        warn!(
            target: crate::SCHEDULER_TARGET,
            guild_id = case.guild_id,
            case_id = case.case_id,
            kind = %case.kind,
            target_user_id = case.target_user_id,
            error = %error,
            event = "scheduler_failure",
            "Expiry reversal failed; punishment resolved in ledger anyway"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExecutorError::Transient("rate limited".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecutorError::Transient("rate limited".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ExecutorError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), EXECUTOR_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_permanent_fails_without_retry() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecutorError::Permanent("missing permission".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ExecutorError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
