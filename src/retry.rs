//! Bounded exponential backoff for catalog and index calls.
//!
//! Only errors for which [`SyncError::is_transient`] holds are retried:
//! - network errors and timeouts → retry
//! - HTTP 429 (rate limited) and 5xx → retry
//! - HTTP 401/403 and other 4xx → fail immediately
//!
//! Backoff doubles from `base_delay` and is capped at `max_delay`:
//! 1s, 2s, 4s, ... with the default policy.

use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }

    /// A policy that retries without sleeping. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << (retry.saturating_sub(1)).min(5);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The last error is returned unchanged so callers can still classify it.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Classify a non-success HTTP status from the catalog.
pub(crate) fn source_status_error(status: reqwest::StatusCode, body: &str) -> SyncError {
    let code = status.as_u16();
    if code == 401 || code == 403 {
        return SyncError::SourceAuth { status: code };
    }
    SyncError::SourceUnavailable {
        message: format!("HTTP {}: {}", status, truncate(body)),
        transient: code == 429 || status.is_server_error(),
    }
}

pub(crate) fn truncate(body: &str) -> String {
    body.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> SyncError {
        SyncError::TargetUnavailable {
            message: "503".into(),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(9), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = RetryPolicy::immediate(3)
            .run("op", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: SyncResult<()> = RetryPolicy::immediate(3)
            .run("op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert!(matches!(result, Err(SyncError::TargetUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: SyncResult<()> = RetryPolicy::immediate(3)
            .run("op", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::TargetAuth { status: 401 })
            })
            .await;
        assert!(matches!(result, Err(SyncError::TargetAuth { status: 401 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            source_status_error(StatusCode::UNAUTHORIZED, ""),
            SyncError::SourceAuth { status: 401 }
        ));
        assert!(source_status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(source_status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!source_status_error(StatusCode::NOT_FOUND, "").is_transient());
    }
}
