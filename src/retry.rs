//! Timeout and exponential backoff for external calls.
//!
//! Every call to the document source, the embedding provider and the
//! vector index goes through [`RetryPolicy::run`]:
//!
//! - each attempt is bounded by `call_timeout`; a timeout counts as the
//!   transient error for the call's [`ExternalCall`] kind
//! - transient errors (see [`Error::is_transient`]) are retried
//! - anything else is returned immediately
//! - backoff doubles from `base_delay`, capped at `max_delay`

use std::future::Future;
use std::time::Duration;

use notion_index_core::{Error, Result};
use tracing::{debug, warn};

/// Which collaborator a call goes to. Decides the error a timeout maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCall {
    Source,
    Embedding,
    IndexWrite,
    IndexRead,
}

impl ExternalCall {
    fn timeout_error(self, label: &str, after: Duration) -> Error {
        let msg = format!("{} timed out after {:?}", label, after);
        match self {
            Self::Source => Error::SourceUnavailable(msg),
            Self::Embedding => Error::EmbeddingUnavailable(msg),
            Self::IndexWrite => Error::IndexWriteFailure(msg),
            Self::IndexRead => Error::IndexReadFailure(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, kind: ExternalCall, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(kind.timeout_error(label, self.call_timeout)),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(call = label, attempt, ?delay, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(call = label, attempt, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let out = RetryPolicy::immediate(3)
            .run(ExternalCall::Source, "get_node", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::source_unavailable("503"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_surfaces_last_error() {
        let calls = &AtomicU32::new(0);
        let out: Result<()> = RetryPolicy::immediate(2)
            .run(ExternalCall::Embedding, "embed", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::embedding_unavailable("429"))
            })
            .await;
        assert_eq!(out, Err(Error::embedding_unavailable("429")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let out: Result<()> = RetryPolicy::immediate(5)
            .run(ExternalCall::Source, "get_node", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::source_not_found("root"))
            })
            .await;
        assert!(matches!(out, Err(Error::SourceNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_call_kind() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_millis(50),
        };
        let out: Result<()> = policy
            .run(ExternalCall::IndexWrite, "upsert", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(Error::IndexWriteFailure(_))));
    }
}
