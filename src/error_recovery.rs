//! Retry policy for opening transports.
//
// Exchanges are never retried: a failed refresh folds into the instrument
// status and the next poll tries again. Only port opening, which happens
// once at start-up, gets a bounded retry.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{AppResult, DaqError};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
pub async fn retry<T, F, Fut>(what: &str, policy: &RetryPolicy, mut operation: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts.max(1) {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("{}: attempt {} failed: {}", what, attempt, err);
                last_error = Some(err);
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(DaqError::Instrument(format!(
        "{}: failed after {} attempts ({})",
        what,
        policy.max_attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };

        let result = retry("open", &policy, move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                Ok(())
            } else {
                Err(DaqError::Transport("busy".to_string()))
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };

        let result: AppResult<()> = retry("open", &policy, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DaqError::Transport("no such port".to_string()))
        })
        .await;

        let err = result.unwrap_err().to_string();
        assert!(err.contains("3 attempts"));
        assert!(err.contains("no such port"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
