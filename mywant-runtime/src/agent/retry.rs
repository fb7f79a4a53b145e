//! Retry/backoff execution of one agent action (spec.md §4.6 "Retry and
//! timeout policy"). Grounded on `backoff::ExponentialBackoff`, the same
//! crate the teacher's controller runtime uses for watch-stream reconnects.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

use mywant_core::{AgentError, RetryPolicy};

/// Drives repeated attempts of a fallible agent action under a
/// [`RetryPolicy`]: transport failures back off and retry up to
/// `max_attempts`; an agent-reported failure (`AgentError::AgentReported`)
/// is not retryable and returns immediately (spec.md §7).
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(self.policy.initial_interval_millis),
            initial_interval: Duration::from_millis(self.policy.initial_interval_millis),
            randomization_factor: if self.policy.jitter { 0.5 } else { 0.0 },
            multiplier: self.policy.multiplier,
            max_interval: Duration::from_millis(self.policy.max_interval_millis),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    pub async fn run<F, Fut, T>(&self, mut action: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match action().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= self.policy.max_attempts => return Err(err),
                Err(_) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.policy.max_interval_millis));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transport_errors_up_to_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval_millis: 1,
            multiplier: 1.0,
            max_interval_millis: 2,
            jitter: false,
        };
        let executor = RetryExecutor::new(policy);
        let calls = AtomicU32::new(0);
        let result: Result<(), AgentError> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AgentError::Transport {
                        want_id: "w1".into(),
                        agent_name: "a".into(),
                        reason: "down".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn agent_reported_failure_is_not_retried() {
        let policy = RetryPolicy::default();
        let executor = RetryExecutor::new(policy);
        let calls = AtomicU32::new(0);
        let result: Result<(), AgentError> = executor
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AgentError::AgentReported {
                        want_id: "w1".into(),
                        agent_name: "a".into(),
                        reason: "nope".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let result = executor.run(|| async { Ok::<_, AgentError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
