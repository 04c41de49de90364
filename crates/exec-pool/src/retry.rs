//! Declarative retry policy for delegated cluster calls.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::ClusterError;

/// Decides whether a failed attempt should be retried.
pub type RetryPredicate = fn(&ClusterError) -> bool;

/// How many times, how often and on which errors a delegated call is retried.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: u32,
    /// Errors for which another attempt is made.
    pub predicate: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            predicate: ClusterError::is_transient,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy for manifest applies: transient API errors plus "not found",
    /// which shows up while a fresh namespace propagates.
    #[must_use]
    pub fn manifest_apply() -> Self {
        Self {
            predicate: |e| e.is_transient() || e.is_not_found(),
            ..Self::default()
        }
    }

    /// Replace the retry predicate.
    #[must_use]
    pub fn retry_if(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Replace the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Replace the backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or the
    /// attempt budget is spent. The last error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && (self.predicate)(&e) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying after retryable error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_not_found_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::manifest_apply();

        let result = policy
            .run("apply", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClusterError::NotFound("namespaces/cluster-loader".into()))
                } else {
                    Ok("applied")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "applied");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), _> = policy
            .run("apply", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::NotFound("deployments/exec-pod".into()))
            })
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::manifest_apply().with_max_attempts(3);

        let result: Result<(), _> = policy
            .run("apply", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::NotFound("namespaces/cluster-loader".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn none_policy_runs_once() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::none()
            .retry_if(|_| true)
            .run("apply", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::Watch("closed".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
