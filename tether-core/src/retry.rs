//! Bounded retry with linear backoff for transient control-plane failures.

use std::future::Future;
use std::time::Duration;

use tokio::time;
use tracing::debug;

/// Attempt budget used by call sites with no reason to deviate.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Classification of a failed attempt, chosen by the retried operation.
///
/// Returning `Abort` marks the failure permanent: the policy stops
/// immediately and hands the wrapped cause back to the caller.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Transient failure; worth another attempt after a delay.
    Transient(E),
    /// Permanent failure; retrying cannot help.
    Abort(E),
}

/// Linear-backoff retry policy.
///
/// Stateless across invocations; concurrent `run` calls are fully
/// independent. The backoff sleep suspends only the calling task.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts. Zero performs no attempts at all.
    pub max_attempts: u32,
    /// Attempt `n` waits `n * base_delay` before running (the first
    /// attempt is immediate).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Run `op` until it succeeds, aborts, or the attempt budget is spent.
    ///
    /// Returns `Ok(Some(value))` on success and `Ok(None)` for a zero
    /// budget, in which case `op` is never called. An `Abort` failure
    /// returns its unwrapped cause immediately; an exhausted budget
    /// returns the last transient cause.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<Option<T>, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RetryError<E>>>,
    {
        let mut last = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                time::sleep(self.base_delay * attempt).await;
            }
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(RetryError::Abort(cause)) => return Err(cause),
                Err(RetryError::Transient(cause)) => {
                    debug!(
                        "attempt {}/{} failed transiently: {}",
                        attempt + 1,
                        self.max_attempts,
                        cause
                    );
                    last = Some(cause);
                }
            }
        }
        match last {
            Some(cause) => Err(cause),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out: Result<Option<u32>, String> = fast(5)
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_consume_the_whole_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out: Result<Option<u32>, String> = fast(3)
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(RetryError::Transient(format!("boom {}", n)))
                }
            })
            .await;
        assert_eq!(out.unwrap_err(), "boom 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_short_circuits_after_one_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out: Result<Option<u32>, String> = fast(5)
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RetryError::Abort("no such resource".to_string()))
                }
            })
            .await;
        assert_eq!(out.unwrap_err(), "no such resource");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_budget_never_calls_the_op() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out: Result<Option<u32>, String> = fast(0)
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RetryError::Transient("unreachable".to_string()))
                }
            })
            .await;
        assert_eq!(out.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let out: Result<Option<&'static str>, String> = fast(5)
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RetryError::Transient("locked".to_string()))
                    } else {
                        Ok("attached")
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), Some("attached"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
