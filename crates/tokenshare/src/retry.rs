//! Bounded retries with exponential backoff.
use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made, even if `max_attempts` is 0.
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The unbounded sequence of sleeps between attempts: `initial_delay`, doubled each
    /// time, never above `max_delay`.
    #[must_use]
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
        }
    }
}

/// Iterator over backoff delays, see [`RetryPolicy::delays`].
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        Some(current)
    }
}

/// Run `operation` until it succeeds or `policy` runs out of attempts.
///
/// Sleeps between attempts follow [`RetryPolicy::delays`]. `label` only names the
/// operation in logs and errors.
///
/// # Errors
/// - [`Error::RetryExhausted`] wrapping the last failure once all attempts failed.
/// - [`Error::Cancelled`] if `cancel` fires before an attempt or during a backoff sleep.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts;
    let mut delays = policy.delays();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("Operation `{label}` succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        tracing::warn!(
            "Operation `{label}` failed on attempt {attempt} of {max_attempts}: {error}"
        );

        if attempt >= max_attempts {
            tracing::error!("Operation `{label}` failed after {max_attempts} attempts");
            return Err(Error::RetryExhausted {
                operation: label.to_string(),
                attempts: attempt,
                source: Box::new(error),
            });
        }

        let delay = delays.next().unwrap_or(policy.max_delay);
        tracing::debug!("Waiting {}ms before retrying `{label}`", delay.as_millis());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                tracing::debug!("Retry of `{label}` cancelled during backoff");
                return Err(Error::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_backoff_doubles_up_to_max_delay() {
        let policy = RetryPolicy::new(10, ms(100), ms(1000));
        let delays: Vec<_> = policy.delays().take(7).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000), ms(1000)]
        );
    }

    #[test]
    fn test_initial_delay_is_capped() {
        let policy = RetryPolicy::new(1, ms(5000), ms(1000));
        assert_eq!(policy.delays().next(), Some(ms(1000)));
        assert_eq!(RetryPolicy::new(0, ms(1), ms(1)).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(4, ms(100), ms(1000));
        let started = tokio::time::Instant::now();

        let result = execute(&policy, "create-tokens", &CancellationToken::new(), || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0..=2 => Err(Error::provider("HTTP status 503")),
                    _ => Ok("token"),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "token");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400
        let elapsed = started.elapsed();
        assert!(elapsed >= ms(700) && elapsed < ms(800), "{elapsed:?}");
        assert!(logs_contain("failed on attempt 3 of 4"));
        assert!(!logs_contain("failed on attempt 4 of 4"));
        assert!(logs_contain("succeeded on attempt 4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, ms(100), ms(1000));

        let cancel = CancellationToken::new();

        let result: Result<()> = execute(&policy, "refresh-access-token", &cancel, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider(format!("failure {n}")))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            Error::RetryExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "refresh-access-token");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Provider(ref m) if m == "failure 2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<()> = execute(&policy, "create-tokens", &cancel, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::provider("unavailable"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(3, ms(100), ms(1000));

        let result = execute(&policy, "create-tokens", &cancel, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
