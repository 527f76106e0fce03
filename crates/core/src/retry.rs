//! Retry and backoff policy
//!
//! The backoff is a pure function of the attempt number: the base delay
//! times 3^attempt, scaled by a uniform jitter in [0.8, 1.2] and capped at
//! five minutes. Whether an error is retried at all is decided by the
//! [`Retrier`], never by the backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::sink::LogSink;

/// Upper bound for a single backoff delay
pub const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Lower jitter bound
pub const JITTER_MIN: f64 = 0.8;

/// Upper jitter bound
pub const JITTER_MAX: f64 = 1.2;

const GROWTH: f64 = 3.0;

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    /// Backoff starting at `base`
    pub const fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Delay before retrying after the failed `attempt` (0-based)
    pub fn delay(&self, attempt: u32, _err: &Error) -> Duration {
        let jitter = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Deterministic variant of [`delay`](Self::delay)
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * GROWTH.powi(exponent) * jitter;
        if !secs.is_finite() || secs >= MAX_DELAY.as_secs_f64() {
            MAX_DELAY
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Per-call attempt bookkeeping, dropped when the call resolves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far
    pub attempts: u32,
    /// Cumulative backoff wait so far
    pub waited: Duration,
}

/// Runs an operation under the retry policy
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
    backoff: Backoff,
}

impl Retrier {
    /// Create a retrier from configuration
    pub fn new(config: RetryConfig) -> Self {
        let backoff = Backoff::new(config.base_delay());
        Self { config, backoff }
    }

    /// The backoff policy in use
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Cancellation is checked before every attempt and interrupts a pending
    /// backoff sleep. When the attempt or wait budget runs out, the last
    /// transient error is returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &Context,
        sink: &dyn LogSink,
        op: &str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::default();
        loop {
            ctx.check()?;

            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            state.attempts += 1;
            if state.attempts >= self.config.max_attempts {
                sink.debug(&format!(
                    "{op}: giving up after {} attempts: {err}",
                    state.attempts
                ));
                return Err(err);
            }

            let delay = self.backoff.delay(state.attempts - 1, &err);
            if state.waited + delay > self.config.max_elapsed() {
                sink.debug(&format!(
                    "{op}: retry budget of {:?} exhausted: {err}",
                    self.config.max_elapsed()
                ));
                return Err(err);
            }

            sink.debug(&format!(
                "{op}: attempt {} failed ({err}), retrying in {delay:?}",
                state.attempts
            ));

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            state.waited += delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::sink::TracingSink;

    fn retrier(max_attempts: u32, max_elapsed_ms: u64) -> Retrier {
        Retrier::new(RetryConfig {
            max_attempts,
            base_delay_ms: 25,
            max_elapsed_ms,
        })
    }

    #[test]
    fn test_delay_grows_by_three() {
        let backoff = Backoff::new(Duration::from_millis(100));
        assert_eq!(backoff.delay_with_jitter(0, 1.0), Duration::from_millis(100));
        assert_eq!(backoff.delay_with_jitter(1, 1.0), Duration::from_millis(300));
        assert_eq!(backoff.delay_with_jitter(2, 1.0), Duration::from_millis(900));
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let backoff = Backoff::new(Duration::from_millis(25));
        let err = Error::Transient("503".into());
        for attempt in 0..200 {
            assert!(backoff.delay(attempt, &err) <= MAX_DELAY);
        }
        assert_eq!(backoff.delay_with_jitter(u32::MAX, JITTER_MAX), MAX_DELAY);
    }

    #[test]
    fn test_delay_non_decreasing_in_expectation() {
        let backoff = Backoff::new(Duration::from_millis(25));
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let expected = backoff.delay_with_jitter(attempt, 1.0);
            assert!(expected >= previous);
            previous = expected;
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::new(Duration::from_millis(1000));
        let err = Error::Transient("timeout".into());
        for _ in 0..100 {
            let d = backoff.delay(0, &err);
            assert!(d >= Duration::from_millis(799) && d <= Duration::from_millis(1201));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = retrier(5, 60_000)
            .run(&Context::new(), &TracingSink, "head_object", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Transient("slow down".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retrier(5, 60_000)
            .run(&Context::new(), &TracingSink, "get_object", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotFound("bucket/key".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retrier(4, 600_000)
            .run(&Context::new(), &TracingSink, "put_object", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transient(format!("attempt {n}")))
            })
            .await;

        assert!(matches!(result, Err(Error::Transient(msg)) if msg == "attempt 3"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_budget_stops_retries() {
        // 25ms, 75ms, 225ms ... a 50ms budget allows exactly one retry
        let calls = AtomicU32::new(0);
        let result: Result<()> = retrier(20, 50)
            .run(&Context::new(), &TracingSink, "list_objects", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Transient("reset".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_stops_before_attempt() {
        let ctx = Context::new();
        ctx.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retrier(5, 60_000)
            .run(&ctx, &TracingSink, "head_bucket", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        let result: Result<()> = retrier(20, 600_000)
            .run(&ctx, &TracingSink, "delete_object", || async {
                Err(Error::Transient("503".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
