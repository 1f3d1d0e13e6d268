//! Bounded exponential backoff with retryable-error classification
//!
//! Transient store failures (throttling, connection resets, timeouts) are
//! retried with exponential backoff and optional jitter; everything else is
//! returned unwrapped after the first attempt. A small circuit breaker is
//! available as an optional guard around the retried call.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error substrings that indicate a transient failure worth retrying.
/// Everything else is treated as terminal.
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "timeout",
    "deadline exceeded",
    "SlowDown",
    "ServiceUnavailable",
    "InternalError",
    "RequestTimeout",
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The last attempt failed with a retryable error and the budget ran out.
    #[error("max retries exceeded: {0:#}")]
    Exhausted(anyhow::Error),

    /// The error was terminal; no further attempts were made.
    #[error("{0:#}")]
    Terminal(anyhow::Error),

    /// The run was cancelled during a backoff sleep.
    #[error("retry cancelled")]
    Cancelled,
}

impl RetryError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted(_))
    }
}

/// Run `f` up to `policy.max_attempts` times, sleeping between attempts.
///
/// Delay for attempt n is `min(initial * multiplier^(n-1), max_delay)`,
/// scaled by a uniform draw in [0.5, 1.0) when jitter is enabled.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryError::Terminal(err));
                }
                last_err = Some(err);
            }
        }

        if attempt == max_attempts {
            break;
        }

        let mut backoff = delay;
        if policy.jitter {
            backoff = backoff.mul_f64(0.5 + rand::random::<f64>() * 0.5);
        }

        debug!(
            op = op_name,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "retrying operation"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = sleep(backoff) => {}
        }

        delay = delay.mul_f64(policy.multiplier).min(policy.max_delay);
    }

    Err(RetryError::Exhausted(
        last_err.expect("at least one attempt ran"),
    ))
}

/// Classify an error by its textual form, including the context chain.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err);
    RETRYABLE_SUBSTRINGS.iter().any(|s| text.contains(s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips open after `max_failures` consecutive failures; while open, calls
/// are rejected until `reset_timeout` has elapsed since the last failure,
/// after which a single probe call is allowed through.
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

struct BreakerInner {
    failures: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        CircuitBreaker {
            max_failures: max_failures.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                failures: 0,
                last_failure: None,
                state: BreakerState::Closed,
            }),
        }
    }

    /// Whether a call may proceed. Transitions Open→HalfOpen once the reset
    /// timeout has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed > self.reset_timeout {
                inner.state = BreakerState::HalfOpen;
                inner.failures = 0;
                return true;
            }
            return false;
        }
        true
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failures >= self.max_failures {
            inner.state = BreakerState::Open;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state == BreakerState::Open
    }
}
