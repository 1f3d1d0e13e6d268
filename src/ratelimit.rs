//! Request pacing for the worker pool
//!
//! Three pacing modes: unlimited, a token bucket at a fixed QPS, and a
//! Poisson arrival process. Workers call [`RateLimiter::wait`] before every
//! operation; a wait that returns an error means the run is shutting down.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until the next operation may start, or until `cancel` fires.
    async fn wait(&self, cancel: &CancellationToken) -> Result<()>;

    /// Approximate number of available tokens. Diagnostic only.
    fn tokens(&self) -> f64;
}

/// No pacing: every wait returns immediately.
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn tokens(&self) -> f64 {
        f64::INFINITY
    }
}

/// Token bucket pacing at a fixed QPS with a burst of max(1, 10% of QPS).
pub struct FixedRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl FixedRateLimiter {
    pub fn new(qps: f64) -> Self {
        let burst = (qps * 0.1).max(1.0).floor();
        FixedRateLimiter {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if available, otherwise return how long to wait for one.
    fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - state.tokens) / self.qps))
        }
    }
}

#[async_trait]
impl RateLimiter for FixedRateLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let Some(delay) = self.try_take() else {
                return Ok(());
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("rate limit wait cancelled")),
                _ = sleep(delay) => {}
            }
        }
    }

    fn tokens(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.qps).min(self.burst)
    }
}

/// Poisson arrival process: inter-arrival delays are exponentially
/// distributed with mean 1/lambda.
pub struct PoissonRateLimiter {
    lambda: f64,
    dist: Option<Exp<f64>>,
    rng: Mutex<StdRng>,
}

impl PoissonRateLimiter {
    pub fn new(lambda: f64, seed: u64) -> Self {
        let dist = if lambda > 0.0 && lambda.is_finite() {
            Some(Exp::new(lambda).expect("lambda validated positive"))
        } else {
            None
        };
        PoissonRateLimiter {
            lambda,
            dist,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl RateLimiter for PoissonRateLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(dist) = &self.dist else {
            return Ok(());
        };
        let delay_secs = {
            let mut rng = self.rng.lock().unwrap();
            dist.sample(&mut *rng)
        };
        if delay_secs <= 0.0 || !delay_secs.is_finite() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("rate limit wait cancelled")),
            _ = sleep(Duration::from_secs_f64(delay_secs)) => Ok(()),
        }
    }

    fn tokens(&self) -> f64 {
        self.lambda
    }
}

/// Build a rate limiter from the configured type and limit. A non-positive
/// limit disables pacing; an unrecognized type falls back to the token
/// bucket.
pub fn create_rate_limiter(rate_type: &str, limit: f64, seed: u64) -> Arc<dyn RateLimiter> {
    if limit <= 0.0 {
        return Arc::new(NoopRateLimiter);
    }
    match rate_type {
        "poisson" => Arc::new(PoissonRateLimiter::new(limit, seed)),
        _ => Arc::new(FixedRateLimiter::new(limit)),
    }
}
