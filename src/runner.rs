//! Workload orchestration
//!
//! The runner owns the worker pool. Each worker loops: check stop conditions,
//! wait on the rate limiter, draw (op, key) from the scheduler, and dispatch
//! with a per-op timeout through the retry policy. Per-op failures are logged
//! at debug and never kill a worker; only setup failures escape `run()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hdrhistogram::Histogram;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, Versioning};
use crate::data::Generator;
use crate::keyspace::KeySpace;
use crate::metrics::{MetricsSink, OpStatus};
use crate::multipart::MultipartCoordinator;
use crate::ratelimit::{create_rate_limiter, RateLimiter};
use crate::retry::{with_retry, CircuitBreaker, RetryPolicy};
use crate::scheduler::{should_verify, OpKind, Scheduler};
use crate::size_generator::SizeGenerator;
use crate::store::{InstrumentedStore, ObjectStore};
use crate::verify::{
    prepare_metadata, Verifier, METADATA_KEY_CREATED_BY, METADATA_VALUE_CREATED_BY,
};

/// Everything the worker tasks share.
struct Shared {
    cfg: Config,
    store: Arc<dyn ObjectStore>,
    generator: Arc<Generator>,
    verifier: Verifier,
    scheduler: Scheduler,
    keyspace: KeySpace,
    size_dist: SizeGenerator,
    limiter: Arc<dyn RateLimiter>,
    multipart: MultipartCoordinator,
    breaker: Option<CircuitBreaker>,
    metrics: Arc<dyn MetricsSink>,
    retry_policy: RetryPolicy,
    ops_counter: AtomicU64,
    seed: u64,
}

pub struct Runner {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Runner {
    /// Wire up the engine from a validated config, an object store backend,
    /// and a metrics sink. The store is wrapped with the instrumentation
    /// decorator here so every operation records counters and latency.
    pub fn new(
        cfg: Config,
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let seed = cfg.seed.unwrap_or_else(rand::random);

        let generator =
            Arc::new(Generator::new(&cfg.pattern).context("failed to create data generator")?);
        let verifier = Verifier::new(generator.clone());
        let scheduler = Scheduler::new(&cfg.mix, cfg.keys, seed)
            .context("failed to create scheduler")?;
        let keyspace = KeySpace::new(cfg.prefix.clone(), cfg.key_template.clone(), cfg.keys);
        let size_dist = SizeGenerator::parse(&cfg.size, seed.wrapping_add(1))
            .context("failed to parse size distribution")?;
        let limiter = create_rate_limiter(
            cfg.rate_type.as_str(),
            cfg.rate_limit,
            seed.wrapping_add(2),
        );

        let store: Arc<dyn ObjectStore> =
            Arc::new(InstrumentedStore::new(store, metrics.clone()));
        let multipart = MultipartCoordinator::new(
            store.clone(),
            metrics.clone(),
            cfg.multipart_part_size,
            cfg.multipart_max_parts,
        );

        let breaker = if cfg.circuit_breaker.enabled {
            Some(CircuitBreaker::new(
                cfg.circuit_breaker.max_failures,
                cfg.circuit_breaker.reset_timeout,
            ))
        } else {
            None
        };

        let retry_policy = RetryPolicy {
            max_attempts: cfg.max_retries.max(1),
            initial_delay: cfg.retry_backoff,
            ..RetryPolicy::default()
        };

        Ok(Runner {
            shared: Arc::new(Shared {
                cfg,
                store,
                generator,
                verifier,
                scheduler,
                keyspace,
                size_dist,
                limiter,
                multipart,
                breaker,
                metrics,
                retry_policy,
                ops_counter: AtomicU64::new(0),
                seed,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Signal the workload to wind down. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Total operations issued so far.
    pub fn ops_issued(&self) -> u64 {
        self.shared.ops_counter.load(Ordering::Relaxed)
    }

    /// Run setup and the workload, blocking until it ends. Only setup
    /// failures (bucket creation, cleanup) are returned as errors.
    pub async fn run(&self) -> Result<()> {
        let shared = &self.shared;
        let cfg = &shared.cfg;

        if cfg.create_bucket {
            shared
                .store
                .ensure_bucket()
                .await
                .context("failed to create bucket")?;
        }

        match cfg.versioning {
            Versioning::On => {
                if let Err(e) = shared.store.set_versioning(true).await {
                    warn!(error = %e, "failed to enable versioning");
                }
            }
            Versioning::Off => {
                if let Err(e) = shared.store.set_versioning(false).await {
                    warn!(error = %e, "failed to disable versioning");
                }
            }
            Versioning::Keep => {}
        }

        if cfg.cleanup {
            info!(prefix = %cfg.prefix, "running cleanup mode");
            let deleted = shared
                .store
                .cleanup_by_metadata(&cfg.prefix, METADATA_KEY_CREATED_BY, METADATA_VALUE_CREATED_BY)
                .await
                .context("cleanup failed")?;
            info!(deleted, "cleanup completed");
            return Ok(());
        }

        info!(
            concurrency = cfg.concurrency,
            duration = ?cfg.duration,
            operations = cfg.operations,
            size = %shared.size_dist.description(),
            "starting workload"
        );

        let start = Instant::now();
        let cancel = self.shutdown.child_token();

        let watchdog = if !cfg.duration.is_zero() {
            let token = cancel.clone();
            let duration = cfg.duration;
            Some(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        info!("workload duration elapsed");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            }))
        } else {
            None
        };

        shared.metrics.set_active_workers(cfg.concurrency as i64);

        let mut handles = Vec::with_capacity(cfg.concurrency);
        for worker_id in 0..cfg.concurrency {
            handles.push(tokio::spawn(worker_loop(
                shared.clone(),
                cancel.clone(),
                worker_id,
            )));
        }

        let mut merged = WorkerStats::new();
        for handle in handles {
            match handle.await {
                Ok(stats) => merged.merge(&stats),
                Err(e) => warn!(error = %e, "worker task panicked"),
            }
        }

        cancel.cancel();
        if let Some(watchdog) = watchdog {
            let _ = watchdog.await;
        }
        shared.metrics.set_active_workers(0);

        let wall = start.elapsed().as_secs_f64();
        info!(
            wall_seconds = %format!("{:.2}", wall),
            total_operations = shared.ops_counter.load(Ordering::Relaxed),
            "workload completed"
        );
        merged.log_summary(wall);

        Ok(())
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker_id: usize,
) -> WorkerStats {
    let cfg = &shared.cfg;
    // Worker-local PRNG for verification sampling; never shared with the
    // scheduler's op-selection stream.
    let mut verify_rng = StdRng::seed_from_u64(shared.seed ^ (worker_id as u64).wrapping_mul(0x9e37_79b9));
    let mut stats = WorkerStats::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if cfg.operations > 0 && shared.ops_counter.load(Ordering::Relaxed) >= cfg.operations {
            break;
        }
        if shared.limiter.wait(&cancel).await.is_err() {
            break;
        }

        let issued = shared.ops_counter.fetch_add(1, Ordering::Relaxed);
        if cfg.operations > 0 && issued >= cfg.operations {
            // Another worker took the last slot while we waited.
            break;
        }
        shared
            .metrics
            .set_rate_limiter_tokens(shared.limiter.tokens());

        let op = shared.scheduler.next();
        let key_idx = if cfg.random_keys {
            shared.scheduler.next_key()
        } else {
            issued as usize % cfg.keys
        };
        let key = shared.keyspace.generate(key_idx);

        if let Some(breaker) = &shared.breaker {
            if !breaker.allow() {
                shared.metrics.set_circuit_breaker_open(true);
                debug!(op = %op, key = %key, "circuit breaker open, skipping operation");
                continue;
            }
            shared.metrics.set_circuit_breaker_open(false);
        }

        let started = Instant::now();
        let outcome = timeout(
            cfg.op_timeout,
            dispatch(&shared, op, &key, &cancel, &mut verify_rng),
        )
        .await;

        match outcome {
            Ok(Ok(bytes)) => {
                stats.record_success(op, started.elapsed(), bytes);
                if let Some(breaker) = &shared.breaker {
                    breaker.on_success();
                    shared.metrics.set_circuit_breaker_open(false);
                }
            }
            Ok(Err(err)) => {
                stats.record_error(op);
                if let Some(breaker) = &shared.breaker {
                    breaker.on_failure();
                    shared.metrics.set_circuit_breaker_open(breaker.is_open());
                }
                debug!(op = %op, key = %key, error = %format!("{err:#}"), "operation failed");
            }
            Err(_) => {
                // Dispatch future dropped mid-call; account the timeout here.
                stats.record_error(op);
                shared
                    .metrics
                    .record_op(op, OpStatus::Error, cfg.op_timeout);
                if let Some(breaker) = &shared.breaker {
                    breaker.on_failure();
                    shared.metrics.set_circuit_breaker_open(breaker.is_open());
                }
                debug!(op = %op, key = %key, "operation timed out");
            }
        }
    }

    stats
}

/// Execute one operation. Returns the number of payload bytes moved, for the
/// end-of-run summary.
async fn dispatch(
    shared: &Shared,
    op: OpKind,
    key: &str,
    cancel: &CancellationToken,
    verify_rng: &mut StdRng,
) -> Result<u64> {
    match op {
        OpKind::Put => execute_put(shared, key, cancel).await,
        OpKind::Get => execute_get(shared, key, cancel, verify_rng).await,
        OpKind::Delete => execute_delete(shared, key, cancel).await,
        OpKind::Copy => execute_copy(shared, key, cancel).await,
        OpKind::List => execute_list(shared, cancel).await,
        OpKind::Head => execute_head(shared, key, cancel).await,
        OpKind::MultipartPut => execute_multipart_put(shared, key, cancel).await,
    }
}

async fn execute_put(shared: &Shared, key: &str, cancel: &CancellationToken) -> Result<u64> {
    let size = shared.size_dist.next();

    if shared.cfg.multipart_enabled && size >= shared.cfg.multipart_threshold {
        return multipart_upload(shared, key, size, cancel).await;
    }

    let (_, hash) = shared.generator.generate_and_hash(key, size)?;
    let metadata = prepare_metadata(&hash, &shared.cfg.namespace_tag);

    let result = with_retry(&shared.retry_policy, "put", cancel, || {
        // A fresh reader per attempt; the payload is a pure function of the
        // key so every attempt uploads identical bytes.
        let body = shared.generator.reader(key, size);
        let metadata = metadata.clone();
        async move { shared.store.put(key, body, size, metadata).await }
    })
    .await;

    match result {
        Ok(()) => Ok(size),
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::Put);
            }
            Err(e.into())
        }
    }
}

async fn execute_get(
    shared: &Shared,
    key: &str,
    cancel: &CancellationToken,
    verify_rng: &mut StdRng,
) -> Result<u64> {
    let verify = should_verify(shared.cfg.verify_rate, verify_rng);

    let result = with_retry(&shared.retry_policy, "get", cancel, || async move {
        shared.store.get(key).await
    })
    .await;

    let got = match result {
        Ok(got) => got,
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::Get);
            }
            return Err(e.into());
        }
    };

    if verify {
        match shared
            .verifier
            .verify_with_metadata(&got.body[..], &got.metadata)
        {
            Ok(()) => shared.metrics.record_verify_success(),
            Err(e) => {
                // Never retried; surfaced through the dedicated counter.
                shared.metrics.record_verify_failure();
                warn!(key, error = %e, "verification failed");
                return Err(anyhow::Error::new(e).context("verification failed"));
            }
        }
    }

    Ok(got.size)
}

async fn execute_delete(shared: &Shared, key: &str, cancel: &CancellationToken) -> Result<u64> {
    if shared.cfg.keep_data {
        return Ok(0);
    }

    let result = with_retry(&shared.retry_policy, "delete", cancel, || async move {
        shared.store.delete(key).await
    })
    .await;

    match result {
        Ok(()) => Ok(0),
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::Delete);
            }
            Err(e.into())
        }
    }
}

async fn execute_copy(shared: &Shared, src_key: &str, cancel: &CancellationToken) -> Result<u64> {
    // Destination draws from the same keyspace; src == dst is possible and
    // passed through to the store.
    let dst_key = shared.keyspace.generate(shared.scheduler.next_key());
    let dst_bucket = shared.cfg.copy_dst_bucket.as_deref();

    let result = with_retry(&shared.retry_policy, "copy", cancel, || {
        let dst_key = dst_key.clone();
        async move { shared.store.copy(src_key, &dst_key, dst_bucket).await }
    })
    .await;

    match result {
        Ok(()) => Ok(0),
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::Copy);
            }
            Err(e.into())
        }
    }
}

async fn execute_list(shared: &Shared, cancel: &CancellationToken) -> Result<u64> {
    let result = with_retry(&shared.retry_policy, "list", cancel, || async move {
        shared.store.list(&shared.cfg.prefix, 1000).await
    })
    .await;

    match result {
        Ok(_keys) => Ok(0),
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::List);
            }
            Err(e.into())
        }
    }
}

async fn execute_head(shared: &Shared, key: &str, cancel: &CancellationToken) -> Result<u64> {
    let result = with_retry(&shared.retry_policy, "head", cancel, || async move {
        shared.store.head(key).await
    })
    .await;

    match result {
        Ok(_) => Ok(0),
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::Head);
            }
            Err(e.into())
        }
    }
}

async fn execute_multipart_put(
    shared: &Shared,
    key: &str,
    cancel: &CancellationToken,
) -> Result<u64> {
    let size = shared.size_dist.next();
    multipart_upload(shared, key, size, cancel).await
}

async fn multipart_upload(
    shared: &Shared,
    key: &str,
    size: u64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let (_, hash) = shared.generator.generate_and_hash(key, size)?;
    let metadata = prepare_metadata(&hash, &shared.cfg.namespace_tag);

    let result = with_retry(&shared.retry_policy, "multipart_put", cancel, || {
        let metadata = metadata.clone();
        async move {
            shared
                .multipart
                .upload(key, shared.generator.clone(), size, metadata)
                .await
        }
    })
    .await;

    match result {
        Ok(()) => Ok(size),
        Err(e) => {
            if e.is_exhausted() {
                shared.metrics.record_retry(OpKind::MultipartPut);
            }
            Err(e.into())
        }
    }
}

/// Per-worker aggregates, merged after the pool drains.
struct WorkerStats {
    per_op: HashMap<OpKind, OpStats>,
}

struct OpStats {
    ops: u64,
    errors: u64,
    bytes: u64,
    latency_us: Histogram<u64>,
}

impl OpStats {
    fn new() -> Self {
        OpStats {
            ops: 0,
            errors: 0,
            bytes: 0,
            latency_us: Histogram::new_with_bounds(1, 60_000_000, 3)
                .expect("failed to allocate histogram"),
        }
    }
}

impl WorkerStats {
    fn new() -> Self {
        WorkerStats {
            per_op: HashMap::new(),
        }
    }

    fn record_success(&mut self, op: OpKind, latency: Duration, bytes: u64) {
        let entry = self.per_op.entry(op).or_insert_with(OpStats::new);
        entry.ops += 1;
        entry.bytes += bytes;
        let _ = entry
            .latency_us
            .record((latency.as_micros() as u64).max(1));
    }

    fn record_error(&mut self, op: OpKind) {
        let entry = self.per_op.entry(op).or_insert_with(OpStats::new);
        entry.ops += 1;
        entry.errors += 1;
    }

    fn merge(&mut self, other: &WorkerStats) {
        for (op, stats) in &other.per_op {
            let entry = self.per_op.entry(*op).or_insert_with(OpStats::new);
            entry.ops += stats.ops;
            entry.errors += stats.errors;
            entry.bytes += stats.bytes;
            let _ = entry.latency_us.add(&stats.latency_us);
        }
    }

    fn log_summary(&self, wall_seconds: f64) {
        for op in OpKind::ALL {
            let Some(stats) = self.per_op.get(&op) else {
                continue;
            };
            let mb = stats.bytes as f64 / (1024.0 * 1024.0);
            info!(
                op = %op,
                ops = stats.ops,
                errors = stats.errors,
                mb = %format!("{:.2}", mb),
                mb_per_sec = %format!("{:.2}", mb / wall_seconds.max(1e-9)),
                p50_us = stats.latency_us.value_at_quantile(0.50),
                p95_us = stats.latency_us.value_at_quantile(0.95),
                p99_us = stats.latency_us.value_at_quantile(0.99),
                "op summary"
            );
        }
    }
}
