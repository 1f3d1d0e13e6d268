//! Metrics sink capability and its Prometheus implementation
//!
//! The engine records through the [`MetricsSink`] trait; the trait carries no
//! business logic. [`PrometheusSink`] registers the stable metric set on its
//! own registry so an embedding process can expose it however it likes.

use std::time::Duration;

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::scheduler::OpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    Error,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Success => "success",
            OpStatus::Error => "error",
        }
    }
}

/// Opaque counters and histograms the engine emits into.
pub trait MetricsSink: Send + Sync {
    fn record_op(&self, op: OpKind, status: OpStatus, latency: Duration);
    fn record_bytes_written(&self, bytes: u64);
    fn record_bytes_read(&self, bytes: u64);
    fn record_verify_success(&self);
    fn record_verify_failure(&self);
    fn record_retry(&self, op: OpKind);
    fn set_active_workers(&self, count: i64);
    fn set_rate_limiter_tokens(&self, tokens: f64);
    fn set_circuit_breaker_open(&self, open: bool);
}

/// Prometheus-backed sink with the stable metric names and buckets.
pub struct PrometheusSink {
    pub ops_total: IntCounterVec,
    pub op_latency: HistogramVec,
    pub bytes_written: IntCounter,
    pub bytes_read: IntCounter,
    pub verify_failures: IntCounter,
    pub verify_total: IntCounter,
    pub retries: IntCounterVec,
    pub active_workers: IntGauge,
    pub rate_limiter_tokens: Gauge,
    pub circuit_breaker_open: IntGauge,
    registry: Registry,
}

impl PrometheusSink {
    pub fn new() -> Self {
        let registry = Registry::new();

        let ops_total = IntCounterVec::new(
            Opts::new("s3_ops_total", "Total S3 operations by type and status"),
            &["op", "status"],
        )
        .expect("metric can be created");

        let op_latency = HistogramVec::new(
            HistogramOpts::new("s3_op_latency_seconds", "Latency of S3 operations in seconds")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["op"],
        )
        .expect("metric can be created");

        let bytes_written =
            IntCounter::new("s3_bytes_written_total", "Total bytes written to the store")
                .expect("metric can be created");
        let bytes_read = IntCounter::new("s3_bytes_read_total", "Total bytes read from the store")
            .expect("metric can be created");

        let verify_failures =
            IntCounter::new("s3_verify_failures_total", "Total verification failures")
                .expect("metric can be created");
        let verify_total =
            IntCounter::new("s3_verify_total", "Total verifications attempted")
                .expect("metric can be created");

        let retries = IntCounterVec::new(
            Opts::new("s3_retries_total", "Operations that exhausted their retry budget"),
            &["op"],
        )
        .expect("metric can be created");

        let active_workers = IntGauge::new("s3_active_workers", "Currently active workers")
            .expect("metric can be created");
        let rate_limiter_tokens = Gauge::new(
            "s3_rate_limiter_tokens",
            "Available rate limiter tokens (best effort)",
        )
        .expect("metric can be created");
        let circuit_breaker_open = IntGauge::new(
            "s3_circuit_breaker_open",
            "Circuit breaker state (1 = open, 0 = closed)",
        )
        .expect("metric can be created");

        for collector in [
            Box::new(ops_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(op_latency.clone()),
            Box::new(bytes_written.clone()),
            Box::new(bytes_read.clone()),
            Box::new(verify_failures.clone()),
            Box::new(verify_total.clone()),
            Box::new(retries.clone()),
            Box::new(active_workers.clone()),
            Box::new(rate_limiter_tokens.clone()),
            Box::new(circuit_breaker_open.clone()),
        ] {
            registry.register(collector).expect("metric can be registered");
        }

        PrometheusSink {
            ops_total,
            op_latency,
            bytes_written,
            bytes_read,
            verify_failures,
            verify_total,
            retries,
            active_workers,
            rate_limiter_tokens,
            circuit_breaker_open,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .expect("text encoding cannot fail");
        String::from_utf8(buf).expect("exposition format is utf-8")
    }
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusSink {
    fn record_op(&self, op: OpKind, status: OpStatus, latency: Duration) {
        self.ops_total
            .with_label_values(&[op.as_str(), status.as_str()])
            .inc();
        self.op_latency
            .with_label_values(&[op.as_str()])
            .observe(latency.as_secs_f64());
    }

    fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.inc_by(bytes);
    }

    fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read.inc_by(bytes);
    }

    fn record_verify_success(&self) {
        self.verify_total.inc();
    }

    fn record_verify_failure(&self) {
        self.verify_failures.inc();
        self.verify_total.inc();
    }

    fn record_retry(&self, op: OpKind) {
        self.retries.with_label_values(&[op.as_str()]).inc();
    }

    fn set_active_workers(&self, count: i64) {
        self.active_workers.set(count);
    }

    fn set_rate_limiter_tokens(&self, tokens: f64) {
        self.rate_limiter_tokens.set(tokens);
    }

    fn set_circuit_breaker_open(&self, open: bool) {
        self.circuit_breaker_open.set(if open { 1 } else { 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_op_counts_and_latency() {
        let sink = PrometheusSink::new();
        sink.record_op(OpKind::Put, OpStatus::Success, Duration::from_millis(3));
        sink.record_op(OpKind::Put, OpStatus::Success, Duration::from_millis(7));
        sink.record_op(OpKind::Put, OpStatus::Error, Duration::from_millis(1));

        assert_eq!(
            sink.ops_total.with_label_values(&["put", "success"]).get(),
            2
        );
        assert_eq!(sink.ops_total.with_label_values(&["put", "error"]).get(), 1);
        assert_eq!(
            sink.op_latency
                .with_label_values(&["put"])
                .get_sample_count(),
            3
        );
    }

    #[test]
    fn test_bytes_and_verify_counters() {
        let sink = PrometheusSink::new();
        sink.record_bytes_written(1000);
        sink.record_bytes_written(24);
        sink.record_bytes_read(512);
        sink.record_verify_success();
        sink.record_verify_failure();

        assert_eq!(sink.bytes_written.get(), 1024);
        assert_eq!(sink.bytes_read.get(), 512);
        assert_eq!(sink.verify_total.get(), 2);
        assert_eq!(sink.verify_failures.get(), 1);
    }

    #[test]
    fn test_gauges() {
        let sink = PrometheusSink::new();
        sink.set_active_workers(8);
        sink.set_circuit_breaker_open(true);
        sink.set_rate_limiter_tokens(3.5);

        assert_eq!(sink.active_workers.get(), 8);
        assert_eq!(sink.circuit_breaker_open.get(), 1);
        assert!((sink.rate_limiter_tokens.get() - 3.5).abs() < 1e-9);

        sink.set_circuit_breaker_open(false);
        assert_eq!(sink.circuit_breaker_open.get(), 0);
    }

    #[test]
    fn test_exposition_contains_stable_names() {
        let sink = PrometheusSink::new();
        sink.record_op(OpKind::Get, OpStatus::Success, Duration::from_millis(5));
        sink.record_bytes_read(100);

        let text = sink.gather_text();
        assert!(text.contains("s3_ops_total"));
        assert!(text.contains("s3_op_latency_seconds"));
        assert!(text.contains("s3_bytes_read_total"));
    }
}
