//! Prometheus metrics
//!
//! Lazily-registered process-wide metrics. Recording functions are no-ops
//! until [`init_metrics`] has run, so library consumers that never start the
//! HTTP surface pay nothing.

use std::sync::OnceLock;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

static METRICS: OnceLock<Metrics> = OnceLock::new();

struct Metrics {
    registry: Registry,
    jobs_sent: IntCounter,
    jobs_failed: IntCounter,
    jobs_retried: IntCounter,
    claim_conflicts: IntCounter,
    rate_denials: IntCounterVec,
    in_flight: IntGauge,
    transport_duration: Histogram,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let jobs_sent = IntCounter::with_opts(Opts::new(
            "cadence_jobs_sent_total",
            "Jobs accepted by the transport",
        ))?;
        let jobs_failed = IntCounter::with_opts(Opts::new(
            "cadence_jobs_failed_total",
            "Jobs that reached the failed state",
        ))?;
        let jobs_retried = IntCounter::with_opts(Opts::new(
            "cadence_jobs_retried_total",
            "Delivery attempts rescheduled after a transient failure",
        ))?;
        let claim_conflicts = IntCounter::with_opts(Opts::new(
            "cadence_claim_conflicts_total",
            "Claims lost to a concurrent dispatcher",
        ))?;
        let rate_denials = IntCounterVec::new(
            Opts::new(
                "cadence_rate_denials_total",
                "Admissions denied by the throttle governor",
            ),
            &["reason"],
        )?;
        let in_flight = IntGauge::with_opts(Opts::new(
            "cadence_in_flight_sends",
            "Transport calls currently in flight",
        ))?;
        let transport_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cadence_transport_duration_seconds",
                "Wall time of one transport send call",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(jobs_sent.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(jobs_retried.clone()))?;
        registry.register(Box::new(claim_conflicts.clone()))?;
        registry.register(Box::new(rate_denials.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(transport_duration.clone()))?;

        Ok(Self {
            registry,
            jobs_sent,
            jobs_failed,
            jobs_retried,
            claim_conflicts,
            rate_denials,
            in_flight,
            transport_duration,
        })
    }
}

/// Register all metrics. Idempotent; safe to call from multiple entry points.
pub fn init_metrics() {
    if METRICS.get().is_some() {
        return;
    }
    match Metrics::new() {
        Ok(metrics) => {
            let _ = METRICS.set(metrics);
        }
        Err(e) => warn!(error = %e, "Metrics registration failed; continuing without metrics"),
    }
}

pub fn record_job_sent() {
    if let Some(m) = METRICS.get() {
        m.jobs_sent.inc();
    }
}

pub fn record_job_failed() {
    if let Some(m) = METRICS.get() {
        m.jobs_failed.inc();
    }
}

pub fn record_job_retried() {
    if let Some(m) = METRICS.get() {
        m.jobs_retried.inc();
    }
}

pub fn record_claim_conflict() {
    if let Some(m) = METRICS.get() {
        m.claim_conflicts.inc();
    }
}

/// `reason` is one of `concurrency`, `global_rate`, `domain_rate`
pub fn record_rate_denial(reason: &str) {
    if let Some(m) = METRICS.get() {
        m.rate_denials.with_label_values(&[reason]).inc();
    }
}

pub fn inc_in_flight() {
    if let Some(m) = METRICS.get() {
        m.in_flight.inc();
    }
}

pub fn dec_in_flight() {
    if let Some(m) = METRICS.get() {
        m.in_flight.dec();
    }
}

pub fn observe_transport_seconds(seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.transport_duration.observe(seconds);
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let Some(m) = METRICS.get() else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buffer) {
        warn!(error = %e, "Metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
