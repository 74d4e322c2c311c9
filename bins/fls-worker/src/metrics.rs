// Prometheus metrics for the grading worker

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::error::FaultKind;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Finished passes that touched a submission, by outcome
    pub static ref JOBS: CounterVec = CounterVec::new(
        Opts::new("fls_jobs_total", "Jobs handled, by outcome"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref FAULTS: CounterVec = CounterVec::new(
        Opts::new("fls_faults_total", "Job faults, by classification"),
        &["kind"]
    )
    .expect("metric can be created");

    pub static ref CANCEL_FAILURES: IntCounter = IntCounter::new(
        "fls_cancel_failures_total",
        "Claims that could not be released"
    )
    .expect("metric can be created");

    pub static ref HEARTBEAT_FAILURES: IntCounter = IntCounter::new(
        "fls_heartbeat_failures_total",
        "Heartbeats the control plane did not accept"
    )
    .expect("metric can be created");

    // Build images take minutes, grading can take longer
    pub static ref PHASE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("fls_phase_duration_seconds", "Time spent per job phase")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0]),
        &["phase"]
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Register all collectors. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(JOBS.clone()),
            Box::new(FAULTS.clone()),
            Box::new(CANCEL_FAILURES.clone()),
            Box::new(HEARTBEAT_FAILURES.clone()),
            Box::new(PHASE_DURATION.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!(error = %e, "failed to register collector");
            }
        }
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_outcome(outcome: &str) {
    JOBS.with_label_values(&[outcome]).inc();
}

pub fn record_fault(kind: FaultKind) {
    FAULTS.with_label_values(&[kind.as_str()]).inc();
}

pub fn record_cancel_failure() {
    CANCEL_FAILURES.inc();
}

pub fn record_heartbeat_failure() {
    HEARTBEAT_FAILURES.inc();
}

pub fn observe_phase(phase: &str, seconds: f64) {
    PHASE_DURATION.with_label_values(&[phase]).observe(seconds);
}
