use std::time::Duration;
use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    // Admission metrics
    pub static ref CALLS_ADMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_calls_admitted_total", "Total number of calls admitted by a throttle"),
        &["throttle"]
    ).expect("valid metric definition");

    pub static ref CALLS_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_calls_rejected_total", "Total number of calls rejected under backpressure"),
        &["throttle"]
    ).expect("valid metric definition");

    pub static ref PENDING_CALLS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("throttle_pending_calls", "Calls admitted but not yet completed"),
        &["throttle"]
    ).expect("valid metric definition");

    // Execution metrics
    pub static ref CALLS_COMPLETED: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_calls_completed_total", "Total number of throttled calls that succeeded"),
        &["throttle"]
    ).expect("valid metric definition");

    pub static ref CALLS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("throttle_calls_failed_total", "Total number of throttled calls that failed"),
        &["throttle"]
    ).expect("valid metric definition");

    // Latency metrics
    pub static ref WAIT_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "throttle_wait_seconds",
            "Delay between admission and scheduled start"
        ).buckets(vec![0.0, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["throttle"]
    ).expect("valid metric definition");
}

pub fn register_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(CALLS_ADMITTED.clone()))?;
    registry.register(Box::new(CALLS_REJECTED.clone()))?;
    registry.register(Box::new(PENDING_CALLS.clone()))?;
    registry.register(Box::new(CALLS_COMPLETED.clone()))?;
    registry.register(Box::new(CALLS_FAILED.clone()))?;
    registry.register(Box::new(WAIT_SECONDS.clone()))?;
    Ok(())
}

pub fn record_admitted(throttle: &str, wait: Duration) {
    CALLS_ADMITTED.with_label_values(&[throttle]).inc();
    WAIT_SECONDS.with_label_values(&[throttle]).observe(wait.as_secs_f64());
}

pub fn record_rejected(throttle: &str) {
    CALLS_REJECTED.with_label_values(&[throttle]).inc();
}

/// Callers hold the throttle's state lock so writes land in admission order.
pub fn record_pending(throttle: &str, pending: usize) {
    PENDING_CALLS.with_label_values(&[throttle]).set(pending as i64);
}

pub fn record_outcome<T>(throttle: &str, result: &crate::error::Result<T>) {
    match result {
        Ok(_) => CALLS_COMPLETED.with_label_values(&[throttle]).inc(),
        Err(_) => CALLS_FAILED.with_label_values(&[throttle]).inc(),
    }
}
