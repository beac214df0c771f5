//! Metrics collection for the consensus core
//!
//! Collectors live in a process-wide Prometheus registry; the binary exposes
//! them over HTTP.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry};
use std::time::Instant;

use crate::error::{Error, Result};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Submissions by outcome
    pub static ref SUBMIT_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("raft_submit_counter", "submissions by outcome"),
        &["outcome"]
    )
    .unwrap();

    /// Submission latency, from handle call to applied result
    pub static ref SUBMIT_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("raft_submit_cost", "submission cost in seconds"),
        &["method"]
    )
    .unwrap();

    /// Role transitions by the role entered
    pub static ref ROLE_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("raft_role_transitions", "role transitions"),
        &["role"]
    )
    .unwrap();

    /// Snapshots by kind (taken, installed)
    pub static ref SNAPSHOT_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("raft_snapshots", "snapshots taken or installed"),
        &["kind"]
    )
    .unwrap();

    /// Groups hosted by managers of this process
    pub static ref ACTIVE_GROUPS: IntGauge =
        IntGauge::new("raft_active_groups", "active raft groups").unwrap();

    /// Lifecycle callbacks that returned an error or panicked
    pub static ref LIFECYCLE_FAILURES: IntCounter = IntCounter::new(
        "raft_lifecycle_callback_failures",
        "failed group lifecycle callbacks"
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(SUBMIT_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SUBMIT_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ROLE_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ACTIVE_GROUPS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(LIFECYCLE_FAILURES.clone()));
}

fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(Error::NotLeader { .. }) => "not_leader",
        Err(Error::GroupDestroyed(_)) => "group_destroyed",
        Err(Error::Timeout) => "timeout",
        Err(_) => "error",
    }
}

/// Records the outcome and latency of an async operation
pub async fn record_metrics<F, Fut, T>(method_name: &'static str, handler: F) -> Result<T>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T>> + Send,
{
    let start = Instant::now();
    let result = handler().await;

    SUBMIT_COUNTER_VEC
        .with_label_values(&[outcome_label(&result)])
        .inc();
    SUBMIT_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(start.elapsed().as_secs_f64());

    result
}
