//! Observability metrics for the execution engine.
//!
//! Prometheus-compatible metrics via the `metrics` facade. Designed to
//! support:
//!
//! - **Alerting**: failure rates per execution step, lock release failures
//! - **Dashboards**: chunk throughput, retry pressure, aggregation latency
//! - **Debugging**: correlating metrics with traces for root cause analysis
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tally_flow_executions_total` | Counter | `status` | Executions reaching a terminal status |
//! | `tally_flow_chunks_total` | Counter | `outcome` | Chunk invocations by outcome |
//! | `tally_flow_calculator_retries_total` | Counter | - | Calculator invocation retries |
//! | `tally_flow_step_duration_seconds` | Histogram | `step` | Coordinator step duration |
//! | `tally_flow_aggregation_duration_seconds` | Histogram | - | Full aggregation pass duration |
//! | `tally_flow_lock_conflicts_total` | Counter | `scope` | Lock acquisitions rejected as conflicts |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade; install any
//! compatible recorder (e.g. a Prometheus exporter) at service start.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: executions reaching a terminal status.
    pub const EXECUTIONS_TOTAL: &str = "tally_flow_executions_total";
    /// Counter: chunk invocations by outcome.
    pub const CHUNKS_TOTAL: &str = "tally_flow_chunks_total";
    /// Counter: calculator invocation retries.
    pub const CALCULATOR_RETRIES_TOTAL: &str = "tally_flow_calculator_retries_total";
    /// Histogram: coordinator step duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "tally_flow_step_duration_seconds";
    /// Histogram: full aggregation pass duration in seconds.
    pub const AGGREGATION_DURATION_SECONDS: &str = "tally_flow_aggregation_duration_seconds";
    /// Counter: lock acquisitions rejected as conflicts.
    pub const LOCK_CONFLICTS_TOTAL: &str = "tally_flow_lock_conflicts_total";
}

/// Metric label keys.
pub mod labels {
    /// Terminal execution status.
    pub const STATUS: &str = "status";
    /// Chunk outcome (`succeeded` / `failed`).
    pub const OUTCOME: &str = "outcome";
    /// Coordinator step name.
    pub const STEP: &str = "step";
    /// Lock scope.
    pub const SCOPE: &str = "scope";
}

/// Records a terminal execution status.
pub fn record_execution_terminal(status: &str) {
    counter!(names::EXECUTIONS_TOTAL, labels::STATUS => status.to_string()).increment(1);
}

/// Records a chunk outcome.
pub fn record_chunk_outcome(outcome: &str) {
    counter!(names::CHUNKS_TOTAL, labels::OUTCOME => outcome.to_string()).increment(1);
}

/// Records a calculator invocation retry.
pub fn record_calculator_retry() {
    counter!(names::CALCULATOR_RETRIES_TOTAL).increment(1);
}

/// Records a coordinator step duration.
pub fn observe_step_duration(step: &str, duration: Duration) {
    histogram!(names::STEP_DURATION_SECONDS, labels::STEP => step.to_string())
        .record(duration.as_secs_f64());
}

/// Records a full aggregation pass duration.
pub fn observe_aggregation_duration(duration: Duration) {
    histogram!(names::AGGREGATION_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Records a lock conflict.
pub fn record_lock_conflict(scope: &str) {
    counter!(names::LOCK_CONFLICTS_TOTAL, labels::SCOPE => scope.to_string()).increment(1);
}

/// RAII guard that records elapsed time when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use tally_flow::metrics::{observe_step_duration, TimingGuard};
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         observe_step_duration("merge", duration);
///     });
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed
    /// duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
