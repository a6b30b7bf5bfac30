//! Pipeline metrics.
//!
//! Metrics go through the `metrics` crate facade; nothing is recorded unless
//! the host process installs a recorder.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sieve_stage_invocations_total` | Counter | `stage`, `format`, `result` | Stage invocations by outcome |
//! | `sieve_stage_duration_seconds` | Histogram | `stage`, `format` | Stage wall time |
//! | `sieve_dispatches_total` | Counter | `stage`, `result` | Tasks handed to the dispatcher |
//! | `sieve_rows_total` | Counter | `format`, `direction` | Rows scanned and kept by work |
//! | `sieve_reducer_triggers_total` | Counter | `trigger` | Reducer dispatches by triggering stage |
//!
//! ```rust,no_run
//! use sieve_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_stage("work", "chunked", "success");
//! metrics.record_rows("chunked", 3000, 412);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Counter: stage invocations.
    pub const STAGE_INVOCATIONS_TOTAL: &str = "sieve_stage_invocations_total";
    /// Histogram: stage duration in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "sieve_stage_duration_seconds";
    /// Counter: dispatched tasks.
    pub const DISPATCHES_TOTAL: &str = "sieve_dispatches_total";
    /// Counter: rows scanned and kept.
    pub const ROWS_TOTAL: &str = "sieve_rows_total";
    /// Counter: reducer dispatches.
    pub const REDUCER_TRIGGERS_TOTAL: &str = "sieve_reducer_triggers_total";
}

/// Label keys.
pub mod labels {
    /// Stage name (driver, mapper, work, reducer).
    pub const STAGE: &str = "stage";
    /// Format plugin name.
    pub const FORMAT: &str = "format";
    /// Outcome (success, failure).
    pub const RESULT: &str = "result";
    /// Row direction (scanned, kept).
    pub const DIRECTION: &str = "direction";
    /// Stage that triggered a reducer.
    pub const TRIGGER: &str = "trigger";
}

/// Records pipeline metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Counts one stage invocation.
    pub fn record_stage(&self, stage: &str, format: &str, result: &str) {
        counter!(
            names::STAGE_INVOCATIONS_TOTAL,
            labels::STAGE => stage.to_string(),
            labels::FORMAT => format.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a stage's wall time.
    pub fn observe_stage_duration(&self, stage: &str, format: &str, duration: Duration) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
            labels::FORMAT => format.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Counts one dispatch attempt.
    pub fn record_dispatch(&self, stage: &str, result: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::STAGE => stage.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Adds a work invocation's scanned and kept row counts.
    pub fn record_rows(&self, format: &str, scanned: u64, kept: u64) {
        counter!(
            names::ROWS_TOTAL,
            labels::FORMAT => format.to_string(),
            labels::DIRECTION => "scanned",
        )
        .increment(scanned);
        counter!(
            names::ROWS_TOTAL,
            labels::FORMAT => format.to_string(),
            labels::DIRECTION => "kept",
        )
        .increment(kept);
    }

    /// Counts a reducer dispatch from `trigger`.
    pub fn record_reducer_trigger(&self, trigger: &str) {
        counter!(
            names::REDUCER_TRIGGERS_TOTAL,
            labels::TRIGGER => trigger.to_string(),
        )
        .increment(1);
    }
}

/// Calls `on_drop` with the elapsed time when dropped.
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
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Time since the guard was created.
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

/// Times one stage invocation into the stage duration histogram.
#[must_use]
pub fn time_stage(stage: &'static str, format: String) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        FlowMetrics::new().observe_stage_duration(stage, &format, duration);
    })
}
