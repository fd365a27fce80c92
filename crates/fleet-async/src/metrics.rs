//! Metrics for async host processing.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fleet_async_buffered_writes_total` | Counter | `kind`, `mode` | Host writes by path (`async`, `sync`) |
//! | `fleet_async_collector_runs_total` | Counter | `kind`, `outcome` | Collector runs by outcome |
//! | `fleet_async_collector_run_duration_seconds` | Histogram | `kind` | Duration of runs that held the lock |
//! | `fleet_async_collector_items_total` | Counter | `kind` | Buffered items applied to the durable store |
//! | `fleet_async_active_entities` | Gauge | `kind` | Hosts left in the active index after a run |
//!
//! Metrics go through the `metrics` facade; the collector service installs a
//! Prometheus recorder.

use std::time::Duration;

use fleet_core::TaskKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Host writes by path.
    pub const BUFFERED_WRITES_TOTAL: &str = "fleet_async_buffered_writes_total";
    /// Counter: Collector runs by outcome.
    pub const COLLECTOR_RUNS_TOTAL: &str = "fleet_async_collector_runs_total";
    /// Histogram: Collector run duration in seconds.
    pub const COLLECTOR_RUN_DURATION_SECONDS: &str = "fleet_async_collector_run_duration_seconds";
    /// Counter: Buffered items applied.
    pub const COLLECTOR_ITEMS_TOTAL: &str = "fleet_async_collector_items_total";
    /// Gauge: Hosts in the active index.
    pub const ACTIVE_ENTITIES: &str = "fleet_async_active_entities";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task kind.
    pub const KIND: &str = "kind";
    /// Write path (async, sync).
    pub const MODE: &str = "mode";
    /// Run outcome (completed, failed, lock_denied).
    pub const OUTCOME: &str = "outcome";
}

/// Registers metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(names::BUFFERED_WRITES_TOTAL, "Host writes by write path");
    describe_counter!(names::COLLECTOR_RUNS_TOTAL, "Collector runs by outcome");
    describe_histogram!(
        names::COLLECTOR_RUN_DURATION_SECONDS,
        "Duration of collector runs that held the lock, in seconds"
    );
    describe_counter!(
        names::COLLECTOR_ITEMS_TOTAL,
        "Buffered items applied to the durable store"
    );
    describe_gauge!(
        names::ACTIVE_ENTITIES,
        "Hosts left in the active index after a run"
    );
}

/// Write path taken by a host write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Buffered in the ephemeral store.
    Async,
    /// Written directly to the durable store.
    Sync,
}

impl WriteMode {
    /// Returns the metric label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Sync => "sync",
        }
    }
}

/// High-level interface for recording async processing metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct AsyncMetrics;

impl AsyncMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one host write.
    pub fn record_write(&self, kind: TaskKind, mode: WriteMode) {
        counter!(
            names::BUFFERED_WRITES_TOTAL,
            labels::KIND => kind.as_str(),
            labels::MODE => mode.as_str(),
        )
        .increment(1);
    }

    /// Records a collector run outcome.
    pub fn record_run(&self, kind: TaskKind, outcome: &'static str) {
        counter!(
            names::COLLECTOR_RUNS_TOTAL,
            labels::KIND => kind.as_str(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records the duration of a run that held the lock.
    pub fn observe_run_duration(&self, kind: TaskKind, duration: Duration) {
        histogram!(
            names::COLLECTOR_RUN_DURATION_SECONDS,
            labels::KIND => kind.as_str(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records buffered items applied to the durable store.
    pub fn record_items(&self, kind: TaskKind, items: u64) {
        counter!(
            names::COLLECTOR_ITEMS_TOTAL,
            labels::KIND => kind.as_str(),
        )
        .increment(items);
    }

    /// Sets the number of hosts left in the active index.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_entities(&self, kind: TaskKind, count: u64) {
        gauge!(
            names::ACTIVE_ENTITIES,
            labels::KIND => kind.as_str(),
        )
        .set(count as f64);
    }
}
