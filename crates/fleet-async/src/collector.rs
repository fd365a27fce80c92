//! Collector: the per-kind scheduler that drains buffers into the durable store.
//!
//! Every process runs one collector per enabled task kind. Collectors wake up on a
//! jittered interval and race for a per-kind lock in the ephemeral store; the winner
//! runs one collection and the others record a lock denial and go back to sleep.
//!
//! ## Run
//!
//! 1. `SetIfAbsent(lock, holder, lock_timeout)`; a held lock ends the attempt.
//! 2. Purge index entries older than the retention window.
//! 3. Page through the active index: reconcile the page, then remove the entries
//!    whose score did not change while the page was being reconciled.
//! 4. Release the lock with `DelIfEquals(lock, holder)`, so a lock that expired and
//!    was taken over is never released by its previous holder.
//!
//! Steps 2-3 are bounded by `lock_timeout` and by the shutdown token. A failed run
//! is not retried before the next interval.
//!
//! ## States
//!
//! `Idle -> Locking -> Running -> Idle`, and `Stopped` once the loop exits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::observability::collector_span;
use fleet_core::{AsyncConfig, Datastore, EphemeralStore, EphemeralStoreExt, TaskKind};
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use crate::active::ActiveEntityIndex;
use crate::error::{Error, Result};
use crate::keys;
use crate::metrics::AsyncMetrics;
use crate::reconcile::{self, Reconciler, RunOutcome};

/// Callback invoked with every failed run's error.
pub type ErrorHook = Arc<dyn Fn(TaskKind, &Error) + Send + Sync>;

/// Lifecycle state of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CollectorState {
    /// Waiting for the next interval.
    Idle = 0,
    /// Trying to acquire the lock.
    Locking = 1,
    /// Holding the lock and collecting.
    Running = 2,
    /// The loop has exited.
    Stopped = 3,
}

impl CollectorState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Locking,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Outcome of one collection attempt.
#[derive(Debug)]
pub enum RunResult {
    /// Another process holds the lock.
    LockDenied,
    /// The run drained every page.
    Completed(RunOutcome),
    /// The run stopped at an error. `outcome` counts the work applied before it.
    Failed {
        /// Counts accumulated before the failure.
        outcome: RunOutcome,
        /// The failure.
        error: Error,
    },
}

impl RunResult {
    /// Returns the metric label of the outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::LockDenied => "lock_denied",
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns the counts of a run that held the lock.
    #[must_use]
    pub const fn outcome(&self) -> Option<RunOutcome> {
        match self {
            Self::LockDenied => None,
            Self::Completed(outcome) | Self::Failed { outcome, .. } => Some(*outcome),
        }
    }
}

/// Min/max/last of a per-run measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Smallest value seen.
    pub min: Option<u64>,
    /// Largest value seen.
    pub max: u64,
    /// Latest value.
    pub last: u64,
}

impl Summary {
    fn record(&mut self, value: u64) {
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = self.max.max(value);
        self.last = value;
    }
}

/// Counters of a collector since it was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Task kind.
    pub kind: TaskKind,
    /// Collection attempts, including lock denials.
    pub executions: u64,
    /// Attempts that failed.
    pub failures: u64,
    /// Attempts that found the lock held.
    pub lock_denied: u64,
    /// Start of the latest run that held the lock.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Error of the latest failed attempt.
    pub last_error: Option<String>,
    /// Duration of runs that held the lock, in milliseconds.
    pub duration_ms: Summary,
    /// Host buffers drained per run.
    pub keys: Summary,
    /// Buffered items applied per run.
    pub items: Summary,
}

impl CollectorStats {
    /// Creates empty stats for a kind.
    #[must_use]
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            executions: 0,
            failures: 0,
            lock_denied: 0,
            last_run_at: None,
            last_error: None,
            duration_ms: Summary::default(),
            keys: Summary::default(),
            items: Summary::default(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Returns `interval` shifted by a random amount of up to `max_jitter_percent`
/// percent in either direction.
#[must_use]
pub fn jittered_interval(interval: Duration, max_jitter_percent: u8) -> Duration {
    let interval_ms = millis(interval);
    let max_jitter_ms = interval_ms.saturating_mul(u64::from(max_jitter_percent.min(100))) / 100;
    if max_jitter_ms == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(0..=max_jitter_ms.saturating_mul(2));
    Duration::from_millis((interval_ms - max_jitter_ms).saturating_add(offset))
}

/// Periodic drainer for one task kind.
pub struct Collector {
    kind: TaskKind,
    config: Arc<AsyncConfig>,
    store: Arc<dyn EphemeralStore>,
    index: ActiveEntityIndex,
    reconciler: Arc<dyn Reconciler>,
    lock_key: String,
    state: AtomicU8,
    stats: Mutex<CollectorStats>,
    error_hook: Option<ErrorHook>,
    metrics: AsyncMetrics,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a collector with the kind's standard reconciler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        kind: TaskKind,
        store: Arc<dyn EphemeralStore>,
        datastore: Arc<dyn Datastore>,
        config: Arc<AsyncConfig>,
    ) -> Result<Self> {
        let reconciler = reconcile::for_kind(kind, store.clone(), datastore, &config);
        Self::with_reconciler(store, reconciler, config)
    }

    /// Creates a collector around a custom reconciler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn with_reconciler(
        store: Arc<dyn EphemeralStore>,
        reconciler: Arc<dyn Reconciler>,
        config: Arc<AsyncConfig>,
    ) -> Result<Self> {
        config.validate()?;
        let kind = reconciler.kind();
        Ok(Self {
            kind,
            index: ActiveEntityIndex::new(store.clone(), kind, config.key_retention),
            lock_key: keys::lock_key(kind),
            store,
            reconciler,
            config,
            state: AtomicU8::new(CollectorState::Idle as u8),
            stats: Mutex::new(CollectorStats::new(kind)),
            error_hook: None,
            metrics: AsyncMetrics::new(),
        })
    }

    /// Installs a callback invoked with every failed run's error.
    #[must_use]
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Returns the task kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CollectorState {
        CollectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CollectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns a snapshot of the collector's counters.
    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs one collection attempt now, independent of the schedule.
    pub async fn run_once(&self) -> RunResult {
        self.run(&CancellationToken::new()).await
    }

    /// Starts the collection loop on the runtime.
    ///
    /// The loop exits once `shutdown` is cancelled; an in-flight run is abandoned at
    /// its next await point and its lock released.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> CollectorHandle {
        let kind = self.kind;
        let handle = tokio::spawn(self.run_loop(shutdown));
        CollectorHandle { kind, handle }
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let task = self.config.task(self.kind).clone();
        tracing::info!(
            kind = %self.kind,
            interval_secs = task.collect_interval.as_secs(),
            "collector started"
        );

        let mut last_stats_log = Instant::now();
        loop {
            let wait = jittered_interval(task.collect_interval, self.config.max_jitter_percent);
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }

            self.run(&shutdown).await;

            if last_stats_log.elapsed() >= self.config.log_stats_interval {
                self.log_stats();
                last_stats_log = Instant::now();
            }
        }

        self.set_state(CollectorState::Stopped);
        tracing::info!(kind = %self.kind, "collector stopped");
    }

    fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            kind = %stats.kind,
            executions = stats.executions,
            failures = stats.failures,
            lock_denied = stats.lock_denied,
            last_duration_ms = stats.duration_ms.last,
            max_duration_ms = stats.duration_ms.max,
            last_keys = stats.keys.last,
            last_items = stats.items.last,
            "collector stats"
        );
    }

    async fn run(&self, shutdown: &CancellationToken) -> RunResult {
        let holder = Ulid::new().to_string();
        let span = collector_span(self.kind.as_str(), &holder);
        self.run_as(shutdown, &holder).instrument(span).await
    }

    async fn run_as(&self, shutdown: &CancellationToken, holder: &str) -> RunResult {
        self.set_state(CollectorState::Locking);
        let lock_timeout = self.config.lock_timeout;

        match self
            .store
            .set_if_absent(&self.lock_key, holder, lock_timeout)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.set_state(CollectorState::Idle);
                tracing::debug!("collector lock held elsewhere");
                return self.finish(RunResult::LockDenied, None);
            }
            Err(err) => {
                self.set_state(CollectorState::Idle);
                let result = RunResult::Failed {
                    outcome: RunOutcome::default(),
                    error: err.into(),
                };
                return self.finish(result, None);
            }
        }

        self.set_state(CollectorState::Running);
        let started = Instant::now();
        let now = Utc::now();
        let mut outcome = RunOutcome::default();

        let collected = tokio::select! {
            res = tokio::time::timeout(lock_timeout, self.collect(now, &mut outcome)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(fleet_core::Error::Timeout {
                    operation: format!("{} collection", self.kind),
                    elapsed_ms: millis(started.elapsed()),
                }
                .into()),
            },
            () = shutdown.cancelled() => Err(fleet_core::Error::Cancelled {
                operation: format!("{} collection", self.kind),
            }
            .into()),
        };
        let elapsed = started.elapsed();

        match self.store.del_if_equals(&self.lock_key, holder).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("collector lock expired before release"),
            Err(err) => tracing::warn!(error = %err, "failed to release collector lock"),
        }
        self.set_state(CollectorState::Idle);

        let result = match collected {
            Ok(()) => RunResult::Completed(outcome),
            Err(error) => RunResult::Failed { outcome, error },
        };
        self.finish(result, Some((now, elapsed)))
    }

    async fn collect(&self, now: DateTime<Utc>, outcome: &mut RunOutcome) -> Result<()> {
        let cutoff = chrono::Duration::from_std(self.config.key_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            let purged = self.index.purge_older_than(cutoff).await?;
            if purged > 0 {
                tracing::info!(purged, "purged stale active entries");
            }
        }

        let page_size = self.config.task(self.kind).scan_page_size;
        let mut cursor = None;
        loop {
            let page = self.index.load(cursor, page_size).await?;
            if !page.items.is_empty() {
                self.reconciler
                    .reconcile(&page.items, now, outcome)
                    .await
                    .map_err(|err| err.in_reconcile(self.kind))?;
                self.index.remove_if_unchanged(&page.items).await?;
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let remaining = self.index.len().await?;
        self.metrics.set_active_entities(self.kind, remaining);
        Ok(())
    }

    /// Folds a run into the stats and metrics and invokes the error hook.
    fn finish(&self, result: RunResult, timing: Option<(DateTime<Utc>, Duration)>) -> RunResult {
        self.metrics.record_run(self.kind, result.label());

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.executions += 1;
            match &result {
                RunResult::LockDenied => stats.lock_denied += 1,
                RunResult::Completed(_) => {}
                RunResult::Failed { error, .. } => {
                    stats.failures += 1;
                    stats.last_error = Some(error.to_string());
                }
            }
            if let (Some((started_at, elapsed)), Some(outcome)) = (timing, result.outcome()) {
                stats.last_run_at = Some(started_at);
                stats.duration_ms.record(millis(elapsed));
                stats.keys.record(outcome.keys);
                stats.items.record(outcome.items);
            }
        }

        if let (Some((_, elapsed)), Some(outcome)) = (timing, result.outcome()) {
            self.metrics.observe_run_duration(self.kind, elapsed);
            self.metrics.record_items(self.kind, outcome.items);
        }

        match &result {
            RunResult::Completed(outcome) => tracing::info!(
                keys = outcome.keys,
                items = outcome.items,
                duration_ms = timing.map_or(0, |(_, d)| millis(d)),
                "collection completed"
            ),
            RunResult::Failed { outcome, error } => {
                tracing::error!(
                    error = %error,
                    keys = outcome.keys,
                    items = outcome.items,
                    "collection failed"
                );
                if let Some(hook) = &self.error_hook {
                    hook(self.kind, error);
                }
            }
            RunResult::LockDenied => {}
        }
        result
    }
}

/// Handle to a spawned collector loop.
#[derive(Debug)]
pub struct CollectorHandle {
    kind: TaskKind,
    handle: JoinHandle<()>,
}

impl CollectorHandle {
    /// Returns the task kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Waits for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop panicked or was aborted.
    pub async fn join(self) -> Result<()> {
        self.handle.await.map_err(|err| Error::Collector {
            message: format!("{} collector: {err}", self.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use fleet_core::{HostId, MemoryDatastore, MemoryEphemeralStore};

    use super::*;
    use crate::active::ActiveEntity;

    struct SlowReconciler {
        delay: Duration,
    }

    #[async_trait]
    impl Reconciler for SlowReconciler {
        fn kind(&self) -> TaskKind {
            TaskKind::HostLastSeen
        }

        async fn reconcile(
            &self,
            page: &[ActiveEntity],
            _now: DateTime<Utc>,
            outcome: &mut RunOutcome,
        ) -> Result<()> {
            outcome.keys += reconcile::count(page.len());
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn config() -> Arc<AsyncConfig> {
        Arc::new(AsyncConfig {
            lock_timeout: Duration::from_secs(5),
            ..AsyncConfig::all_enabled()
        })
    }

    async fn seed(store: &MemoryEphemeralStore, kind: TaskKind, hosts: u64) {
        let index = ActiveEntityIndex::new(Arc::new(store.clone()), kind, Duration::from_secs(3600));
        for id in 1..=hosts {
            index.upsert(HostId::new(id), Utc::now()).await.expect("upsert");
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_secs(10);
        for _ in 0..200 {
            let wait = jittered_interval(interval, 20);
            assert!(wait >= Duration::from_secs(8));
            assert!(wait <= Duration::from_secs(12));
        }
        assert_eq!(jittered_interval(interval, 0), interval);
    }

    #[test]
    fn summary_tracks_min_max_last() {
        let mut summary = Summary::default();
        for value in [5, 2, 9, 4] {
            summary.record(value);
        }
        assert_eq!(
            summary,
            Summary {
                min: Some(2),
                max: 9,
                last: 4
            }
        );
    }

    #[tokio::test]
    async fn run_once_drains_index_and_releases_lock() {
        let store = MemoryEphemeralStore::new();
        seed(&store, TaskKind::HostLastSeen, 3).await;
        let datastore = MemoryDatastore::new();
        let collector = Collector::new(
            TaskKind::HostLastSeen,
            Arc::new(store.clone()),
            Arc::new(datastore.clone()),
            config(),
        )
        .expect("collector");

        let result = collector.run_once().await;
        assert!(matches!(result, RunResult::Completed(RunOutcome { keys: 3, items: 3 })));
        assert!(store.keys().expect("keys").is_empty());
        assert!(datastore.seen_at(HostId::new(2)).expect("seen").is_some());

        let stats = collector.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.keys.last, 3);
        assert_eq!(collector.state(), CollectorState::Idle);
    }

    #[tokio::test]
    async fn held_lock_denies_run() {
        let store = MemoryEphemeralStore::new();
        seed(&store, TaskKind::HostLastSeen, 1).await;
        store
            .set_if_absent(
                &keys::lock_key(TaskKind::HostLastSeen),
                "other",
                Duration::from_secs(60),
            )
            .await
            .expect("lock");
        let collector = Collector::new(
            TaskKind::HostLastSeen,
            Arc::new(store.clone()),
            Arc::new(MemoryDatastore::new()),
            config(),
        )
        .expect("collector");

        assert!(matches!(collector.run_once().await, RunResult::LockDenied));
        assert_eq!(collector.stats().lock_denied, 1);
        assert_eq!(
            store
                .get(&keys::lock_key(TaskKind::HostLastSeen))
                .await
                .expect("get")
                .as_deref(),
            Some("other")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_run_times_out_and_keeps_page() {
        let store = MemoryEphemeralStore::new();
        seed(&store, TaskKind::HostLastSeen, 2).await;

        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let collector = Collector::with_reconciler(
            Arc::new(store.clone()),
            Arc::new(SlowReconciler {
                delay: Duration::from_secs(30),
            }),
            config(),
        )
        .expect("collector")
        .with_error_hook(Arc::new(move |_: TaskKind, err: &Error| {
            assert!(err.to_string().contains("timed out"));
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let result = collector.run_once().await;
        assert!(matches!(result, RunResult::Failed { .. }));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(collector.stats().failures, 1);

        let index = ActiveEntityIndex::new(
            Arc::new(store.clone()),
            TaskKind::HostLastSeen,
            Duration::from_secs(3600),
        );
        assert_eq!(index.len().await.expect("len"), 2);
        assert!(store
            .get(&keys::lock_key(TaskKind::HostLastSeen))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_runs_and_stops_on_shutdown() {
        let store = MemoryEphemeralStore::new();
        seed(&store, TaskKind::HostLastSeen, 2).await;
        let datastore = MemoryDatastore::new();
        let collector = Arc::new(
            Collector::new(
                TaskKind::HostLastSeen,
                Arc::new(store.clone()),
                Arc::new(datastore.clone()),
                config(),
            )
            .expect("collector"),
        );

        let shutdown = CancellationToken::new();
        let handle = collector.clone().spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(collector.stats().executions >= 1);
        assert!(datastore.seen_at(HostId::new(1)).expect("seen").is_some());

        shutdown.cancel();
        handle.join().await.expect("join");
        assert_eq!(collector.state(), CollectorState::Stopped);
    }
}
