//! Shared harness for collector integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use fleet_async::{ActiveEntityIndex, Collector, RunOutcome, RunResult, Task};
use fleet_core::{AsyncConfig, Datastore, MemoryDatastore, MemoryEphemeralStore, TaskKind};

/// In-memory stores, a write API and collectors sharing one config.
pub struct Harness {
    pub store: MemoryEphemeralStore,
    pub datastore: MemoryDatastore,
    pub config: Arc<AsyncConfig>,
    pub task: Task,
}

impl Harness {
    pub fn new(config: AsyncConfig) -> Self {
        let datastore = MemoryDatastore::new();
        Self::with_datastore(config, datastore.clone(), Arc::new(datastore))
    }

    /// Builds a harness whose write API and collectors go through `wrapped`,
    /// while `datastore` stays available for inspection.
    pub fn with_datastore(
        config: AsyncConfig,
        datastore: MemoryDatastore,
        wrapped: Arc<dyn Datastore>,
    ) -> Self {
        let store = MemoryEphemeralStore::new();
        let config = Arc::new(config);
        let task = Task::new(Arc::new(store.clone()), wrapped, config.clone()).expect("task");
        Self {
            store,
            datastore,
            config,
            task,
        }
    }

    pub fn collector(&self, kind: TaskKind) -> Collector {
        self.collector_over(kind, Arc::new(self.datastore.clone()))
    }

    pub fn collector_over(&self, kind: TaskKind, datastore: Arc<dyn Datastore>) -> Collector {
        Collector::new(
            kind,
            Arc::new(self.store.clone()),
            datastore,
            self.config.clone(),
        )
        .expect("collector")
    }

    pub fn index(&self, kind: TaskKind) -> ActiveEntityIndex {
        ActiveEntityIndex::new(Arc::new(self.store.clone()), kind, self.config.key_retention)
    }
}

/// Unwraps a completed run.
pub fn completed(result: RunResult) -> RunOutcome {
    match result {
        RunResult::Completed(outcome) => outcome,
        other => panic!("expected a completed run, got {other:?}"),
    }
}
