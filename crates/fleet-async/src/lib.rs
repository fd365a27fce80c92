//! # fleet-async
//!
//! Asynchronous host processing for the fleet server.
//!
//! Agent check-ins produce a steady stream of small per-host writes: label and
//! policy query results, scheduled query stats and "last seen" timestamps. Writing
//! each of them to the relational store on the check-in path does not scale, so
//! this crate absorbs them into the ephemeral store and applies them in large
//! batches from a single elected collector per task kind.
//!
//! - **[`Task`]**: the write API used by the check-in path
//! - **[`ActiveEntityIndex`]**: per-kind index of hosts with buffered work
//! - **[`reconcile`]**: per-kind drains from the ephemeral to the durable store
//! - **[`Collector`]**: the locked, jittered, cancellable scheduler
//! - **[`metrics`]**: write and collection metrics
//!
//! ## Guarantees
//!
//! - **Single leader**: at most one collection per kind runs cluster-wide
//! - **No lost updates**: a host that reports while its page is being reconciled
//!   stays listed for the next run
//! - **Bounded runs**: a run never outlives its lock
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use fleet_async::{Collector, Task};
//! use fleet_core::{AsyncConfig, HostId, LabelId, MemoryDatastore, MemoryEphemeralStore, TaskKind};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> fleet_async::Result<()> {
//! let config = Arc::new(AsyncConfig::all_enabled());
//! let store = Arc::new(MemoryEphemeralStore::new());
//! let datastore = Arc::new(MemoryDatastore::new());
//!
//! let task = Task::new(store.clone(), datastore.clone(), config.clone())?;
//! let results = BTreeMap::from([(LabelId::new(1), true)]);
//! task.record_label_query_executions(HostId::new(7), &results, Utc::now()).await?;
//!
//! let collector = Arc::new(Collector::new(TaskKind::LabelMembership, store, datastore, config)?);
//! let shutdown = CancellationToken::new();
//! let handle = collector.spawn(shutdown.clone());
//! shutdown.cancel();
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod active;
pub mod collector;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod reconcile;
pub mod task;

pub use active::{ActiveEntity, ActiveEntityIndex};
pub use collector::{
    Collector, CollectorHandle, CollectorState, CollectorStats, ErrorHook, RunResult,
};
pub use error::{Error, Result};
pub use reconcile::{Reconciler, RunOutcome};
pub use task::Task;
