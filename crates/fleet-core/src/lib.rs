//! # fleet-core
//!
//! Shared primitives for asynchronous host processing in the fleet server.
//!
//! This crate provides the types and contracts used by the write buffer, the
//! reconcilers and the collector service:
//!
//! - **Identifiers**: Strongly-typed host, label, policy and scheduled query IDs
//! - **Task kinds**: The four reconciliation domains and their key prefixes
//! - **Ephemeral store**: Command-based contract for the fast TTL store, with an
//!   in-memory backend
//! - **Datastore**: Column-scoped batch contract for the durable store, with an
//!   in-memory backend
//! - **Configuration**: Per-kind async processing settings loaded from the environment
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use fleet_core::prelude::*;
//!
//! let config = AsyncConfig::default();
//! assert!(!config.task(TaskKind::LabelMembership).enabled);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod datastore;
pub mod ephemeral;
pub mod error;
pub mod id;
pub mod kind;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{AsyncConfig, TaskConfig};
    pub use crate::datastore::{
        Datastore, HostScheduledQueryStats, LabelMembership, PolicyMembership, PolicyResult,
        ScheduledQueryStats,
    };
    pub use crate::ephemeral::{
        Command, EphemeralStore, EphemeralStoreExt, Reply, ScanCursor, ScanPage,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::{HostId, LabelId, PolicyId, ScheduledQueryId};
    pub use crate::kind::TaskKind;
}

pub use config::{AsyncConfig, TaskConfig};
pub use datastore::memory::MemoryDatastore;
pub use datastore::{
    Datastore, HostScheduledQueryStats, LabelMembership, PolicyMembership, PolicyResult,
    ScheduledQueryStats,
};
pub use ephemeral::memory::MemoryEphemeralStore;
pub use ephemeral::{Command, EphemeralStore, EphemeralStoreExt, Reply, ScanCursor, ScanPage};
pub use error::{Error, Result};
pub use id::{HostId, LabelId, PolicyId, ScheduledQueryId};
pub use kind::TaskKind;
pub use observability::{LogFormat, init_logging};
