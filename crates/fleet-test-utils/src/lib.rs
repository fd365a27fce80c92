//! Shared test utilities for fleet async host processing.
//!
//! This crate provides:
//! - [`FailingDatastore`] and [`FailingEphemeralStore`]: wrappers that inject
//!   failures into chosen operations
//! - [`RecordingDatastore`]: a wrapper that records every batch call
//! - Factory functions for configs, timestamps and stats rows
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_test_utils::{DatastoreOp, FailingDatastore, test_config};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let datastore = FailingDatastore::new(MemoryDatastore::new());
//!     datastore.fail_once(DatastoreOp::InsertLabelMemberships);
//!     // ... run a collector ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod datastore;
pub mod ephemeral;
pub mod fixtures;

pub use datastore::*;
pub use ephemeral::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleet_async=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
