//! Error types for async host processing.

use fleet_core::TaskKind;

/// The result type used throughout fleet-async.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while buffering or reconciling host results.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A reconciler could not apply a page of buffered results.
    #[error("{kind} reconcile failed: {message}")]
    Reconcile {
        /// Task kind being reconciled.
        kind: TaskKind,
        /// Description of the failure.
        message: String,
        /// Store error that stopped the reconcile.
        #[source]
        source: fleet_core::Error,
    },

    /// A collector task could not be joined.
    #[error("collector task failed: {message}")]
    Collector {
        /// Description of the failure.
        message: String,
    },

    /// An error from fleet-core.
    #[error("core error: {0}")]
    Core(#[from] fleet_core::Error),
}

impl Error {
    /// Creates a new reconcile error.
    #[must_use]
    pub fn reconcile(
        kind: TaskKind,
        message: impl Into<String>,
        source: fleet_core::Error,
    ) -> Self {
        Self::Reconcile {
            kind,
            message: message.into(),
            source,
        }
    }

    /// Attributes a store failure to the reconcile of `kind`.
    ///
    /// Errors that are not store failures are returned unchanged.
    #[must_use]
    pub fn in_reconcile(self, kind: TaskKind) -> Self {
        match self {
            Self::Core(source) => Self::reconcile(kind, source.to_string(), source),
            other => other,
        }
    }

    /// Returns true if a later collection cycle may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Core(err) => err.is_transient(),
            Self::Reconcile { source, .. } => source.is_transient(),
            Self::Collector { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(err.into())
    }
}
