//! Error types and result aliases for fleet async processing.
//!
//! Errors are structured for programmatic handling: store failures keep their
//! source, type mismatches carry the offending key, and configuration errors name
//! the setting that was rejected.

/// The result type used throughout fleet-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fleet store and configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A command was applied to a key holding a different data type.
    #[error("wrong type for key {key}: expected {expected}")]
    WrongType {
        /// The key that was accessed.
        key: String,
        /// The data type the command expected.
        expected: &'static str,
    },

    /// The ephemeral store returned a reply of an unexpected shape.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        /// Name of the command that was executed.
        command: &'static str,
        /// Debug rendering of the reply.
        reply: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value was missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid setting.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// How long the operation ran before being abandoned.
        elapsed_ms: u64,
    },

    /// An operation was cancelled by shutdown.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// The operation that was cancelled.
        operation: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if retrying the operation on a later cycle may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Timeout { .. } | Self::Cancelled { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn storage_error_display() {
        let err = Error::storage("connection reset");
        assert_eq!(err.to_string(), "storage error: connection reset");
        assert!(err.source().is_none());
    }

    #[test]
    fn storage_error_keeps_source() {
        let io = std::io::Error::other("broken pipe");
        let err = Error::storage_with_source("write buffer", io);
        assert!(err.source().is_some());
    }

    #[test]
    fn wrong_type_names_key() {
        let err = Error::WrongType {
            key: "label_membership:{7}".into(),
            expected: "sorted set",
        };
        let msg = err.to_string();
        assert!(msg.contains("label_membership:{7}"));
        assert!(msg.contains("sorted set"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::storage("x").is_transient());
        assert!(Error::Cancelled {
            operation: "collect".into()
        }
        .is_transient());
        assert!(!Error::configuration("bad").is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
    }

    #[test]
    fn json_errors_convert_to_serialization() {
        let err: Error = serde_json::from_str::<u64>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
