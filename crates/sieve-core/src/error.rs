//! Error types and result aliases for sieve.
//!
//! This module defines the shared error types used by the coordination
//! primitives. Conditional-write conflicts are deliberately absent: they are
//! reported as [`WriteOutcome::ConditionFailed`](crate::record::WriteOutcome)
//! and retried by the caller, never surfaced as errors.

use std::fmt;
use std::time::Duration;

/// The result type used throughout sieve-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed (store unavailable, I/O error, ...).
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An expected coordination record (or one of its fields) was missing.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A blob path was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lock release was attempted by a caller that no longer holds it.
    ///
    /// Signals a coordination bug or a lease that was taken over after expiry.
    #[error("lock {key} is not held by {holder}")]
    LockNotHeld {
        /// The lock resource key.
        key: String,
        /// The holder token that attempted the release.
        holder: String,
    },

    /// A bounded lock acquisition gave up.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout {
        /// The lock resource key.
        key: String,
        /// How long the caller waited.
        waited: Duration,
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

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by the underlying store being unavailable.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn lock_not_held_display_names_key_and_holder() {
        let err = Error::LockNotHeld {
            key: "req/data/3".into(),
            holder: "01HOLDER".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("req/data/3"));
        assert!(msg.contains("01HOLDER"));
    }

    #[test]
    fn storage_error_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
        let err = Error::storage_with_source("record store unavailable", source);
        assert!(err.is_transient());
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn not_found_is_not_transient() {
        let err = Error::resource_not_found("request state", "01ABC");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "not found: request state with id 01ABC");
    }
}
