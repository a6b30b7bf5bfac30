//! Error types for the pipeline domain.

use sieve_core::RequestId;

/// The result type used throughout sieve-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A trigger payload was malformed. Surfaced synchronously by the driver.
    #[error("invalid request: {message}")]
    Validation {
        /// Description of what was wrong with the payload.
        message: String,
        /// Required keys absent from the payload, if that was the problem.
        missing_keys: Vec<String>,
    },

    /// The requested format has no registered plugin.
    #[error("unknown format: {format}")]
    UnknownFormat {
        /// The format name that was requested.
        format: String,
    },

    /// No coordination state exists for the request.
    #[error("request not found: {request_id}")]
    RequestNotFound {
        /// The request ID that was looked up.
        request_id: RequestId,
    },

    /// A filter expression was rejected.
    #[error("invalid filter expression: {message}")]
    Filter {
        /// Why the expression was rejected.
        message: String,
    },

    /// A format plugin failed on malformed input data.
    #[error("{format} plugin error: {message}")]
    Plugin {
        /// The plugin's format name.
        format: String,
        /// Description of the failure.
        message: String,
    },

    /// Invalid configuration or plugin registration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Array data did not match the declared shape or dtype.
    #[error("shape mismatch: {message}")]
    Shape {
        /// Description of the mismatch.
        message: String,
    },

    /// Stage dispatch failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from sieve-core.
    #[error("core error: {0}")]
    Core(#[from] sieve_core::error::Error),
}

impl Error {
    /// Creates a validation error without missing keys.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            missing_keys: Vec::new(),
        }
    }

    /// Creates a validation error listing every missing key.
    #[must_use]
    pub fn missing_keys(keys: Vec<String>) -> Self {
        Self::Validation {
            message: format!("missing required keys: {}", keys.join(", ")),
            missing_keys: keys,
        }
    }

    /// Creates a filter error.
    #[must_use]
    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }

    /// Creates a plugin error.
    #[must_use]
    pub fn plugin(format: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    /// Creates a dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for request-acceptance failures reported back to the caller.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::UnknownFormat { .. })
    }

    /// Returns true if a lock release was attempted without holding the lock.
    #[must_use]
    pub const fn is_lock_not_held(&self) -> bool {
        matches!(
            self,
            Self::Core(sieve_core::Error::LockNotHeld { .. })
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

    #[test]
    fn missing_keys_lists_all() {
        let err = Error::missing_keys(vec!["format".into(), "inputs".into()]);
        let msg = err.to_string();
        assert!(msg.contains("format"));
        assert!(msg.contains("inputs"));
        assert!(err.is_validation());
    }

    #[test]
    fn unknown_format_is_validation() {
        let err = Error::UnknownFormat {
            format: "hdf5".into(),
        };
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "unknown format: hdf5");
    }

    #[test]
    fn core_lock_error_is_detectable() {
        let err: Error = sieve_core::Error::LockNotHeld {
            key: "k".into(),
            holder: "h".into(),
        }
        .into();
        assert!(err.is_lock_not_held());
        assert!(!err.is_validation());
    }
}
