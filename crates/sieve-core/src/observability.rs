//! Logging initialization and span constructors.
//!
//! Every pipeline stage runs inside a span carrying the request id, so log
//! lines from concurrent requests can be told apart.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected 'json' or 'pretty')"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sieve_flow=debug`)
///
/// # Example
///
/// ```rust
/// use sieve_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        // try_init: a host application may already have installed a subscriber.
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
    });
}

/// Creates a span for one pipeline stage invocation.
///
/// # Example
///
/// ```rust
/// use sieve_core::observability::stage_span;
///
/// let span = stage_span("mapper", "01J0000000000000000000000", "chunked");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn stage_span(stage: &str, request_id: &str, format: &str) -> Span {
    tracing::info_span!(
        "stage",
        stage = stage,
        request_id = request_id,
        format = format,
    )
}

/// Creates a span for coordination primitive calls (locks, counters).
#[must_use]
pub fn coordination_span(operation: &str, key: &str) -> Span {
    tracing::debug_span!("coordination", op = operation, key = key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn stage_span_enters() {
        let span = stage_span("reducer", "01ABC", "row_groups");
        let _guard = span.enter();
        tracing::info!("inside stage span");
    }
}
