//! Pipeline configuration.
//!
//! Configuration is an explicit struct handed to the pipeline at start-up.
//! [`PipelineConfig::from_env`] reads the `SIEVE_*` process environment with
//! strict validation; tests use [`PipelineConfig::from_env_with`] or the
//! builder methods instead of mutating the process environment.

use std::time::Duration;

use sieve_core::lock::{LockOptions, DEFAULT_LEASE, DEFAULT_LOCK_TABLE, DEFAULT_POLL_INTERVAL};
use sieve_core::LogFormat;

use crate::error::{Error, Result};
use crate::output::Compression;

const ENV_ROWS_PER_CHUNK: &str = "SIEVE_ROWS_PER_CHUNK";
const ENV_LOCK_LEASE_MS: &str = "SIEVE_LOCK_LEASE_MS";
const ENV_LOCK_POLL_MS: &str = "SIEVE_LOCK_POLL_MS";
const ENV_COUNTER_RETRY_MS: &str = "SIEVE_COUNTER_RETRY_MS";
const ENV_RESULT_PREFIX: &str = "SIEVE_RESULT_PREFIX";
const ENV_OUTPUT_COMPRESSION: &str = "SIEVE_OUTPUT_COMPRESSION";
const ENV_STATE_TABLE: &str = "SIEVE_STATE_TABLE";
const ENV_LOCK_TABLE: &str = "SIEVE_LOCK_TABLE";
const ENV_OUTPUT_TABLE: &str = "SIEVE_OUTPUT_TABLE";
const ENV_TIMING_TABLE: &str = "SIEVE_TIMING_TABLE";
const ENV_LOG_FORMAT: &str = "SIEVE_LOG_FORMAT";

/// Default rows per output chunk.
pub const DEFAULT_ROWS_PER_CHUNK: u64 = 3000;
const DEFAULT_COUNTER_RETRY_MS: u64 = 10;
const DEFAULT_RESULT_PREFIX: &str = "results";

/// Record-store table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Per-request stage counts.
    pub request_state: String,
    /// Lock records.
    pub locks: String,
    /// Output row allocators.
    pub output_rows: String,
    /// Stage timing events.
    pub timing: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            request_state: "request_state".to_string(),
            locks: DEFAULT_LOCK_TABLE.to_string(),
            output_rows: "output_rows".to_string(),
            timing: "timing".to_string(),
        }
    }
}

/// Configuration shared by every stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Rows per output chunk.
    pub rows_per_chunk: u64,
    /// Chunk lock lease and polling.
    pub lock: LockOptions,
    /// Wait between counter compare-and-set attempts.
    pub counter_retry: Duration,
    /// Blob prefix under which request results are written.
    pub result_prefix: String,
    /// Codec for output chunks.
    pub compression: Compression,
    /// Record-store tables.
    pub tables: TableNames,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rows_per_chunk: DEFAULT_ROWS_PER_CHUNK,
            lock: LockOptions::default(),
            counter_retry: Duration::from_millis(DEFAULT_COUNTER_RETRY_MS),
            result_prefix: DEFAULT_RESULT_PREFIX.to_string(),
            compression: Compression::default(),
            tables: TableNames::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// `SIEVE_LOCK_LEASE_MS=none` disables lease expiration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a numeric value is not a positive
    /// integer, a string value is empty, or an enum value is unknown.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rows_per_chunk =
            parse_positive_u64_env(&get_env, ENV_ROWS_PER_CHUNK, DEFAULT_ROWS_PER_CHUNK)?;

        let lease = match get_env(ENV_LOCK_LEASE_MS) {
            Some(raw) if raw.trim().eq_ignore_ascii_case("none") => None,
            _ => Some(Duration::from_millis(parse_positive_u64_env(
                &get_env,
                ENV_LOCK_LEASE_MS,
                whole_millis(DEFAULT_LEASE),
            )?)),
        };
        let poll_interval = Duration::from_millis(parse_positive_u64_env(
            &get_env,
            ENV_LOCK_POLL_MS,
            whole_millis(DEFAULT_POLL_INTERVAL),
        )?);
        let counter_retry = Duration::from_millis(parse_positive_u64_env(
            &get_env,
            ENV_COUNTER_RETRY_MS,
            DEFAULT_COUNTER_RETRY_MS,
        )?);

        let compression = match get_env(ENV_OUTPUT_COMPRESSION) {
            Some(raw) => raw.parse()?,
            None => defaults.compression,
        };
        let log_format = match get_env(ENV_LOG_FORMAT) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::configuration(format!("{ENV_LOG_FORMAT}: {e}")))?,
            None => defaults.log_format,
        };

        Ok(Self {
            rows_per_chunk,
            lock: LockOptions {
                lease,
                poll_interval,
            },
            counter_retry,
            result_prefix: parse_name_env(&get_env, ENV_RESULT_PREFIX, &defaults.result_prefix)?,
            compression,
            tables: TableNames {
                request_state: parse_name_env(
                    &get_env,
                    ENV_STATE_TABLE,
                    &defaults.tables.request_state,
                )?,
                locks: parse_name_env(&get_env, ENV_LOCK_TABLE, &defaults.tables.locks)?,
                output_rows: parse_name_env(
                    &get_env,
                    ENV_OUTPUT_TABLE,
                    &defaults.tables.output_rows,
                )?,
                timing: parse_name_env(&get_env, ENV_TIMING_TABLE, &defaults.tables.timing)?,
            },
            log_format,
        })
    }

    /// Sets rows per output chunk.
    #[must_use]
    pub const fn with_rows_per_chunk(mut self, rows_per_chunk: u64) -> Self {
        self.rows_per_chunk = rows_per_chunk;
        self
    }

    /// Sets chunk lock options.
    #[must_use]
    pub const fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the counter retry interval.
    #[must_use]
    pub const fn with_counter_retry(mut self, counter_retry: Duration) -> Self {
        self.counter_retry = counter_retry;
        self
    }

    /// Sets the output compression.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Checks invariants that builder methods cannot enforce.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `rows_per_chunk` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.rows_per_chunk == 0 {
            return Err(Error::configuration("rows_per_chunk must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_name_env<F>(get_env: &F, key: &str, default: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(key) {
        None => Ok(default.to_string()),
        Some(raw) if raw.trim().is_empty() => {
            Err(Error::configuration(format!("{key} must not be empty")))
        }
        Some(raw) => Ok(raw.trim().to_string()),
    }
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
