//! Atomic numeric fields on coordination records.
//!
//! [`AtomicCounter::increment`] is a read / compare-and-set loop: it reads
//! the field, writes `value + delta` conditioned on the field still holding
//! `value`, and retries after a fixed wait when the condition fails. Each
//! successful call therefore owns the half-open interval `[before, after)`,
//! and concurrent callers receive disjoint intervals. The row allocator of
//! the output writer is built on this.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::{single_field, Condition, Record, RecordStore, WriteOutcome};

/// Default wait between compare-and-set attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// The value of a counter field around one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// Value before the increment.
    pub before: u64,
    /// Value after the increment.
    pub after: u64,
}

impl Increment {
    /// Returns the interval this increment claimed.
    #[must_use]
    pub const fn range(self) -> Range<u64> {
        self.before..self.after
    }
}

/// Increments integer fields of records in one table.
pub struct AtomicCounter<R: RecordStore + ?Sized> {
    store: Arc<R>,
    table: String,
    retry_interval: Duration,
}

impl<R: RecordStore + ?Sized> Clone for AtomicCounter<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            table: self.table.clone(),
            retry_interval: self.retry_interval,
        }
    }
}

impl<R: RecordStore + ?Sized> AtomicCounter<R> {
    /// Creates a counter over records in `table`.
    #[must_use]
    pub fn new(store: Arc<R>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Sets the wait between compare-and-set attempts.
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Returns the table this counter operates on.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the record with the given initial field values if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn initialize(&self, key: &str, fields: &[(&str, u64)]) -> Result<WriteOutcome> {
        let record: Record = fields
            .iter()
            .map(|(name, value)| ((*name).to_string(), Value::from(*value)))
            .collect();
        self.store
            .put(&self.table, key, record, Condition::NotExists)
            .await
    }

    /// Reads the current value of `field`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the record or field is missing.
    pub async fn current(&self, key: &str, field: &str) -> Result<u64> {
        let record = self
            .store
            .get(&self.table, key)
            .await?
            .ok_or_else(|| Error::resource_not_found("counter record", key))?;
        read_field(&record, key, field)
    }

    /// Atomically adds `delta` to `field`, returning the values around the change.
    ///
    /// A zero delta reads the field and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the record or field is missing,
    /// `InvalidInput` if the addition would overflow, or a store error.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn increment(&self, key: &str, field: &str, delta: u64) -> Result<Increment> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let before = self.current(key, field).await?;
            if delta == 0 {
                return Ok(Increment { before, after: before });
            }

            let after = before.checked_add(delta).ok_or_else(|| {
                Error::InvalidInput(format!("counter {key}.{field} overflows at {before} + {delta}"))
            })?;

            let outcome = self
                .store
                .update(
                    &self.table,
                    key,
                    single_field(field, after),
                    Condition::field_equals(field, before),
                )
                .await?;

            match outcome {
                WriteOutcome::Applied => {
                    tracing::trace!(before, after, attempts, "counter incremented");
                    return Ok(Increment { before, after });
                }
                WriteOutcome::ConditionFailed => {
                    tracing::trace!(before, attempts, "counter contended; retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

fn read_field(record: &Record, key: &str, field: &str) -> Result<u64> {
    let value = record
        .get(field)
        .ok_or_else(|| Error::resource_not_found("counter field", format!("{key}.{field}")))?;
    value.as_u64().ok_or_else(|| {
        Error::InvalidInput(format!(
            "counter {key}.{field} is not a non-negative integer: {value}"
        ))
    })
}
