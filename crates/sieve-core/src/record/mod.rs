//! Strongly-consistent key-value record store.
//!
//! This module provides:
//!
//! - [`RecordStore`]: get / conditional put / conditional update / conditional delete
//! - [`Condition`]: the preconditions a write can carry
//! - [`MemoryRecordStore`]: in-process store for tests and single-process runs
//! - [`ObjectRecordStore`]: records as JSON objects on any [`StorageBackend`]
//!
//! ## Semantics
//!
//! - Reads are strongly consistent: a read issued after a write completes
//!   observes that write.
//! - A failed condition is an ordinary [`WriteOutcome::ConditionFailed`],
//!   never an error. Callers drive their retry loops from it.
//! - `update` merges the given fields into the record; an unconditioned
//!   update on a missing record creates it.
//!
//! [`StorageBackend`]: crate::storage::StorageBackend

pub mod memory;
pub mod object;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub use memory::MemoryRecordStore;
pub use object::ObjectRecordStore;

/// A stored record: a flat map of named attributes.
pub type Record = serde_json::Map<String, Value>;

/// Precondition attached to a record write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Write unconditionally.
    None,
    /// Write only if no record exists under the key (create-if-absent).
    NotExists,
    /// Write only if the record exists and `field` currently equals `value`.
    FieldEquals {
        /// Attribute name.
        field: String,
        /// Expected current value.
        value: Value,
    },
}

impl Condition {
    /// Builds a field-equality condition.
    #[must_use]
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Evaluates the condition against the currently stored record.
    #[must_use]
    pub fn is_satisfied_by(&self, current: Option<&Record>) -> bool {
        match self {
            Self::None => true,
            Self::NotExists => current.is_none(),
            Self::FieldEquals { field, value } => {
                current.and_then(|record| record.get(field)) == Some(value)
            }
        }
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied.
    Applied,
    /// The precondition did not hold; nothing was written.
    ConditionFailed,
}

impl WriteOutcome {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Key-value record store with conditional writes.
///
/// Records are addressed by `(table, key)`. Implementations must make each
/// conditional write atomic with respect to its condition check.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Reads a record with strong consistency.
    ///
    /// Returns `None` if no record exists.
    async fn get(&self, table: &str, key: &str) -> Result<Option<Record>>;

    /// Replaces the whole record if `condition` holds.
    async fn put(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: Condition,
    ) -> Result<WriteOutcome>;

    /// Merges `changes` into the record if `condition` holds.
    async fn update(
        &self,
        table: &str,
        key: &str,
        changes: Record,
        condition: Condition,
    ) -> Result<WriteOutcome>;

    /// Deletes the record if `condition` holds.
    ///
    /// Deleting a missing record with [`Condition::None`] is a no-op that
    /// reports `Applied`.
    async fn delete(&self, table: &str, key: &str, condition: Condition) -> Result<WriteOutcome>;
}

/// Converts a serializable value into a record.
///
/// # Errors
///
/// Returns `Error::Serialization` if the value does not serialize to a JSON object.
pub fn to_record<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::serialization(format!(
            "record must serialize to an object, got {other}"
        ))),
        Err(e) => Err(Error::serialization(format!("serialize record: {e}"))),
    }
}

/// Converts a record into a typed value.
///
/// # Errors
///
/// Returns `Error::Serialization` if the record does not match `T`.
pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T> {
    serde_json::from_value(Value::Object(record))
        .map_err(|e| Error::serialization(format!("parse record: {e}")))
}

/// Applies an update to the current record, creating it when absent.
pub(crate) fn merged(current: Option<&Record>, changes: Record) -> Record {
    let mut record = current.cloned().unwrap_or_default();
    record.extend(changes);
    record
}

/// Builds a single-field record.
#[must_use]
pub fn single_field(field: impl Into<String>, value: impl Into<Value>) -> Record {
    let mut record = Record::new();
    record.insert(field.into(), value.into());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Sample {
        row_count: u64,
    }

    #[test]
    fn condition_none_always_holds() {
        assert!(Condition::None.is_satisfied_by(None));
        assert!(Condition::None.is_satisfied_by(Some(&Record::new())));
    }

    #[test]
    fn condition_not_exists() {
        assert!(Condition::NotExists.is_satisfied_by(None));
        assert!(!Condition::NotExists.is_satisfied_by(Some(&Record::new())));
    }

    #[test]
    fn condition_field_equals_requires_record_and_value() {
        let cond = Condition::field_equals("Holder", "a");
        let held_by_a = single_field("Holder", "a");
        let held_by_b = single_field("Holder", "b");

        assert!(cond.is_satisfied_by(Some(&held_by_a)));
        assert!(!cond.is_satisfied_by(Some(&held_by_b)));
        assert!(!cond.is_satisfied_by(Some(&Record::new())));
        assert!(!cond.is_satisfied_by(None));
    }

    #[test]
    fn typed_record_conversion() {
        let record = to_record(&Sample { row_count: 7 }).unwrap();
        assert_eq!(record.get("RowCount"), Some(&json!(7)));
        let back: Sample = from_record(record).unwrap();
        assert_eq!(back, Sample { row_count: 7 });
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            to_record(&42u32),
            Err(Error::Serialization { .. })
        ));
    }
}
