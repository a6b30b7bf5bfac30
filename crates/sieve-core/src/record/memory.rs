//! In-memory record store.
//!
//! ## Limitations
//!
//! - **Single-process only**: records are not visible across process boundaries
//! - **No persistence**: all state is lost when the process exits

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::{merged, Condition, Record, RecordStore, WriteOutcome};
use crate::error::{Error, Result};

type Tables = HashMap<String, HashMap<String, Record>>;

/// In-memory record store.
///
/// Every conditional write evaluates its condition and applies the change
/// under one write lock, which makes the store linearizable.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
    tables: Arc<RwLock<Tables>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("record store lock poisoned")
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self, table: &str) -> Result<usize> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.get(table).map_or(0, HashMap::len))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Record>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let rows = tables.entry(table.to_string()).or_default();

        if !condition.is_satisfied_by(rows.get(key)) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        rows.insert(key.to_string(), record);
        drop(tables);
        Ok(WriteOutcome::Applied)
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        changes: Record,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let rows = tables.entry(table.to_string()).or_default();

        let current = rows.get(key);
        if !condition.is_satisfied_by(current) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        let next = merged(current, changes);
        rows.insert(key.to_string(), next);
        drop(tables);
        Ok(WriteOutcome::Applied)
    }

    async fn delete(&self, table: &str, key: &str, condition: Condition) -> Result<WriteOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let rows = tables.entry(table.to_string()).or_default();

        if !condition.is_satisfied_by(rows.get(key)) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        rows.remove(key);
        drop(tables);
        Ok(WriteOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::single_field;
    use serde_json::json;

    #[tokio::test]
    async fn put_if_absent_only_once() {
        let store = MemoryRecordStore::new();
        let first = store
            .put("t", "k", single_field("v", 1), Condition::NotExists)
            .await
            .unwrap();
        let second = store
            .put("t", "k", single_field("v", 2), Condition::NotExists)
            .await
            .unwrap();

        assert_eq!(first, WriteOutcome::Applied);
        assert_eq!(second, WriteOutcome::ConditionFailed);
        let record = store.get("t", "k").await.unwrap().unwrap();
        assert_eq!(record.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = MemoryRecordStore::new();
        let mut initial = single_field("a", 1);
        initial.insert("b".into(), json!(2));
        store.put("t", "k", initial, Condition::None).await.unwrap();

        let outcome = store
            .update("t", "k", single_field("b", 3), Condition::field_equals("b", 2))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let record = store.get("t", "k").await.unwrap().unwrap();
        assert_eq!(record.get("a"), Some(&json!(1)));
        assert_eq!(record.get("b"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn stale_field_condition_fails_without_writing() {
        let store = MemoryRecordStore::new();
        store
            .put("t", "k", single_field("n", 5), Condition::None)
            .await
            .unwrap();

        let outcome = store
            .update("t", "k", single_field("n", 9), Condition::field_equals("n", 4))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);
        let record = store.get("t", "k").await.unwrap().unwrap();
        assert_eq!(record.get("n"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn unconditioned_update_creates_record() {
        let store = MemoryRecordStore::new();
        store
            .update("timing", "r1", single_field("DriverStarted", "x"), Condition::None)
            .await
            .unwrap();
        assert_eq!(store.len("timing").unwrap(), 1);
    }

    #[tokio::test]
    async fn conditional_delete() {
        let store = MemoryRecordStore::new();
        store
            .put("t", "k", single_field("holder", "a"), Condition::None)
            .await
            .unwrap();

        let wrong = store
            .delete("t", "k", Condition::field_equals("holder", "b"))
            .await
            .unwrap();
        assert_eq!(wrong, WriteOutcome::ConditionFailed);
        assert!(store.get("t", "k").await.unwrap().is_some());

        let right = store
            .delete("t", "k", Condition::field_equals("holder", "a"))
            .await
            .unwrap();
        assert_eq!(right, WriteOutcome::Applied);
        assert!(store.get("t", "k").await.unwrap().is_none());
    }
}
