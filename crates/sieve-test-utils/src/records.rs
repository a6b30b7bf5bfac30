//! Record store with operation tracing and injected failures.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sieve_core::error::{Error, Result};
use sieve_core::record::{Condition, MemoryRecordStore, Record, RecordStore, WriteOutcome};

/// Kind of record-store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordOpKind {
    /// Strongly-consistent read.
    Get,
    /// Whole-record put.
    Put,
    /// Merge update.
    Update,
    /// Delete.
    Delete,
}

impl RecordOpKind {
    /// Returns true for writes.
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Get)
    }
}

/// Record of one record-store call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOp {
    /// Call kind.
    pub kind: RecordOpKind,
    /// Table.
    pub table: String,
    /// Key.
    pub key: String,
    /// Write condition, `None` for reads.
    pub condition: Option<Condition>,
    /// Write outcome, `None` for reads and failed calls.
    pub outcome: Option<WriteOutcome>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    table: String,
    key_prefix: String,
    writes_only: bool,
}

impl FailureRule {
    fn matches(&self, kind: RecordOpKind, table: &str, key: &str) -> bool {
        self.table == table
            && key.starts_with(&self.key_prefix)
            && (!self.writes_only || kind.is_write())
    }
}

/// In-memory record store that records every call.
///
/// Records live in a [`MemoryRecordStore`]. Injected failures surface as
/// `Error::Storage`, the same way an unavailable store would.
#[derive(Debug, Clone, Default)]
pub struct TracingRecordStore {
    inner: MemoryRecordStore,
    operations: Arc<Mutex<Vec<RecordOp>>>,
    failures: Arc<Mutex<Vec<FailureRule>>>,
}

impl TracingRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<RecordOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded operations against `table`.
    #[must_use]
    pub fn operations_on(&self, table: &str) -> Vec<RecordOp> {
        self.operations()
            .into_iter()
            .filter(|op| op.table == table)
            .collect()
    }

    /// Number of conditional writes whose condition did not hold.
    #[must_use]
    pub fn condition_failures(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| op.outcome == Some(WriteOutcome::ConditionFailed))
            .count()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every call on `table` whose key starts with `key_prefix`.
    pub fn inject_failure(&self, table: impl Into<String>, key_prefix: impl Into<String>) {
        self.push_rule(table.into(), key_prefix.into(), false);
    }

    /// Fails writes on `table` whose key starts with `key_prefix`; reads succeed.
    pub fn inject_write_failure(&self, table: impl Into<String>, key_prefix: impl Into<String>) {
        self.push_rule(table.into(), key_prefix.into(), true);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.failures.lock().expect("lock").clear();
    }

    fn push_rule(&self, table: String, key_prefix: String, writes_only: bool) {
        self.failures.lock().expect("lock").push(FailureRule {
            table,
            key_prefix,
            writes_only,
        });
    }

    fn check_failure(&self, kind: RecordOpKind, table: &str, key: &str) -> Result<()> {
        let failures = self.failures.lock().expect("lock");
        if failures.iter().any(|rule| rule.matches(kind, table, key)) {
            return Err(Error::storage(format!(
                "injected {kind:?} failure for {table}/{key}"
            )));
        }
        Ok(())
    }

    fn record(
        &self,
        kind: RecordOpKind,
        table: &str,
        key: &str,
        condition: Option<Condition>,
        outcome: Option<WriteOutcome>,
    ) {
        self.operations.lock().expect("lock").push(RecordOp {
            kind,
            table: table.to_string(),
            key: key.to_string(),
            condition,
            outcome,
        });
    }
}

#[async_trait]
impl RecordStore for TracingRecordStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Record>> {
        self.check_failure(RecordOpKind::Get, table, key)?;
        self.record(RecordOpKind::Get, table, key, None, None);
        self.inner.get(table, key).await
    }

    async fn put(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        self.check_failure(RecordOpKind::Put, table, key)?;
        let outcome = self.inner.put(table, key, record, condition.clone()).await?;
        self.record(RecordOpKind::Put, table, key, Some(condition), Some(outcome));
        Ok(outcome)
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        changes: Record,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        self.check_failure(RecordOpKind::Update, table, key)?;
        let outcome = self
            .inner
            .update(table, key, changes, condition.clone())
            .await?;
        self.record(RecordOpKind::Update, table, key, Some(condition), Some(outcome));
        Ok(outcome)
    }

    async fn delete(&self, table: &str, key: &str, condition: Condition) -> Result<WriteOutcome> {
        self.check_failure(RecordOpKind::Delete, table, key)?;
        let outcome = self.inner.delete(table, key, condition.clone()).await?;
        self.record(RecordOpKind::Delete, table, key, Some(condition), Some(outcome));
        Ok(outcome)
    }
}
