//! Record store layered on blob storage.
//!
//! Each record is one JSON document at `{prefix}/{table}/{key}.json`.
//! Conditional writes are evaluated against a read that is bound to the
//! object's version, then committed with a `MatchesVersion` (or
//! `DoesNotExist`) precondition. If another writer slipped in between, the
//! blob CAS fails and the whole read-evaluate-write cycle is repeated, so the
//! field condition is always evaluated against the version being replaced.
//!
//! Deletes write a versioned tombstone instead of removing the object. An
//! unconditional blob delete could remove a record that a concurrent writer
//! has just re-created.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{merged, Condition, Record, RecordStore, WriteOutcome};
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default path prefix for record documents.
pub const DEFAULT_RECORD_PREFIX: &str = "records";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    deleted: bool,
    #[serde(default)]
    fields: Record,
}

impl StoredRecord {
    fn live(self) -> Option<Record> {
        if self.deleted {
            None
        } else {
            Some(self.fields)
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Replace(Record),
    Merge(Record),
    Delete,
}

/// Record store backed by any [`StorageBackend`].
pub struct ObjectRecordStore<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    prefix: String,
}

impl<S: StorageBackend + ?Sized> Clone for ObjectRecordStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> ObjectRecordStore<S> {
    /// Creates a store rooted at [`DEFAULT_RECORD_PREFIX`].
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_prefix(storage, DEFAULT_RECORD_PREFIX)
    }

    /// Creates a store rooted at a custom prefix.
    #[must_use]
    pub fn with_prefix(storage: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the blob path holding `(table, key)`.
    #[must_use]
    pub fn record_path(&self, table: &str, key: &str) -> String {
        format!("{}/{table}/{key}.json", self.prefix)
    }

    async fn read_versioned(&self, path: &str) -> Result<Option<(String, StoredRecord)>> {
        // Version first, then contents: a newer body than the version we hold
        // only makes the later CAS fail, never succeed wrongly.
        let Some(meta) = self.storage.head(path).await? else {
            return Ok(None);
        };
        let Some(data) = self.storage.get_opt(path).await? else {
            return Ok(None);
        };
        let stored: StoredRecord = serde_json::from_slice(&data)
            .map_err(|e| Error::serialization(format!("parse record {path}: {e}")))?;
        Ok(Some((meta.version, stored)))
    }

    async fn mutate(
        &self,
        table: &str,
        key: &str,
        mutation: Mutation,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        let path = self.record_path(table, key);

        loop {
            let (current, precondition) = match self.read_versioned(&path).await? {
                Some((version, stored)) => {
                    (stored.live(), WritePrecondition::MatchesVersion(version))
                }
                None => (None, WritePrecondition::DoesNotExist),
            };

            if !condition.is_satisfied_by(current.as_ref()) {
                return Ok(WriteOutcome::ConditionFailed);
            }

            let next = match mutation.clone() {
                Mutation::Replace(record) => StoredRecord {
                    deleted: false,
                    fields: record,
                },
                Mutation::Merge(changes) => StoredRecord {
                    deleted: false,
                    fields: merged(current.as_ref(), changes),
                },
                Mutation::Delete if current.is_none() => return Ok(WriteOutcome::Applied),
                Mutation::Delete => StoredRecord {
                    deleted: true,
                    fields: Record::new(),
                },
            };

            let body = serde_json::to_vec(&next)
                .map_err(|e| Error::serialization(format!("serialize record {path}: {e}")))?;

            match self
                .storage
                .put(&path, Bytes::from(body), precondition)
                .await?
            {
                WriteResult::Success { .. } => return Ok(WriteOutcome::Applied),
                WriteResult::PreconditionFailed { current_version } => {
                    tracing::debug!(
                        path = %path,
                        current_version = %current_version,
                        "record changed underneath conditional write; re-evaluating"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> RecordStore for ObjectRecordStore<S> {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Record>> {
        let path = self.record_path(table, key);
        match self.storage.get_opt(&path).await? {
            Some(data) => {
                let stored: StoredRecord = serde_json::from_slice(&data)
                    .map_err(|e| Error::serialization(format!("parse record {path}: {e}")))?;
                Ok(stored.live())
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        self.mutate(table, key, Mutation::Replace(record), condition)
            .await
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        changes: Record,
        condition: Condition,
    ) -> Result<WriteOutcome> {
        self.mutate(table, key, Mutation::Merge(changes), condition)
            .await
    }

    async fn delete(&self, table: &str, key: &str, condition: Condition) -> Result<WriteOutcome> {
        self.mutate(table, key, Mutation::Delete, condition).await
    }
}
