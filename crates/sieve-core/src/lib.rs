//! # sieve-core
//!
//! Coordination primitives for the sieve filter-and-merge pipeline.
//!
//! Stages of the pipeline run as independent, stateless invocations. The only
//! shared state between them lives in a strongly-consistent record store and
//! in blob storage. This crate provides those seams and the primitives built
//! on them:
//!
//! - **Record Store**: key-value records with conditional put/update/delete
//! - **Blob Storage**: object storage with versioned preconditions
//! - **Distributed Lock**: lease-based mutual exclusion over the record store
//! - **Atomic Counter**: compare-and-set increments that hand out disjoint ranges
//! - **Identifiers**: request ids and lock holder tokens
//! - **Observability**: logging initialization and stage spans
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sieve_core::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryRecordStore::new());
//! let counter = AtomicCounter::new(store.clone(), "state");
//! counter.initialize("req-1", &[("RowCount", 0)]).await.unwrap();
//!
//! let rows = counter.increment("req-1", "RowCount", 10).await.unwrap();
//! assert_eq!(rows.range(), 0..10);
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod counter;
pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod record;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::counter::{AtomicCounter, Increment};
    pub use crate::error::{Error, Result};
    pub use crate::id::{HolderToken, RequestId};
    pub use crate::lock::{AcquireAttempt, DistributedLock, LockGuard, LockOptions, LockRecord};
    pub use crate::record::{
        Condition, MemoryRecordStore, ObjectRecordStore, Record, RecordStore, WriteOutcome,
    };
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use counter::{AtomicCounter, Increment};
pub use error::{Error, Result};
pub use id::{HolderToken, RequestId};
pub use lock::{AcquireAttempt, DistributedLock, LockGuard, LockOptions, LockRecord};
pub use observability::{init_logging, LogFormat};
pub use record::{Condition, MemoryRecordStore, ObjectRecordStore, Record, RecordStore, WriteOutcome};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
