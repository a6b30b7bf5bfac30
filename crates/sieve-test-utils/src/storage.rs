//! Blob storage with operation tracing and injected failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sieve_core::error::{Error, Result};
use sieve_core::storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation.
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Path or prefix the operation touched.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
        }
    }
}

/// In-memory blob storage that records operations.
///
/// Objects live in a [`MemoryBackend`]; this wrapper only traces calls,
/// injects failures by path prefix and adds optional latency.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage that sleeps before every operation.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded writes under `prefix`.
    #[must_use]
    pub fn puts_under(&self, prefix: &str) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                StorageOp::Put { path, .. } if path.starts_with(prefix) => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every operation whose path starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        Ok(())
    }

    async fn before(&self, path: &str, op: StorageOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_failure(path)?;
        self.record(op);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.before(path, StorageOp::Get { path: path.to_string() })
            .await?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.before(
            path,
            StorageOp::Put {
                path: path.to_string(),
                size: data.len(),
            },
        )
        .await?;
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.before(path, StorageOp::Delete { path: path.to_string() })
            .await?;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.before(prefix, StorageOp::List { prefix: prefix.to_string() })
            .await?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.before(path, StorageOp::Head { path: path.to_string() })
            .await?;
        self.inner.head(path).await
    }
}
