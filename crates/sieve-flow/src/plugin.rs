//! Format plugin contract and registry.
//!
//! Everything format-specific (how inputs are split, how a chunk is filtered
//! and where its survivors go, how a result is finalized) sits behind
//! [`FormatPlugin`]. The orchestrator only knows plugin names, counts and
//! opaque [`WorkChunkSpec`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sieve_core::{RecordStore, RequestId, StorageBackend};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::output::ChunkedOutputWriter;
use crate::paths::ArrayPaths;

/// Format-defined description of one work partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkChunkSpec(Value);

impl WorkChunkSpec {
    /// Wraps a raw JSON descriptor.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Serializes a typed descriptor.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `spec` does not serialize.
    pub fn from_typed<T: Serialize>(spec: &T) -> Result<Self> {
        Ok(Self(serde_json::to_value(spec)?))
    }

    /// Parses the descriptor back into a plugin's own type.
    ///
    /// # Errors
    ///
    /// Returns `Error::Plugin` naming `format` if the descriptor does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self, format: &str) -> Result<T> {
        serde_json::from_value(self.0.clone())
            .map_err(|e| Error::plugin(format, format!("malformed chunk spec: {e}")))
    }

    /// The raw descriptor.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }
}

/// What one work invocation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    /// Rows read from the partition.
    pub rows_scanned: u64,
    /// Rows that passed the filter and were written.
    pub rows_kept: u64,
}

/// Shared handles a plugin hook runs with.
#[derive(Clone)]
pub struct StageContext {
    request_id: RequestId,
    storage: Arc<dyn StorageBackend>,
    records: Arc<dyn RecordStore>,
    config: Arc<PipelineConfig>,
}

impl StageContext {
    /// Creates a context for one request.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        storage: Arc<dyn StorageBackend>,
        records: Arc<dyn RecordStore>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            request_id,
            storage,
            records,
            config,
        }
    }

    /// The request being processed.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Blob storage holding inputs and results.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Coordination record store.
    #[must_use]
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Paths of this request's result.
    #[must_use]
    pub fn result_paths(&self) -> ArrayPaths {
        ArrayPaths::for_result(&self.config.result_prefix, self.request_id)
    }

    /// A chunked writer for this request's result.
    #[must_use]
    pub fn output_writer(&self) -> ChunkedOutputWriter {
        ChunkedOutputWriter::new(
            self.request_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.records),
            &self.config,
        )
    }
}

/// The four hooks a data format supplies.
#[async_trait]
pub trait FormatPlugin: Send + Sync + 'static {
    /// Registry key.
    fn name(&self) -> &str;

    /// Prepares shared per-request state. Runs before any mapper is dispatched.
    async fn driver(&self, ctx: &StageContext) -> Result<()>;

    /// Splits one input into work partitions.
    async fn mapper(&self, ctx: &StageContext, location: &str) -> Result<Vec<WorkChunkSpec>>;

    /// Filters one partition and writes its survivors.
    async fn work(
        &self,
        ctx: &StageContext,
        filter_expression: &str,
        chunk: &WorkChunkSpec,
    ) -> Result<WorkSummary>;

    /// Finalizes the result. Must be idempotent.
    async fn reducer(&self, ctx: &StageContext) -> Result<()>;
}

/// Format plugins keyed by name, populated at start-up.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    plugins: BTreeMap<String, Arc<dyn FormatPlugin>>,
}

impl FormatRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name is already taken.
    pub fn register(&mut self, plugin: Arc<dyn FormatPlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(Error::configuration(format!(
                "format '{name}' is already registered"
            )));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Builder form of [`Self::register`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name is already taken.
    pub fn with(mut self, plugin: Arc<dyn FormatPlugin>) -> Result<Self> {
        self.register(plugin)?;
        Ok(self)
    }

    /// Looks up a plugin.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFormat` if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn FormatPlugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFormat {
                format: name.to_string(),
            })
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.names())
            .finish()
    }
}
