//! Concurrent writer for a shared, chunked result.
//!
//! Many work invocations append filtered rows into one result without any
//! global coordination:
//!
//! 1. [`ChunkedOutputWriter::allocate_row_range`] claims a disjoint range of
//!    output rows from the request's row allocator (an atomic counter).
//! 2. [`ChunkedOutputWriter::write_rows`] maps the range onto fixed-size row
//!    chunks and merges its slice into each one with a locked
//!    read-modify-write. Only writers whose ranges share a chunk serialize,
//!    and only on that chunk's lock.
//! 3. [`ChunkedOutputWriter::finalize`] reads the final row total and writes
//!    array and group metadata. It may run more than once; repeated runs
//!    produce identical bytes.
//!
//! ```text
//!  rows   0 ........ C ........ 2C ........ 3C
//!  chunk  |    0     |     1     |     2     |
//!  A      [=====)                             A and B share chunk 0
//!  B            [=======)                     B and C share chunk 1
//!  C                    [===============)
//! ```

pub mod array;
pub mod metadata;
pub mod reader;

use std::ops::Range;
use std::sync::Arc;

use sieve_core::lock::{DistributedLock, LockOptions};
use sieve_core::observability::coordination_span;
use sieve_core::storage::{StorageBackend, WritePrecondition};
use sieve_core::{AtomicCounter, RecordStore, RequestId};
use tracing::Instrument;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::paths::{chunk_lock_key, fixed_dataset_lock_key, ArrayPaths};

pub use array::{ArrayBlock, ArrayData, Compression, Dtype};
pub use metadata::{ArrayMetadata, GroupMetadata, Order};
pub use reader::{store_array, ChunkedArrayReader};

use reader::to_usize;

/// Field of the output-rows record holding the next free row.
pub const ROW_COUNT_FIELD: &str = "RowCount";

/// A half-open range of output rows owned by one writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    /// First row (inclusive).
    pub start: u64,
    /// Last row (exclusive).
    pub end: u64,
}

impl RowRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of rows.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns true for an empty range.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk indices `[floor(start / C), ceil(end / C))` touched by this range.
    #[must_use]
    pub const fn chunk_span(&self, rows_per_chunk: u64) -> Range<u64> {
        if self.is_empty() || rows_per_chunk == 0 {
            return 0..0;
        }
        self.start / rows_per_chunk..self.end.div_ceil(rows_per_chunk)
    }
}

impl From<Range<u64>> for RowRange {
    fn from(range: Range<u64>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// Shape of one row-chunked output dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Dataset name.
    pub name: String,
    /// Element type.
    pub dtype: Dtype,
    /// Columns per row.
    pub columns: u64,
}

impl DatasetSpec {
    /// Creates a dataset spec.
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: Dtype, columns: u64) -> Self {
        Self {
            name: name.into(),
            dtype,
            columns,
        }
    }
}

/// Result of a finalize pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSummary {
    /// Rows declared in every dataset's shape.
    pub total_rows: u64,
    /// Number of row-chunked datasets described.
    pub datasets: usize,
}

/// Writes one request's result into the chunked layout.
#[derive(Clone)]
pub struct ChunkedOutputWriter {
    request_id: RequestId,
    storage: Arc<dyn StorageBackend>,
    records: Arc<dyn RecordStore>,
    counter: AtomicCounter<dyn RecordStore>,
    paths: ArrayPaths,
    rows_per_chunk: u64,
    compression: Compression,
    lock_table: String,
    lock_options: LockOptions,
}

impl ChunkedOutputWriter {
    /// Creates a writer for `request_id`'s result.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        storage: Arc<dyn StorageBackend>,
        records: Arc<dyn RecordStore>,
        config: &PipelineConfig,
    ) -> Self {
        let counter = AtomicCounter::new(Arc::clone(&records), config.tables.output_rows.clone())
            .with_retry_interval(config.counter_retry);
        Self {
            request_id,
            storage,
            records,
            counter,
            paths: ArrayPaths::for_result(&config.result_prefix, request_id),
            rows_per_chunk: config.rows_per_chunk,
            compression: config.compression,
            lock_table: config.tables.locks.clone(),
            lock_options: config.lock,
        }
    }

    /// The request this writer belongs to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Paths of the result store.
    #[must_use]
    pub const fn paths(&self) -> &ArrayPaths {
        &self.paths
    }

    /// Rows per output chunk.
    #[must_use]
    pub const fn rows_per_chunk(&self) -> u64 {
        self.rows_per_chunk
    }

    /// Returns a reader over the result written so far.
    #[must_use]
    pub fn reader(&self) -> ChunkedArrayReader {
        ChunkedArrayReader::new(Arc::clone(&self.storage), self.paths.clone())
    }

    /// Creates the row allocator at zero. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn initialize_row_allocator(&self) -> Result<()> {
        let key = self.request_id.to_string();
        let outcome = self
            .counter
            .initialize(&key, &[(ROW_COUNT_FIELD, 0)])
            .await?;
        tracing::debug!(
            request_id = %self.request_id,
            created = outcome.is_applied(),
            "row allocator initialized"
        );
        Ok(())
    }

    /// Claims `row_count` output rows.
    ///
    /// Ranges returned to distinct calls for one request are pairwise
    /// disjoint, and their union is `[0, total_rows)`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the row allocator was never initialized.
    pub async fn allocate_row_range(&self, row_count: u64) -> Result<RowRange> {
        let increment = self
            .counter
            .increment(&self.request_id.to_string(), ROW_COUNT_FIELD, row_count)
            .await?;
        Ok(increment.range().into())
    }

    /// Reads the total number of rows allocated so far.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the row allocator was never initialized.
    pub async fn total_rows(&self) -> Result<u64> {
        Ok(self
            .counter
            .current(&self.request_id.to_string(), ROW_COUNT_FIELD)
            .await?)
    }

    /// Merges `values` into the chunks covering `range` of `dataset`.
    ///
    /// Each touched chunk is read (or zero-filled), patched with the
    /// overlapping rows, and written back while holding that chunk's lock.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `values` does not have `range.len()` rows or
    /// does not match an existing chunk, or a storage/lock error.
    #[tracing::instrument(
        skip(self, values),
        fields(request_id = %self.request_id, start = range.start, end = range.end)
    )]
    pub async fn write_rows(&self, dataset: &str, range: RowRange, values: &ArrayBlock) -> Result<()> {
        if values.rows() as u64 != range.len() {
            return Err(Error::shape(format!(
                "{} rows supplied for a {}-row range",
                values.rows(),
                range.len()
            )));
        }

        let per_chunk = self.rows_per_chunk;
        for chunk_index in range.chunk_span(per_chunk) {
            let chunk_start = chunk_index * per_chunk;
            let lo = range.start.max(chunk_start);
            let hi = range.end.min(chunk_start + per_chunk);

            let key = chunk_lock_key(self.request_id, dataset, chunk_index);
            self.merge_into_chunk(&key, dataset, chunk_index, values, lo - range.start, lo - chunk_start, hi - lo)
                .instrument(coordination_span("merge_chunk", &key))
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_into_chunk(
        &self,
        lock_key: &str,
        dataset: &str,
        chunk_index: u64,
        values: &ArrayBlock,
        src_row: u64,
        dst_row: u64,
        count: u64,
    ) -> Result<()> {
        let guard = self.lock(lock_key).acquire().await?;

        let path = self.paths.chunk(dataset, chunk_index);
        let rows = to_usize(self.rows_per_chunk)?;
        let mut chunk = match self.storage.get_opt(&path).await? {
            Some(data) => ArrayBlock::decode(
                &data,
                values.dtype(),
                rows,
                values.columns(),
                self.compression,
            )?,
            None => ArrayBlock::zeros(values.dtype(), rows, values.columns()),
        };
        chunk.copy_rows_from(to_usize(dst_row)?, values, to_usize(src_row)?, to_usize(count)?)?;
        self.storage
            .put(&path, chunk.encode(self.compression), WritePrecondition::None)
            .await?;

        guard.release().await?;
        tracing::trace!(dataset, chunk_index, rows = count, "chunk merged");
        Ok(())
    }

    /// Writes a small write-once dataset shared by the whole result.
    ///
    /// Concurrent callers must supply identical `values`. An existence check
    /// before and after taking the dataset's lock lets only the first caller
    /// write. Returns whether this caller wrote.
    ///
    /// # Errors
    ///
    /// Returns a storage or lock error.
    pub async fn write_fixed_dataset(&self, dataset: &str, values: &ArrayBlock) -> Result<bool> {
        let meta_path = self.paths.array_metadata(dataset);
        if self.storage.exists(&meta_path).await? {
            return Ok(false);
        }

        let guard = self
            .lock(&fixed_dataset_lock_key(self.request_id, dataset))
            .acquire()
            .await?;
        if self.storage.exists(&meta_path).await? {
            guard.release().await?;
            return Ok(false);
        }

        let rows_per_chunk = (values.rows() as u64).max(1);
        store_array(
            self.storage.as_ref(),
            &self.paths,
            dataset,
            values,
            rows_per_chunk,
            self.compression,
        )
        .await?;
        guard.release().await?;

        tracing::debug!(request_id = %self.request_id, dataset, "fixed dataset written");
        Ok(true)
    }

    /// Writes metadata for every row-chunked dataset and the group document.
    ///
    /// `fixed_datasets` are listed in the group document but their metadata,
    /// written by [`Self::write_fixed_dataset`], is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the row total cannot be read or storage fails.
    pub async fn finalize(
        &self,
        datasets: &[DatasetSpec],
        fixed_datasets: &[&str],
    ) -> Result<FinalizeSummary> {
        let total_rows = self.total_rows().await?;

        for spec in datasets {
            let meta = ArrayMetadata::new(
                total_rows,
                spec.columns,
                self.rows_per_chunk,
                spec.dtype,
                self.compression,
            );
            self.storage
                .put(
                    &self.paths.array_metadata(&spec.name),
                    meta.to_bytes()?,
                    WritePrecondition::None,
                )
                .await?;
        }

        let group = GroupMetadata::new(
            datasets
                .iter()
                .map(|d| d.name.as_str())
                .chain(fixed_datasets.iter().copied()),
        );
        self.storage
            .put(&self.paths.group(), group.to_bytes()?, WritePrecondition::None)
            .await?;

        tracing::info!(
            request_id = %self.request_id,
            total_rows,
            datasets = datasets.len(),
            "result finalized"
        );
        Ok(FinalizeSummary {
            total_rows,
            datasets: datasets.len(),
        })
    }

    /// Each call gets a fresh holder token, so two merges from clones of one
    /// writer still exclude each other.
    fn lock(&self, key: &str) -> DistributedLock<dyn RecordStore> {
        DistributedLock::new(Arc::clone(&self.records), key)
            .with_table(self.lock_table.clone())
            .with_options(self.lock_options)
    }
}
