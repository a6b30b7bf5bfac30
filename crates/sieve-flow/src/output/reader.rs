//! Reading and single-writer uploads of chunked arrays.

use std::ops::Range;
use std::sync::Arc;

use sieve_core::storage::{StorageBackend, WritePrecondition};

use super::array::{ArrayBlock, Compression};
use super::metadata::{ArrayMetadata, GroupMetadata};
use crate::error::{Error, Result};
use crate::paths::ArrayPaths;

/// Reads datasets stored in the chunked layout.
///
/// Chunks that were never written read as fill values.
#[derive(Clone)]
pub struct ChunkedArrayReader {
    storage: Arc<dyn StorageBackend>,
    paths: ArrayPaths,
}

impl ChunkedArrayReader {
    /// Creates a reader over the store at `paths`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, paths: ArrayPaths) -> Self {
        Self { storage, paths }
    }

    /// Returns the store paths.
    #[must_use]
    pub const fn paths(&self) -> &ArrayPaths {
        &self.paths
    }

    /// Reads the group document, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the document is malformed.
    pub async fn group(&self) -> Result<Option<GroupMetadata>> {
        match self.storage.get_opt(&self.paths.group()).await? {
            Some(data) => Ok(Some(GroupMetadata::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Reads a dataset's metadata, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the document is malformed.
    pub async fn metadata_opt(&self, dataset: &str) -> Result<Option<ArrayMetadata>> {
        match self.storage.get_opt(&self.paths.array_metadata(dataset)).await? {
            Some(data) => Ok(Some(ArrayMetadata::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Reads a dataset's metadata.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the dataset has no metadata document.
    pub async fn metadata(&self, dataset: &str) -> Result<ArrayMetadata> {
        self.metadata_opt(dataset).await?.ok_or_else(|| {
            sieve_core::Error::resource_not_found("array metadata", self.paths.array_metadata(dataset))
                .into()
        })
    }

    /// Reads one full chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the payload does not decode.
    pub async fn read_chunk(
        &self,
        dataset: &str,
        meta: &ArrayMetadata,
        chunk_index: u64,
    ) -> Result<ArrayBlock> {
        let rows = to_usize(meta.rows_per_chunk())?;
        let columns = to_usize(meta.columns())?;
        match self.storage.get_opt(&self.paths.chunk(dataset, chunk_index)).await? {
            Some(data) => ArrayBlock::decode(&data, meta.dtype, rows, columns, meta.compression),
            None => Ok(ArrayBlock::zeros(meta.dtype, rows, columns)),
        }
    }

    /// Reads the rows `range` of a dataset, clamped to its shape.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata or any chunk cannot be read.
    pub async fn read_rows(&self, dataset: &str, range: Range<u64>) -> Result<ArrayBlock> {
        let meta = self.metadata(dataset).await?;
        let end = range.end.min(meta.rows());
        let start = range.start.min(end);
        let columns = to_usize(meta.columns())?;
        let mut out = ArrayBlock::zeros(meta.dtype, to_usize(end - start)?, columns);

        let per_chunk = meta.rows_per_chunk();
        if start == end || per_chunk == 0 {
            return Ok(out);
        }

        for chunk_index in start / per_chunk..end.div_ceil(per_chunk) {
            let chunk = self.read_chunk(dataset, &meta, chunk_index).await?;
            let chunk_start = chunk_index * per_chunk;
            let lo = start.max(chunk_start);
            let hi = end.min(chunk_start + per_chunk);
            out.copy_rows_from(
                to_usize(lo - start)?,
                &chunk,
                to_usize(lo - chunk_start)?,
                to_usize(hi - lo)?,
            )?;
        }
        Ok(out)
    }

    /// Reads a whole dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata or any chunk cannot be read.
    pub async fn read_all(&self, dataset: &str) -> Result<ArrayBlock> {
        self.read_rows(dataset, 0..u64::MAX).await
    }
}

/// Uploads a whole dataset from a single writer: chunks, then metadata.
///
/// The final chunk is padded with fill values to `rows_per_chunk` rows.
///
/// # Errors
///
/// Returns an error if `rows_per_chunk` is zero or storage fails.
pub async fn store_array(
    storage: &dyn StorageBackend,
    paths: &ArrayPaths,
    dataset: &str,
    block: &ArrayBlock,
    rows_per_chunk: u64,
    compression: Compression,
) -> Result<ArrayMetadata> {
    if rows_per_chunk == 0 {
        return Err(Error::configuration("rows_per_chunk must be greater than zero"));
    }
    let per_chunk = to_usize(rows_per_chunk)?;
    let rows = block.rows();

    let mut chunk_index = 0u64;
    let mut offset = 0usize;
    while offset < rows {
        let count = per_chunk.min(rows - offset);
        let mut chunk = ArrayBlock::zeros(block.dtype(), per_chunk, block.columns());
        chunk.copy_rows_from(0, block, offset, count)?;
        storage
            .put(
                &paths.chunk(dataset, chunk_index),
                chunk.encode(compression),
                WritePrecondition::None,
            )
            .await?;
        chunk_index += 1;
        offset += count;
    }

    let meta = ArrayMetadata::new(
        rows as u64,
        block.columns() as u64,
        rows_per_chunk,
        block.dtype(),
        compression,
    );
    storage
        .put(
            &paths.array_metadata(dataset),
            meta.to_bytes()?,
            WritePrecondition::None,
        )
        .await?;
    Ok(meta)
}

pub(crate) fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::shape(format!("{value} exceeds addressable size")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Dtype;
    use sieve_core::MemoryBackend;

    #[tokio::test]
    async fn store_then_read_rows_across_chunks() {
        let storage = Arc::new(MemoryBackend::new());
        let paths = ArrayPaths::new("inputs/a");
        let values: Vec<f32> = (0..14u8).map(f32::from).collect();
        let block = ArrayBlock::from_f32(7, 2, values).unwrap();

        let meta = store_array(storage.as_ref(), &paths, "data", &block, 3, Compression::Lz4)
            .await
            .unwrap();
        assert_eq!(meta.chunk_count(), 3);

        let reader = ChunkedArrayReader::new(storage, paths);
        let middle = reader.read_rows("data", 2..5).await.unwrap();
        assert_eq!(middle.as_f32().unwrap(), &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);

        let all = reader.read_all("data").await.unwrap();
        assert_eq!(all, block);
    }

    #[tokio::test]
    async fn missing_chunk_reads_as_fill() {
        let storage = Arc::new(MemoryBackend::new());
        let paths = ArrayPaths::new("r");
        let meta = ArrayMetadata::new(4, 1, 2, Dtype::Utf8, Compression::None);
        storage
            .put(
                &paths.array_metadata("cell_name"),
                meta.to_bytes().unwrap(),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let reader = ChunkedArrayReader::new(storage, paths);
        let names = reader.read_all("cell_name").await.unwrap();
        assert_eq!(names.as_strings().unwrap(), &["", "", "", ""]);
    }

    #[tokio::test]
    async fn missing_metadata_is_not_found() {
        let reader = ChunkedArrayReader::new(Arc::new(MemoryBackend::new()), ArrayPaths::new("x"));
        let err = reader.metadata("data").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Core(sieve_core::Error::ResourceNotFound { .. })
        ));
    }
}
