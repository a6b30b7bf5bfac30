//! Array and group metadata documents.
//!
//! Serialization is deterministic (fixed field order, sorted dataset list),
//! so re-writing the documents after the same writes produces identical bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::array::{Compression, Dtype};
use crate::error::Result;

/// Version of the chunked layout written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Memory layout of chunk buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    /// Row-major.
    #[default]
    C,
    /// Column-major.
    F,
}

/// Metadata describing one chunked dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayMetadata {
    /// Layout version.
    pub format_version: u32,
    /// `[rows, columns]` of the whole dataset.
    pub shape: [u64; 2],
    /// `[rows, columns]` of one chunk.
    pub chunks: [u64; 2],
    /// Element type.
    pub dtype: Dtype,
    /// Chunk codec.
    pub compression: Compression,
    /// Chunk memory order.
    pub order: Order,
    /// Value of elements never written.
    pub fill_value: Value,
}

impl ArrayMetadata {
    /// Creates metadata for a dataset with row-only chunking.
    #[must_use]
    pub fn new(
        rows: u64,
        columns: u64,
        rows_per_chunk: u64,
        dtype: Dtype,
        compression: Compression,
    ) -> Self {
        let fill_value = match dtype {
            Dtype::Float32 => Value::from(0.0),
            Dtype::Utf8 => Value::from(""),
        };
        Self {
            format_version: FORMAT_VERSION,
            shape: [rows, columns],
            chunks: [rows_per_chunk, columns],
            dtype,
            compression,
            order: Order::C,
            fill_value,
        }
    }

    /// Total rows.
    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.shape[0]
    }

    /// Columns per row.
    #[must_use]
    pub const fn columns(&self) -> u64 {
        self.shape[1]
    }

    /// Rows per chunk.
    #[must_use]
    pub const fn rows_per_chunk(&self) -> u64 {
        self.chunks[0]
    }

    /// Number of chunks along the row axis.
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        if self.chunks[0] == 0 {
            0
        } else {
            self.shape[0].div_ceil(self.chunks[0])
        }
    }

    /// Serializes to the stored document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    /// Parses a stored document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the document is malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Top-level document of a chunked result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    /// Layout version.
    pub format_version: u32,
    /// Datasets in the group, sorted.
    pub datasets: Vec<String>,
}

impl GroupMetadata {
    /// Creates a group document; the dataset list is sorted and deduplicated.
    #[must_use]
    pub fn new<I, S>(datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut datasets: Vec<String> = datasets.into_iter().map(Into::into).collect();
        datasets.sort();
        datasets.dedup();
        Self {
            format_version: FORMAT_VERSION,
            datasets,
        }
    }

    /// Serializes to the stored document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    /// Parses a stored document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the document is malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
