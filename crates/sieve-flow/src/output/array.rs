//! Dtype-tagged, row-major array buffers and their chunk encoding.
//!
//! A chunk on blob storage is the raw little-endian encoding of an
//! [`ArrayBlock`], optionally lz4-compressed with the uncompressed size
//! prepended. `utf8` blocks are encoded as a `u32` element count followed by
//! each string as `u32` byte length plus bytes.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 32-bit little-endian float.
    Float32,
    /// Variable-length UTF-8 string.
    Utf8,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::Utf8 => write!(f, "utf8"),
        }
    }
}

/// Chunk compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Stored as-is.
    None,
    /// LZ4 block compression with the uncompressed size prepended.
    #[default]
    Lz4,
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            other => Err(Error::configuration(format!(
                "unknown compression '{other}' (expected 'lz4' or 'none')"
            ))),
        }
    }
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    /// Float32 elements.
    Float32(Vec<f32>),
    /// String elements.
    Utf8(Vec<String>),
}

impl ArrayData {
    fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Utf8(v) => v.len(),
        }
    }

    const fn dtype(&self) -> Dtype {
        match self {
            Self::Float32(_) => Dtype::Float32,
            Self::Utf8(_) => Dtype::Utf8,
        }
    }
}

/// A two-dimensional row-major buffer of `rows × columns` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayBlock {
    rows: usize,
    columns: usize,
    data: ArrayData,
}

impl ArrayBlock {
    /// Creates a fill-valued block: zeros for `float32`, empty strings for `utf8`.
    #[must_use]
    pub fn zeros(dtype: Dtype, rows: usize, columns: usize) -> Self {
        let len = rows * columns;
        let data = match dtype {
            Dtype::Float32 => ArrayData::Float32(vec![0.0; len]),
            Dtype::Utf8 => ArrayData::Utf8(vec![String::new(); len]),
        };
        Self {
            rows,
            columns,
            data,
        }
    }

    /// Wraps typed data, checking that it holds exactly `rows × columns` elements.
    ///
    /// # Errors
    ///
    /// Returns a shape error on length mismatch.
    pub fn new(rows: usize, columns: usize, data: ArrayData) -> Result<Self> {
        if data.len() != rows * columns {
            return Err(Error::shape(format!(
                "{} elements do not fill a {rows}x{columns} block",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            columns,
            data,
        })
    }

    /// Builds a float32 block.
    ///
    /// # Errors
    ///
    /// Returns a shape error on length mismatch.
    pub fn from_f32(rows: usize, columns: usize, values: Vec<f32>) -> Result<Self> {
        Self::new(rows, columns, ArrayData::Float32(values))
    }

    /// Builds a single-column string block.
    #[must_use]
    pub fn from_strings(values: Vec<String>) -> Self {
        Self {
            rows: values.len(),
            columns: 1,
            data: ArrayData::Utf8(values),
        }
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn columns(&self) -> usize {
        self.columns
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    /// Borrows the typed data.
    #[must_use]
    pub const fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Returns the float32 elements, if this is a float32 block.
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            ArrayData::Float32(v) => Some(v),
            ArrayData::Utf8(_) => None,
        }
    }

    /// Returns the string elements, if this is a utf8 block.
    #[must_use]
    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            ArrayData::Utf8(v) => Some(v),
            ArrayData::Float32(_) => None,
        }
    }

    /// Returns one row of a float32 block.
    #[must_use]
    pub fn f32_row(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.columns)?;
        self.as_f32()?.get(start..start + self.columns)
    }

    /// Copies `count` rows starting at `src_row` of `src` into this block at `dst_row`.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the dtypes or column counts differ or either
    /// row window is out of bounds.
    pub fn copy_rows_from(
        &mut self,
        dst_row: usize,
        src: &Self,
        src_row: usize,
        count: usize,
    ) -> Result<()> {
        if src.columns != self.columns {
            return Err(Error::shape(format!(
                "cannot copy {}-column rows into a {}-column block",
                src.columns, self.columns
            )));
        }
        if dst_row + count > self.rows || src_row + count > src.rows {
            return Err(Error::shape(format!(
                "row window out of bounds: dst {dst_row}+{count} of {}, src {src_row}+{count} of {}",
                self.rows, src.rows
            )));
        }

        let cols = self.columns;
        let dst = dst_row * cols..(dst_row + count) * cols;
        let from = src_row * cols..(src_row + count) * cols;
        match (&mut self.data, &src.data) {
            (ArrayData::Float32(d), ArrayData::Float32(s)) => d[dst].copy_from_slice(&s[from]),
            (ArrayData::Utf8(d), ArrayData::Utf8(s)) => d[dst].clone_from_slice(&s[from]),
            (d, s) => {
                return Err(Error::shape(format!(
                    "cannot copy {} rows into a {} block",
                    s.dtype(),
                    d.dtype()
                )))
            }
        }
        Ok(())
    }

    /// Returns a new block holding the rows selected by `keep`, in order.
    #[must_use]
    pub fn select_rows(&self, keep: &[usize]) -> Self {
        let cols = self.columns;
        let data = match &self.data {
            ArrayData::Float32(v) => ArrayData::Float32(
                keep.iter()
                    .flat_map(|&r| v[r * cols..(r + 1) * cols].iter().copied())
                    .collect(),
            ),
            ArrayData::Utf8(v) => ArrayData::Utf8(
                keep.iter()
                    .flat_map(|&r| v[r * cols..(r + 1) * cols].iter().cloned())
                    .collect(),
            ),
        };
        Self {
            rows: keep.len(),
            columns: cols,
            data,
        }
    }

    /// Encodes the block for storage.
    #[must_use]
    pub fn encode(&self, compression: Compression) -> Bytes {
        let mut raw = BytesMut::new();
        match &self.data {
            ArrayData::Float32(values) => {
                raw.reserve(values.len() * 4);
                for v in values {
                    raw.put_f32_le(*v);
                }
            }
            ArrayData::Utf8(values) => {
                raw.put_u32_le(len_u32(values.len()));
                for s in values {
                    raw.put_u32_le(len_u32(s.len()));
                    raw.put_slice(s.as_bytes());
                }
            }
        }

        match compression {
            Compression::None => raw.freeze(),
            Compression::Lz4 => Bytes::from(lz4_flex::block::compress_prepend_size(&raw)),
        }
    }

    /// Decodes a stored chunk of the given dtype and shape.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload is corrupt, or a shape
    /// error if it does not hold `rows × columns` elements.
    pub fn decode(
        data: &[u8],
        dtype: Dtype,
        rows: usize,
        columns: usize,
        compression: Compression,
    ) -> Result<Self> {
        let decompressed;
        let raw: &[u8] = match compression {
            Compression::None => data,
            Compression::Lz4 => {
                decompressed = lz4_flex::block::decompress_size_prepended(data)
                    .map_err(|e| Error::serialization(format!("lz4 decompress: {e}")))?;
                &decompressed
            }
        };

        let values = match dtype {
            Dtype::Float32 => {
                if raw.len() % 4 != 0 {
                    return Err(Error::serialization(format!(
                        "float32 payload length {} is not a multiple of 4",
                        raw.len()
                    )));
                }
                ArrayData::Float32(
                    raw.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                )
            }
            Dtype::Utf8 => ArrayData::Utf8(decode_strings(raw)?),
        };
        Self::new(rows, columns, values)
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn decode_strings(raw: &[u8]) -> Result<Vec<String>> {
    let mut cursor = raw;
    let count = take_u32(&mut cursor)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_u32(&mut cursor)?;
        if cursor.len() < len {
            return Err(Error::serialization("truncated utf8 payload"));
        }
        let (head, rest) = cursor.split_at(len);
        let s = std::str::from_utf8(head)
            .map_err(|e| Error::serialization(format!("invalid utf8 element: {e}")))?;
        out.push(s.to_string());
        cursor = rest;
    }
    Ok(out)
}

fn take_u32(cursor: &mut &[u8]) -> Result<usize> {
    if cursor.len() < 4 {
        return Err(Error::serialization("truncated utf8 payload"));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    let value = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    usize::try_from(value).map_err(|_| Error::serialization("utf8 length out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_have_fill_values() {
        let block = ArrayBlock::zeros(Dtype::Float32, 2, 3);
        assert_eq!(block.as_f32().unwrap(), &[0.0; 6]);

        let names = ArrayBlock::zeros(Dtype::Utf8, 2, 1);
        assert_eq!(names.as_strings().unwrap(), &[String::new(), String::new()]);
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(matches!(
            ArrayBlock::from_f32(2, 2, vec![1.0; 3]),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn copy_rows_into_offset() {
        let mut chunk = ArrayBlock::zeros(Dtype::Float32, 4, 2);
        let src = ArrayBlock::from_f32(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        chunk.copy_rows_from(2, &src, 1, 2).unwrap();
        assert_eq!(
            chunk.as_f32().unwrap(),
            &[0.0, 0.0, 0.0, 0.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn copy_rows_rejects_mismatched_dtype() {
        let mut chunk = ArrayBlock::zeros(Dtype::Float32, 2, 1);
        let src = ArrayBlock::from_strings(vec!["a".into()]);
        assert!(chunk.copy_rows_from(0, &src, 0, 1).is_err());
    }

    #[test]
    fn copy_rows_rejects_out_of_bounds() {
        let mut chunk = ArrayBlock::zeros(Dtype::Float32, 2, 1);
        let src = ArrayBlock::from_f32(2, 1, vec![1.0, 2.0]).unwrap();
        assert!(chunk.copy_rows_from(1, &src, 0, 2).is_err());
    }

    #[test]
    fn select_rows_keeps_order() {
        let block = ArrayBlock::from_f32(3, 1, vec![10.0, 20.0, 30.0]).unwrap();
        let picked = block.select_rows(&[2, 0]);
        assert_eq!(picked.as_f32().unwrap(), &[30.0, 10.0]);
        assert_eq!(picked.rows(), 2);
    }

    #[test]
    fn lz4_payload_decodes_to_same_block() {
        let block = ArrayBlock::from_f32(2, 2, vec![1.5, -2.0, 0.0, 7.25]).unwrap();
        let encoded = block.encode(Compression::Lz4);
        let decoded = ArrayBlock::decode(&encoded, Dtype::Float32, 2, 2, Compression::Lz4).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn strings_with_multibyte_characters() {
        let block = ArrayBlock::from_strings(vec!["ACGT".into(), "naïve".into(), String::new()]);
        let encoded = block.encode(Compression::None);
        let decoded = ArrayBlock::decode(&encoded, Dtype::Utf8, 3, 1, Compression::None).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        assert!(ArrayBlock::decode(&[1, 2, 3], Dtype::Float32, 1, 1, Compression::None).is_err());
        assert!(ArrayBlock::decode(&[9, 0, 0, 0], Dtype::Utf8, 9, 1, Compression::None).is_err());
    }

    #[test]
    fn compression_parses() {
        assert_eq!("LZ4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("zstd".parse::<Compression>().is_err());
    }
}
