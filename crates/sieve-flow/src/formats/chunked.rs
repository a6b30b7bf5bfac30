//! The `chunked` format: cell-by-gene matrices in the chunked array layout.
//!
//! An input is a chunked store holding:
//!
//! | Dataset | Dtype | Shape |
//! |---------|-------|-------|
//! | `data` | float32 | cells × genes |
//! | `qc_values` | float32 | cells × qc metrics |
//! | `cell_name` | utf8 | cells × 1 |
//! | `gene_name` | utf8 | genes × 1 |
//! | `qc_names` | utf8 | qc metrics × 1 |
//!
//! The filter expression is evaluated against each cell's `data` row followed
//! by its `qc_values` row, with columns named by `gene_name` then `qc_names`,
//! so one predicate can mix genes and metrics (`CD4 > 0 AND n_genes > 500`).
//! Surviving cells from every input are appended into one result store of
//! the same layout.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::RowFilter;
use crate::output::{ArrayBlock, ChunkedArrayReader, DatasetSpec, Dtype};
use crate::paths::ArrayPaths;
use crate::plugin::{FormatPlugin, StageContext, WorkChunkSpec, WorkSummary};

/// Registry name.
pub const FORMAT_NAME: &str = "chunked";

/// Expression matrix.
pub const DATA: &str = "data";
/// Per-cell quality metrics.
pub const QC_VALUES: &str = "qc_values";
/// Per-cell names.
pub const CELL_NAME: &str = "cell_name";
/// Gene names; identical across inputs.
pub const GENE_NAME: &str = "gene_name";
/// Quality metric names; identical across inputs.
pub const QC_NAMES: &str = "qc_names";

const FIXED_DATASETS: [&str; 2] = [GENE_NAME, QC_NAMES];

/// One input chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedSpec {
    /// Input store root.
    pub location: String,
    /// First input row.
    pub start_row: u64,
    /// Rows in this chunk.
    pub num_rows: u64,
}

/// Filters chunked cell-by-gene inputs into one chunked result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedFormat;

impl ChunkedFormat {
    /// Creates the plugin.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn input(ctx: &StageContext, location: &str) -> ChunkedArrayReader {
        ChunkedArrayReader::new(Arc::clone(ctx.storage()), ArrayPaths::new(location))
    }
}

#[async_trait]
impl FormatPlugin for ChunkedFormat {
    fn name(&self) -> &str {
        FORMAT_NAME
    }

    async fn driver(&self, ctx: &StageContext) -> Result<()> {
        ctx.output_writer().initialize_row_allocator().await
    }

    async fn mapper(&self, ctx: &StageContext, location: &str) -> Result<Vec<WorkChunkSpec>> {
        let meta = Self::input(ctx, location).metadata(DATA).await?;
        let rows = meta.rows();
        let per_chunk = meta.rows_per_chunk();
        if per_chunk == 0 {
            return Err(Error::plugin(
                FORMAT_NAME,
                format!("{location}: {DATA} has a zero chunk size"),
            ));
        }

        (0..rows.div_ceil(per_chunk))
            .map(|chunk| {
                let start_row = chunk * per_chunk;
                WorkChunkSpec::from_typed(&ChunkedSpec {
                    location: location.to_string(),
                    start_row,
                    num_rows: per_chunk.min(rows - start_row),
                })
            })
            .collect()
    }

    async fn work(
        &self,
        ctx: &StageContext,
        filter_expression: &str,
        chunk: &WorkChunkSpec,
    ) -> Result<WorkSummary> {
        let spec: ChunkedSpec = chunk.parse(FORMAT_NAME)?;
        let input = Self::input(ctx, &spec.location);
        let rows = spec.start_row..spec.start_row + spec.num_rows;

        let gene_names = input.read_all(GENE_NAME).await?;
        let qc_names = input.read_all(QC_NAMES).await?;
        let columns = filter_columns(&spec.location, &gene_names, &qc_names)?;
        let filter = RowFilter::compile(filter_expression, &columns)?;

        let data = input.read_rows(DATA, rows.clone()).await?;
        let qc = input.read_rows(QC_VALUES, rows.clone()).await?;
        if data.rows() != qc.rows() || data.columns() + qc.columns() != columns.len() {
            return Err(Error::shape(format!(
                "{}: {DATA} is {}x{} and {QC_VALUES} is {}x{} for {} named columns",
                spec.location,
                data.rows(),
                data.columns(),
                qc.rows(),
                qc.columns(),
                columns.len()
            )));
        }

        let mut row_values = Vec::with_capacity(columns.len());
        let mut keep = Vec::new();
        for row in 0..qc.rows() {
            let (Some(genes), Some(metrics)) = (data.f32_row(row), qc.f32_row(row)) else {
                return Err(Error::plugin(
                    FORMAT_NAME,
                    format!("{}: {DATA} and {QC_VALUES} must be float32", spec.location),
                ));
            };
            row_values.clear();
            row_values.extend_from_slice(genes);
            row_values.extend_from_slice(metrics);
            if filter.matches(&row_values) {
                keep.push(row);
            }
        }

        let writer = ctx.output_writer();
        writer.write_fixed_dataset(GENE_NAME, &gene_names).await?;
        writer.write_fixed_dataset(QC_NAMES, &qc_names).await?;

        let summary = WorkSummary {
            rows_scanned: qc.rows() as u64,
            rows_kept: keep.len() as u64,
        };
        if keep.is_empty() {
            return Ok(summary);
        }

        let data = data.select_rows(&keep);
        let cells = input.read_rows(CELL_NAME, rows).await?.select_rows(&keep);
        let qc = qc.select_rows(&keep);

        let range = writer.allocate_row_range(summary.rows_kept).await?;
        writer.write_rows(DATA, range, &data).await?;
        writer.write_rows(QC_VALUES, range, &qc).await?;
        writer.write_rows(CELL_NAME, range, &cells).await?;

        tracing::debug!(
            location = %spec.location,
            start = range.start,
            end = range.end,
            "cells appended"
        );
        Ok(summary)
    }

    async fn reducer(&self, ctx: &StageContext) -> Result<()> {
        let writer = ctx.output_writer();
        let result = writer.reader();

        // Fixed datasets are absent when no work invocation ran.
        let mut present = Vec::with_capacity(FIXED_DATASETS.len());
        let mut widths = [0u64; 2];
        for (width, dataset) in widths.iter_mut().zip(FIXED_DATASETS) {
            if let Some(meta) = result.metadata_opt(dataset).await? {
                *width = meta.rows();
                present.push(dataset);
            }
        }
        let [genes, qc_metrics] = widths;

        let datasets = [
            DatasetSpec::new(DATA, Dtype::Float32, genes),
            DatasetSpec::new(QC_VALUES, Dtype::Float32, qc_metrics),
            DatasetSpec::new(CELL_NAME, Dtype::Utf8, 1),
        ];
        writer.finalize(&datasets, &present).await?;
        Ok(())
    }
}

/// Filter columns: gene names followed by quality metric names, matching the
/// layout of a `data` row concatenated with its `qc_values` row.
fn filter_columns(location: &str, genes: &ArrayBlock, qc: &ArrayBlock) -> Result<Vec<String>> {
    let names = |block: &ArrayBlock, dataset: &str| {
        block.as_strings().map(<[String]>::to_vec).ok_or_else(|| {
            Error::plugin(FORMAT_NAME, format!("{location}: {dataset} is not utf8"))
        })
    };
    let mut columns = names(genes, GENE_NAME)?;
    columns.extend(names(qc, QC_NAMES)?);
    Ok(columns)
}

/// Builds an input store in this format from in-memory values.
///
/// `data` and `qc_values` are row-major with one row per entry of `cell_names`.
///
/// # Errors
///
/// Returns a shape error if the values do not match the names, or a storage error.
pub async fn write_input(
    storage: &dyn sieve_core::StorageBackend,
    location: &str,
    rows_per_chunk: u64,
    compression: crate::output::Compression,
    input: &ChunkedInput,
) -> Result<()> {
    let paths = ArrayPaths::new(location);
    let cells = input.cell_names.len();
    let blocks = [
        (
            DATA,
            ArrayBlock::from_f32(cells, input.gene_names.len(), input.data.clone())?,
        ),
        (
            QC_VALUES,
            ArrayBlock::from_f32(cells, input.qc_names.len(), input.qc_values.clone())?,
        ),
        (CELL_NAME, ArrayBlock::from_strings(input.cell_names.clone())),
        (GENE_NAME, ArrayBlock::from_strings(input.gene_names.clone())),
        (QC_NAMES, ArrayBlock::from_strings(input.qc_names.clone())),
    ];
    for (dataset, block) in &blocks {
        let per_chunk = if FIXED_DATASETS.contains(dataset) {
            (block.rows() as u64).max(1)
        } else {
            rows_per_chunk
        };
        crate::output::store_array(storage, &paths, dataset, block, per_chunk, compression)
            .await?;
    }
    Ok(())
}

/// In-memory contents of one input store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkedInput {
    /// One name per cell (row).
    pub cell_names: Vec<String>,
    /// One name per gene (data column).
    pub gene_names: Vec<String>,
    /// One name per quality metric (`qc_values` column).
    pub qc_names: Vec<String>,
    /// Cells × genes, row-major.
    pub data: Vec<f32>,
    /// Cells × metrics, row-major.
    pub qc_values: Vec<f32>,
}
