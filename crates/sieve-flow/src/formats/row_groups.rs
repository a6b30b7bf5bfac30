//! The `row_groups` format: tables stored as independent row groups.
//!
//! An input at `{location}` is a descriptor plus one document per row group:
//!
//! ```text
//! {location}/_table.json    {"columns": [...], "rowGroups": N}
//! {location}/rg-{i}.json    {"rows": [[...], ...]}
//! ```
//!
//! Each row group is filtered into its own shard of the result; the reducer
//! lists the shards in a manifest. Shards never share a writer, so this
//! format needs neither the row allocator nor chunk locks.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use sieve_core::{StorageBackend, WritePrecondition};

use crate::error::{Error, Result};
use crate::filter::RowFilter;
use crate::output::metadata::FORMAT_VERSION;
use crate::plugin::{FormatPlugin, StageContext, WorkChunkSpec, WorkSummary};

/// Registry name.
pub const FORMAT_NAME: &str = "row_groups";

const TABLE_DOCUMENT: &str = "_table.json";

/// Table descriptor of an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    /// Column names, in row order.
    pub columns: Vec<String>,
    /// Number of row groups.
    pub row_groups: u64,
}

/// Rows of one row group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowGroup {
    /// Row-major values.
    pub rows: Vec<Vec<f32>>,
}

/// One row group to filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowGroupSpec {
    /// Input root.
    pub location: String,
    /// Row group index.
    pub row_group: u64,
}

impl RowGroupSpec {
    /// Deterministic shard id; distinct for distinct `(location, row_group)`.
    ///
    /// The group index is padded to the width of `u64::MAX`, so ids of one
    /// location sort lexically in group order.
    #[must_use]
    pub fn shard_id(&self) -> String {
        let location: String = self.location.bytes().map(|b| format!("{b:02x}")).collect();
        format!("{location}-{:020}", self.row_group)
    }
}

/// Filtered rows of one row group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    /// Input the rows came from.
    pub source: String,
    /// Row group the rows came from.
    pub row_group: u64,
    /// Column names.
    pub columns: Vec<String>,
    /// Surviving rows.
    pub rows: Vec<Vec<f32>>,
}

/// Manifest entry for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardEntry {
    /// Shard id.
    pub id: String,
    /// Rows in the shard.
    pub rows: u64,
}

/// Result manifest written by the reducer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Layout version.
    pub format_version: u32,
    /// Column names shared by every shard.
    pub columns: Vec<String>,
    /// Sum of shard rows.
    pub total_rows: u64,
    /// Shards, sorted by id.
    pub shards: Vec<ShardEntry>,
}

/// Filters row-group tables into per-row-group shards.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowGroupFormat;

impl RowGroupFormat {
    /// Creates the plugin.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn table_path(location: &str) -> String {
    format!("{}/{TABLE_DOCUMENT}", location.trim_end_matches('/'))
}

fn row_group_path(location: &str, row_group: u64) -> String {
    format!("{}/rg-{row_group}.json", location.trim_end_matches('/'))
}

async fn read_json<T: DeserializeOwned>(storage: &dyn StorageBackend, path: &str) -> Result<T> {
    let data = storage.get(path).await?;
    serde_json::from_slice(&data).map_err(|e| Error::plugin(FORMAT_NAME, format!("{path}: {e}")))
}

async fn write_json<T: Serialize>(storage: &dyn StorageBackend, path: &str, value: &T) -> Result<()> {
    let data = Bytes::from(serde_json::to_vec_pretty(value)?);
    storage.put(path, data, WritePrecondition::None).await?;
    Ok(())
}

#[async_trait]
impl FormatPlugin for RowGroupFormat {
    fn name(&self) -> &str {
        FORMAT_NAME
    }

    async fn driver(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    async fn mapper(&self, ctx: &StageContext, location: &str) -> Result<Vec<WorkChunkSpec>> {
        let table: TableDescriptor = read_json(ctx.storage().as_ref(), &table_path(location)).await?;
        (0..table.row_groups)
            .map(|row_group| {
                WorkChunkSpec::from_typed(&RowGroupSpec {
                    location: location.to_string(),
                    row_group,
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
        let spec: RowGroupSpec = chunk.parse(FORMAT_NAME)?;
        let storage = ctx.storage().as_ref();

        let table: TableDescriptor = read_json(storage, &table_path(&spec.location)).await?;
        let filter = RowFilter::compile(filter_expression, &table.columns)?;
        let group: RowGroup =
            read_json(storage, &row_group_path(&spec.location, spec.row_group)).await?;

        let width = table.columns.len();
        if let Some(bad) = group.rows.iter().position(|row| row.len() != width) {
            return Err(Error::plugin(
                FORMAT_NAME,
                format!(
                    "{}: row {bad} of group {} does not have {width} values",
                    spec.location, spec.row_group
                ),
            ));
        }

        let rows_scanned = group.rows.len() as u64;
        let rows: Vec<Vec<f32>> = group
            .rows
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect();
        let rows_kept = rows.len() as u64;

        let shard = Shard {
            source: spec.location.clone(),
            row_group: spec.row_group,
            columns: table.columns,
            rows,
        };
        write_json(storage, &ctx.result_paths().shard(&spec.shard_id()), &shard).await?;

        Ok(WorkSummary {
            rows_scanned,
            rows_kept,
        })
    }

    async fn reducer(&self, ctx: &StageContext) -> Result<()> {
        let storage = ctx.storage().as_ref();
        let paths = ctx.result_paths();
        let prefix = paths.shard_prefix();

        let mut objects = storage.list(&prefix).await?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));

        let mut columns: Option<Vec<String>> = None;
        let mut shards = Vec::with_capacity(objects.len());
        let mut total_rows = 0u64;
        for object in objects {
            let shard: Shard = read_json(storage, &object.path).await?;
            let expected = columns.get_or_insert_with(|| shard.columns.clone());
            if *expected != shard.columns {
                return Err(Error::plugin(
                    FORMAT_NAME,
                    format!("{}: columns differ from other shards", object.path),
                ));
            }

            let id = object
                .path
                .strip_prefix(&prefix)
                .and_then(|name| name.strip_suffix(".json"))
                .unwrap_or(object.path.as_str())
                .to_string();
            let rows = shard.rows.len() as u64;
            total_rows += rows;
            shards.push(ShardEntry { id, rows });
        }

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            columns: columns.unwrap_or_default(),
            total_rows,
            shards,
        };
        write_json(storage, &paths.manifest(), &manifest).await?;
        tracing::info!(
            shards = manifest.shards.len(),
            total_rows,
            "manifest written"
        );
        Ok(())
    }
}

/// Writes an input table: its descriptor and one document per row group.
///
/// # Errors
///
/// Returns a storage or serialization error.
pub async fn write_input(
    storage: &dyn StorageBackend,
    location: &str,
    columns: &[&str],
    row_groups: &[Vec<Vec<f32>>],
) -> Result<()> {
    for (index, rows) in row_groups.iter().enumerate() {
        let group = RowGroup { rows: rows.clone() };
        write_json(storage, &row_group_path(location, index as u64), &group).await?;
    }
    let table = TableDescriptor {
        columns: columns.iter().map(|c| (*c).to_string()).collect(),
        row_groups: row_groups.len() as u64,
    };
    write_json(storage, &table_path(location), &table).await
}

/// Reads a request's manifest, if the reducer has run.
///
/// # Errors
///
/// Returns a storage error or a plugin error for a malformed manifest.
pub async fn read_manifest(ctx: &StageContext) -> Result<Option<Manifest>> {
    let path = ctx.result_paths().manifest();
    if !ctx.storage().exists(&path).await? {
        return Ok(None);
    }
    read_json(ctx.storage().as_ref(), &path).await.map(Some)
}
