//! Blob and lock key layout.
//!
//! A chunked store (an input dataset or a request's result) is a directory:
//!
//! ```text
//! {root}/.group.json
//! {root}/{dataset}/.array.json
//! {root}/{dataset}/{chunkIndex}.0
//! ```
//!
//! A request's result lives at `{prefix}/{requestId}`; the row-group format
//! adds `shards/{shardId}.json` and `_manifest.json` under the same root.

use sieve_core::RequestId;

const GROUP_DOCUMENT: &str = ".group.json";
const ARRAY_DOCUMENT: &str = ".array.json";
const MANIFEST_DOCUMENT: &str = "_manifest.json";
const SHARD_DIR: &str = "shards";

/// Paths inside one chunked store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayPaths {
    root: String,
}

impl ArrayPaths {
    /// Creates paths rooted at `root` (trailing slashes are ignored).
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    /// Creates the result paths for a request.
    #[must_use]
    pub fn for_result(prefix: &str, request_id: RequestId) -> Self {
        Self::new(format!("{}/{request_id}", prefix.trim_end_matches('/')))
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Group document path.
    #[must_use]
    pub fn group(&self) -> String {
        format!("{}/{GROUP_DOCUMENT}", self.root)
    }

    /// Array metadata path for `dataset`.
    #[must_use]
    pub fn array_metadata(&self, dataset: &str) -> String {
        format!("{}/{dataset}/{ARRAY_DOCUMENT}", self.root)
    }

    /// Chunk payload path. Only the row axis is chunked, so the column index is always 0.
    #[must_use]
    pub fn chunk(&self, dataset: &str, chunk_index: u64) -> String {
        format!("{}/{dataset}/{chunk_index}.0", self.root)
    }

    /// Shard document path (row-group format).
    #[must_use]
    pub fn shard(&self, shard_id: &str) -> String {
        format!("{}/{SHARD_DIR}/{shard_id}.json", self.root)
    }

    /// Prefix under which shards are listed.
    #[must_use]
    pub fn shard_prefix(&self) -> String {
        format!("{}/{SHARD_DIR}/", self.root)
    }

    /// Manifest path (row-group format).
    #[must_use]
    pub fn manifest(&self) -> String {
        format!("{}/{MANIFEST_DOCUMENT}", self.root)
    }
}

/// Lock key serializing writes to one output chunk.
#[must_use]
pub fn chunk_lock_key(request_id: RequestId, dataset: &str, chunk_index: u64) -> String {
    format!("{request_id}/{dataset}/{chunk_index}")
}

/// Lock key guarding a write-once dataset.
#[must_use]
pub fn fixed_dataset_lock_key(request_id: RequestId, dataset: &str) -> String {
    format!("{request_id}/{dataset}/fixed")
}
