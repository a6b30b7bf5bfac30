//! Bundled format plugins.
//!
//! - [`chunked`]: chunked cell-by-gene stores merged into one chunked result
//! - [`row_groups`]: row-group tables filtered into per-group shards

pub mod chunked;
pub mod row_groups;

use std::sync::Arc;

use crate::error::Result;
use crate::plugin::FormatRegistry;

pub use chunked::ChunkedFormat;
pub use row_groups::RowGroupFormat;

/// A registry holding every bundled format.
///
/// # Errors
///
/// Returns a configuration error if two bundled formats share a name.
pub fn bundled_registry() -> Result<FormatRegistry> {
    FormatRegistry::new()
        .with(Arc::new(ChunkedFormat::new()))?
        .with(Arc::new(RowGroupFormat::new()))
}
