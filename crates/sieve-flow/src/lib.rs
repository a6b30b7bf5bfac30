//! # sieve-flow
//!
//! Distributed filter-and-merge pipeline built on the sieve-core primitives.
//!
//! A request ("keep the rows of these inputs that match this expression,
//! merged into one result") runs as many short, stateless stage invocations:
//!
//! - **Driver**: validates the request, creates its coordination state and
//!   dispatches one mapper per input
//! - **Mapper**: splits an input into work partitions
//! - **Work**: filters one partition and appends its survivors to the result
//! - **Reducer**: finalizes the result once every partition is accounted for
//!
//! Stages share nothing but the record store and blob storage. Completion is
//! detected from per-request counters, output rows are claimed through an
//! atomic row allocator, and concurrent appends into a shared chunk are
//! serialized by per-chunk distributed locks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use sieve_core::{MemoryBackend, MemoryRecordStore};
//! use sieve_flow::config::PipelineConfig;
//! use sieve_flow::formats::bundled_registry;
//! use sieve_flow::orchestrator::Pipeline;
//!
//! # async fn run() -> sieve_flow::error::Result<()> {
//! let (pipeline, _workers) = Pipeline::start_local(
//!     PipelineConfig::from_env()?,
//!     bundled_registry()?,
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(MemoryRecordStore::new()),
//! )?;
//!
//! let accepted = pipeline
//!     .submit(&json!({
//!         "format": "chunked",
//!         "inputs": [{"location": "inputs/a"}, {"location": "inputs/b"}],
//!         "filterExpression": "n_genes > 500 AND pct_mito < 0.2"
//!     }))
//!     .await?;
//! let status = pipeline.status(accepted.request_id).await?;
//! println!("{}", status.phase);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod formats;
pub mod metrics;
pub mod orchestrator;
pub mod output;
pub mod paths;
pub mod plugin;
pub mod request;
pub mod state;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::dispatch::{InMemoryStageQueue, LocalDispatcher, StageDispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::filter::{FilterExpr, RowFilter};
    pub use crate::orchestrator::{Pipeline, RequestStatus};
    pub use crate::output::{ArrayBlock, ChunkedArrayReader, ChunkedOutputWriter, RowRange};
    pub use crate::plugin::{FormatPlugin, FormatRegistry, StageContext, WorkChunkSpec, WorkSummary};
    pub use crate::request::{DriverRequest, InputLocation, Stage, StageTask, SubmitResponse};
    pub use crate::state::{CoordinationStateStore, Phase, RequestState};
}

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use orchestrator::Pipeline;
