//! Pre-built pipelines and input datasets for tests.

use std::sync::Arc;
use std::time::Duration;

use sieve_core::lock::LockOptions;
use sieve_core::RequestId;
use sieve_flow::config::PipelineConfig;
use sieve_flow::dispatch::InMemoryStageQueue;
use sieve_flow::formats::{bundled_registry, chunked, row_groups};
use sieve_flow::orchestrator::{Pipeline, RequestStatus};
use sieve_flow::output::Compression;
use sieve_flow::state::Phase;
use tokio::task::JoinHandle;

use crate::records::TracingRecordStore;
use crate::storage::TracingMemoryBackend;

/// Configuration tuned for fast tests: small chunks, short polls.
#[must_use]
pub fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_rows_per_chunk(4)
        .with_counter_retry(Duration::from_millis(1))
        .with_lock_options(LockOptions {
            lease: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(2),
        })
}

/// Shared stores plus the configuration a test pipeline runs with.
#[derive(Clone)]
pub struct TestContext {
    /// Blob storage.
    pub storage: Arc<TracingMemoryBackend>,
    /// Record store.
    pub records: Arc<TracingRecordStore>,
    /// Pipeline configuration.
    pub config: PipelineConfig,
}

impl TestContext {
    /// Creates a context with [`test_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a context with a specific configuration.
    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            storage: Arc::new(TracingMemoryBackend::new()),
            records: Arc::new(TracingRecordStore::new()),
            config,
        }
    }

    /// A pipeline whose dispatched tasks wait in an in-memory queue.
    #[must_use]
    pub fn queued_pipeline(&self) -> (Pipeline, Arc<InMemoryStageQueue>) {
        let queue = Arc::new(InMemoryStageQueue::new());
        let pipeline = Pipeline::new(
            self.config.clone(),
            bundled_registry().expect("bundled formats"),
            self.storage.clone(),
            self.records.clone(),
            queue.clone(),
        )
        .expect("valid test config");
        (pipeline, queue)
    }

    /// A pipeline running tasks concurrently on the tokio runtime.
    #[must_use]
    pub fn local_pipeline(&self) -> (Arc<Pipeline>, JoinHandle<()>) {
        Pipeline::start_local(
            self.config.clone(),
            bundled_registry().expect("bundled formats"),
            self.storage.clone(),
            self.records.clone(),
        )
        .expect("valid test config")
    }

    /// Writes a `chunked` input of `cells` cells at `location`.
    pub async fn seed_chunked(&self, location: &str, cells: usize, rows_per_chunk: u64) {
        chunked::write_input(
            self.storage.as_ref(),
            location,
            rows_per_chunk,
            Compression::Lz4,
            &CellFactory::input(location, cells),
        )
        .await
        .expect("seed chunked input");
    }

    /// Writes a `row_groups` input with `groups` groups of `rows` rows at `location`.
    pub async fn seed_row_groups(&self, location: &str, groups: usize, rows: usize) {
        let data: Vec<Vec<Vec<f32>>> = (0..groups)
            .map(|g| (0..rows).map(|r| RowFactory::row(g * rows + r)).collect())
            .collect();
        row_groups::write_input(self.storage.as_ref(), location, &RowFactory::COLUMNS, &data)
            .await
            .expect("seed row-group input");
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic cell-by-gene inputs.
///
/// Cell `i` has `n_genes = (i * 37) % 1000` and `pct_mito = (i % 10) / 20`.
pub struct CellFactory;

impl CellFactory {
    /// Quality metric names.
    pub const QC_NAMES: [&'static str; 2] = ["n_genes", "pct_mito"];
    /// Gene names.
    pub const GENE_NAMES: [&'static str; 3] = ["CD3E", "MS4A1", "NKG7"];

    /// `n_genes` of cell `i`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn n_genes(i: usize) -> f32 {
        ((i * 37) % 1000) as f32
    }

    /// `pct_mito` of cell `i`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pct_mito(i: usize) -> f32 {
        (i % 10) as f32 / 20.0
    }

    /// Name of cell `i` of the input at `location`.
    #[must_use]
    pub fn cell_name(location: &str, i: usize) -> String {
        format!("{location}#{i}")
    }

    /// Expression row of cell `i`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn expression(i: usize) -> Vec<f32> {
        (0..Self::GENE_NAMES.len())
            .map(|g| (i * 10 + g) as f32)
            .collect()
    }

    /// The full input.
    #[must_use]
    pub fn input(location: &str, cells: usize) -> chunked::ChunkedInput {
        chunked::ChunkedInput {
            cell_names: (0..cells).map(|i| Self::cell_name(location, i)).collect(),
            gene_names: Self::GENE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            qc_names: Self::QC_NAMES.iter().map(|s| (*s).to_string()).collect(),
            data: (0..cells).flat_map(Self::expression).collect(),
            qc_values: (0..cells)
                .flat_map(|i| [Self::n_genes(i), Self::pct_mito(i)])
                .collect(),
        }
    }
}

/// Deterministic row-group rows: row `i` is `[i, i % 7]` over `score`, `depth`.
pub struct RowFactory;

impl RowFactory {
    /// Column names.
    pub const COLUMNS: [&'static str; 2] = ["score", "depth"];

    /// Row `i`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn row(i: usize) -> Vec<f32> {
        vec![i as f32, (i % 7) as f32]
    }
}

/// Handles queued tasks in FIFO order until the queue is empty.
///
/// Returns the number of tasks handled.
pub async fn run_queue(pipeline: &Pipeline, queue: &InMemoryStageQueue) -> usize {
    let mut handled = 0;
    while let Some(task) = queue.take().expect("queue lock") {
        pipeline.handle(task).await.expect("stage succeeds");
        handled += 1;
    }
    handled
}

/// Polls a request's status until it reaches `phase`.
///
/// # Panics
///
/// Panics if `timeout` elapses first.
pub async fn wait_for_phase(
    pipeline: &Pipeline,
    request_id: RequestId,
    phase: Phase,
    timeout: Duration,
) -> RequestStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = pipeline.status(request_id).await.expect("request status");
        if status.phase == phase {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "request {request_id} stuck in {} waiting for {phase}",
            status.phase
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
