//! Driver → mapper → work → reducer state machine.
//!
//! Each stage is a short, stateless invocation. Stages never wait on each
//! other: they raise counts in the request's [`RequestState`] and hand the
//! next stage's tasks to the [`StageDispatcher`].
//!
//! ```text
//!            submit
//!              │
//!           driver ── state(expected mappers = |inputs|), format driver hook
//!          ╱   │   ╲
//!    mapper  mapper  mapper ── expected work += |chunks|, completed mappers += 1
//!     ╱ ╲      │       ╲
//!   work work work    work ── completed work += 1
//!                 ╲    │
//!                   reducer ── once mappers and work both balance
//! ```
//!
//! Completion is detected by whichever invocation observes both
//! `completed mappers == expected mappers` and `completed work == expected
//! work` after its own increment. More than one may observe it, so the
//! reducer may run more than once; reducer hooks are idempotent.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use sieve_core::observability::stage_span;
use sieve_core::{RecordStore, RequestId, StorageBackend};

use crate::config::PipelineConfig;
use crate::dispatch::{spawn_local_workers, LocalDispatcher, StageDispatcher};
use crate::error::Result;
use crate::metrics::{time_stage, FlowMetrics};
use crate::plugin::{FormatRegistry, StageContext};
use crate::request::{
    DriverRequest, MapperTask, ReducerTask, Stage, StageTask, SubmitResponse, WorkTask,
};
use crate::state::{CoordinationStateStore, Phase, RequestState, TimingEvent, TimingRecord};

/// Snapshot of a request's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    /// The request.
    pub request_id: RequestId,
    /// Phase inferred from the counts.
    pub phase: Phase,
    /// Raw stage counts.
    pub state: RequestState,
    /// Stage timing events, if any were stamped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingRecord>,
}

/// The pipeline: a format registry, coordination state and a dispatcher.
pub struct Pipeline {
    registry: FormatRegistry,
    state: CoordinationStateStore,
    dispatcher: Arc<dyn StageDispatcher>,
    storage: Arc<dyn StorageBackend>,
    records: Arc<dyn RecordStore>,
    config: Arc<PipelineConfig>,
    metrics: FlowMetrics,
}

impl Pipeline {
    /// Creates a pipeline.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        config: PipelineConfig,
        registry: FormatRegistry,
        storage: Arc<dyn StorageBackend>,
        records: Arc<dyn RecordStore>,
        dispatcher: Arc<dyn StageDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let state = CoordinationStateStore::new(Arc::clone(&records), &config);
        Ok(Self {
            registry,
            state,
            dispatcher,
            storage,
            records,
            config: Arc::new(config),
            metrics: FlowMetrics::new(),
        })
    }

    /// Creates a pipeline whose tasks run as detached tasks on the current
    /// tokio runtime, and starts its worker loop.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn start_local(
        config: PipelineConfig,
        registry: FormatRegistry,
        storage: Arc<dyn StorageBackend>,
        records: Arc<dyn RecordStore>,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let (dispatcher, receiver) = LocalDispatcher::channel();
        let pipeline = Arc::new(Self::new(
            config,
            registry,
            storage,
            records,
            Arc::new(dispatcher),
        )?);
        let workers = spawn_local_workers(Arc::clone(&pipeline), receiver);
        Ok((pipeline, workers))
    }

    /// Pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Registered formats.
    #[must_use]
    pub const fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// Coordination state store.
    #[must_use]
    pub const fn state_store(&self) -> &CoordinationStateStore {
        &self.state
    }

    /// Hook context for a request.
    #[must_use]
    pub fn context(&self, request_id: RequestId) -> StageContext {
        StageContext::new(
            request_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.records),
            Arc::clone(&self.config),
        )
    }

    /// Accepts a raw driver payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error listing every missing key, or any error
    /// from [`Self::driver`].
    #[tracing::instrument(skip_all)]
    pub async fn submit(&self, payload: &Value) -> Result<SubmitResponse> {
        let request = DriverRequest::from_json(payload)?;
        let request_id = self.driver(request).await?;
        Ok(SubmitResponse { request_id })
    }

    /// Validates a request, creates its state and fans out one mapper per input.
    ///
    /// Nothing is written for a request that fails validation or names an
    /// unknown format.
    ///
    /// # Errors
    ///
    /// Returns `Validation` or `UnknownFormat` synchronously, or a store,
    /// hook or dispatch error.
    pub async fn driver(&self, request: DriverRequest) -> Result<RequestId> {
        request.validate()?;
        let plugin = self.registry.get(&request.format)?;
        let request_id = RequestId::generate();
        let format = request.format.clone();

        self.run_stage(Stage::Driver, request_id, &format, async move {
            self.stamp(request_id, TimingEvent::DriverStarted).await;

            let inputs = request.inputs.len() as u64;
            self.state
                .create(request_id, &RequestState::new(&request.format, inputs))
                .await?;

            plugin.driver(&self.context(request_id)).await?;

            for input in request.inputs {
                self.dispatch(StageTask::Mapper(MapperTask {
                    request_id,
                    format: request.format.clone(),
                    location: input.location,
                    filter_expression: request.filter_expression.clone(),
                }))
                .await?;
            }

            self.stamp(request_id, TimingEvent::DriverComplete).await;
            tracing::info!(mappers = inputs, "request accepted");
            Ok(request_id)
        })
        .await
    }

    /// Splits one input and dispatches its work.
    ///
    /// # Errors
    ///
    /// Returns a hook, store or dispatch error. The mapper's completion is
    /// then never counted and the request stalls.
    pub async fn mapper(&self, task: MapperTask) -> Result<()> {
        let request_id = task.request_id;
        let format = task.format.clone();
        self.run_stage(Stage::Mapper, request_id, &format, async move {
            let plugin = self.registry.get(&task.format)?;
            let chunks = plugin
                .mapper(&self.context(request_id), &task.location)
                .await?;

            let count = chunks.len() as u64;
            if count > 0 {
                self.state.add_expected_work(request_id, count).await?;
            }
            for chunk_spec in chunks {
                self.dispatch(StageTask::Work(WorkTask {
                    request_id,
                    format: task.format.clone(),
                    filter_expression: task.filter_expression.clone(),
                    chunk_spec,
                }))
                .await?;
            }

            let completed = self.state.complete(request_id, Stage::Mapper).await?;
            tracing::debug!(
                location = %task.location,
                chunks = count,
                completed_mappers = completed.after,
                "input mapped"
            );

            // Work dispatched above may already have finished, in which case
            // no work invocation saw the mappers balance.
            self.maybe_dispatch_reducer(request_id, &task.format, Stage::Mapper)
                .await?;
            Ok(())
        })
        .await
    }

    /// Filters one partition and triggers the reducer if it was the last.
    ///
    /// # Errors
    ///
    /// Returns a hook, store or dispatch error. A failed work invocation is
    /// never counted, so the reducer is never dispatched for the request.
    pub async fn work(&self, task: WorkTask) -> Result<()> {
        let request_id = task.request_id;
        let format = task.format.clone();
        self.run_stage(Stage::Work, request_id, &format, async move {
            let plugin = self.registry.get(&task.format)?;
            let summary = plugin
                .work(
                    &self.context(request_id),
                    &task.filter_expression,
                    &task.chunk_spec,
                )
                .await?;
            self.metrics
                .record_rows(&task.format, summary.rows_scanned, summary.rows_kept);

            let completed = self.state.complete(request_id, Stage::Work).await?;
            self.stamp(request_id, TimingEvent::WorkComplete).await;
            tracing::debug!(
                rows_scanned = summary.rows_scanned,
                rows_kept = summary.rows_kept,
                completed_work = completed.after,
                "chunk processed"
            );

            self.maybe_dispatch_reducer(request_id, &task.format, Stage::Work)
                .await?;
            Ok(())
        })
        .await
    }

    /// Finalizes the result.
    ///
    /// # Errors
    ///
    /// Returns a hook or store error.
    pub async fn reducer(&self, task: ReducerTask) -> Result<()> {
        let request_id = task.request_id;
        let format = task.format.clone();
        self.run_stage(Stage::Reducer, request_id, &format, async move {
            let plugin = self.registry.get(&task.format)?;
            plugin.reducer(&self.context(request_id)).await?;

            let completed = self.state.complete(request_id, Stage::Reducer).await?;
            self.stamp(request_id, TimingEvent::ReduceComplete).await;
            if completed.after > 1 {
                tracing::info!(runs = completed.after, "duplicate reducer run");
            } else {
                tracing::info!("request complete");
            }
            Ok(())
        })
        .await
    }

    /// Routes a dispatched task to its stage.
    ///
    /// # Errors
    ///
    /// Returns whatever the stage returns.
    pub async fn handle(&self, task: StageTask) -> Result<()> {
        match task {
            StageTask::Mapper(task) => self.mapper(task).await,
            StageTask::Work(task) => self.work(task).await,
            StageTask::Reducer(task) => self.reducer(task).await,
        }
    }

    /// Reads a request's progress.
    ///
    /// # Errors
    ///
    /// Returns `RequestNotFound` for an unknown request.
    pub async fn status(&self, request_id: RequestId) -> Result<RequestStatus> {
        let state = self.state.get(request_id).await?;
        let timing = self.state.timing(request_id).await?;
        Ok(RequestStatus {
            request_id,
            phase: state.phase(),
            state,
            timing,
        })
    }

    async fn maybe_dispatch_reducer(
        &self,
        request_id: RequestId,
        format: &str,
        trigger: Stage,
    ) -> Result<bool> {
        let state = self.state.get(request_id).await?;
        if !state.ready_for_reduce() {
            return Ok(false);
        }
        self.dispatch(StageTask::Reducer(ReducerTask {
            request_id,
            format: format.to_string(),
        }))
        .await?;
        self.metrics.record_reducer_trigger(trigger.as_str());
        tracing::debug!(%trigger, "reducer dispatched");
        Ok(true)
    }

    async fn dispatch(&self, task: StageTask) -> Result<()> {
        let stage = task.stage();
        match self.dispatcher.dispatch(task).await {
            Ok(()) => {
                self.metrics.record_dispatch(stage.as_str(), "success");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_dispatch(stage.as_str(), "failure");
                tracing::warn!(
                    %stage,
                    dispatcher = self.dispatcher.name(),
                    error = %e,
                    "dispatch failed"
                );
                Err(e)
            }
        }
    }

    /// Timing records are diagnostics; a failed stamp is logged, not raised.
    async fn stamp(&self, request_id: RequestId, event: TimingEvent) {
        if let Err(e) = self.state.record_timing(request_id, event).await {
            tracing::warn!(event = event.field(), error = %e, "timing stamp failed");
        }
    }

    async fn run_stage<T, F>(
        &self,
        stage: Stage,
        request_id: RequestId,
        format: &str,
        body: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = stage_span(stage.as_str(), &request_id.to_string(), format);
        let _timer = time_stage(stage.as_str(), format.to_string());
        let result = body.instrument(span.clone()).await;

        match &result {
            Ok(_) => self.metrics.record_stage(stage.as_str(), format, "success"),
            Err(e) => {
                self.metrics.record_stage(stage.as_str(), format, "failure");
                span.in_scope(|| tracing::error!(error = %e, "stage failed"));
            }
        }
        result
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InMemoryStageQueue;
    use crate::error::Error;
    use crate::plugin::{FormatPlugin, WorkChunkSpec, WorkSummary};
    use async_trait::async_trait;
    use serde_json::json;
    use sieve_core::{MemoryBackend, MemoryRecordStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Splits `"n:<k>"` locations into `k` chunks and counts reducer runs.
    #[derive(Default)]
    struct Counting {
        reduced: AtomicUsize,
    }

    #[async_trait]
    impl FormatPlugin for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn driver(&self, _ctx: &StageContext) -> Result<()> {
            Ok(())
        }

        async fn mapper(&self, _ctx: &StageContext, location: &str) -> Result<Vec<WorkChunkSpec>> {
            let n: u64 = location
                .strip_prefix("n:")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| Error::plugin("counting", "bad location"))?;
            Ok((0..n).map(|i| WorkChunkSpec::new(json!({ "i": i }))).collect())
        }

        async fn work(
            &self,
            _ctx: &StageContext,
            _filter_expression: &str,
            _chunk: &WorkChunkSpec,
        ) -> Result<WorkSummary> {
            Ok(WorkSummary {
                rows_scanned: 1,
                rows_kept: 1,
            })
        }

        async fn reducer(&self, _ctx: &StageContext) -> Result<()> {
            self.reduced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline() -> (Pipeline, Arc<InMemoryStageQueue>, Arc<Counting>) {
        let queue = Arc::new(InMemoryStageQueue::new());
        let plugin = Arc::new(Counting::default());
        let registry = FormatRegistry::new().with(plugin.clone()).unwrap();
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            registry,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryRecordStore::new()),
            queue.clone(),
        )
        .unwrap();
        (pipeline, queue, plugin)
    }

    async fn run_queue(pipeline: &Pipeline, queue: &InMemoryStageQueue) {
        while let Some(task) = queue.take().unwrap() {
            pipeline.handle(task).await.unwrap();
        }
    }

    #[tokio::test]
    async fn driver_fans_out_one_mapper_per_input() {
        let (pipeline, queue, _) = pipeline();
        let response = pipeline
            .submit(&json!({
                "format": "counting",
                "inputs": [{"location": "n:2"}, {"location": "n:3"}],
                "filterExpression": "TRUE"
            }))
            .await
            .unwrap();

        assert_eq!(queue.count(Stage::Mapper).unwrap(), 2);
        let status = pipeline.status(response.request_id).await.unwrap();
        assert_eq!(status.phase, Phase::Submitted);
        assert_eq!(status.state.expected_mapper_executions, 2);
        assert!(status.timing.is_some_and(|t| t.driver_complete.is_some()));
    }

    #[tokio::test]
    async fn full_run_reduces_once_in_sequential_order() {
        let (pipeline, queue, plugin) = pipeline();
        let request = DriverRequest::new(
            "counting",
            [
                crate::request::InputLocation::new("n:2"),
                crate::request::InputLocation::new("n:3"),
            ],
            "TRUE",
        );
        let request_id = pipeline.driver(request).await.unwrap();
        run_queue(&pipeline, &queue).await;

        let status = pipeline.status(request_id).await.unwrap();
        assert_eq!(status.phase, Phase::Complete);
        assert_eq!(status.state.expected_work_executions, 5);
        assert_eq!(status.state.completed_work_executions, 5);
        assert_eq!(plugin.reduced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_chunk_mapper_finishing_last_triggers_reducer() {
        let (pipeline, queue, plugin) = pipeline();
        let request_id = pipeline
            .driver(DriverRequest::new(
                "counting",
                [
                    crate::request::InputLocation::new("n:1"),
                    crate::request::InputLocation::new("n:0"),
                ],
                "TRUE",
            ))
            .await
            .unwrap();

        // Run the first mapper, then its work, then the empty mapper last.
        let first = queue.take().unwrap().unwrap();
        let empty = queue.take().unwrap().unwrap();
        pipeline.handle(first).await.unwrap();
        let work = queue.take().unwrap().unwrap();
        pipeline.handle(work).await.unwrap();
        assert_eq!(queue.count(Stage::Reducer).unwrap(), 0);

        pipeline.handle(empty).await.unwrap();
        assert_eq!(queue.count(Stage::Reducer).unwrap(), 1);
        run_queue(&pipeline, &queue).await;

        assert_eq!(plugin.reduced.load(Ordering::SeqCst), 1);
        assert_eq!(
            pipeline.status(request_id).await.unwrap().phase,
            Phase::Complete
        );
    }

    #[tokio::test]
    async fn work_finishing_before_its_mapper_still_reduces() {
        let (pipeline, queue, plugin) = pipeline();
        let request_id = pipeline
            .driver(DriverRequest::new(
                "counting",
                [crate::request::InputLocation::new("n:1")],
                "TRUE",
            ))
            .await
            .unwrap();
        let mapper = queue.take().unwrap().unwrap();
        let StageTask::Mapper(mapper) = mapper else {
            panic!("expected mapper task");
        };

        // Emulate the work finishing between dispatch and the mapper's increment.
        let ctx = pipeline.context(request_id);
        let chunks = plugin.mapper(&ctx, &mapper.location).await.unwrap();
        pipeline
            .state_store()
            .add_expected_work(request_id, chunks.len() as u64)
            .await
            .unwrap();
        pipeline
            .work(WorkTask {
                request_id,
                format: "counting".into(),
                filter_expression: "TRUE".into(),
                chunk_spec: chunks[0].clone(),
            })
            .await
            .unwrap();
        assert_eq!(queue.count(Stage::Reducer).unwrap(), 0);

        pipeline
            .state_store()
            .complete(request_id, Stage::Mapper)
            .await
            .unwrap();
        assert!(pipeline
            .maybe_dispatch_reducer(request_id, "counting", Stage::Mapper)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unknown_format_creates_no_state() {
        let (pipeline, queue, _) = pipeline();
        let err = pipeline
            .submit(&json!({
                "format": "hdf5",
                "inputs": [{"location": "n:1"}],
                "filterExpression": "TRUE"
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFormat { .. }));
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn missing_keys_are_listed_together() {
        let (pipeline, _, _) = pipeline();
        let err = pipeline.submit(&json!({})).await.unwrap_err();
        let Error::Validation { missing_keys, .. } = err else {
            panic!("expected validation error");
        };
        assert_eq!(missing_keys, vec!["format", "inputs", "filterExpression"]);
    }

    #[tokio::test]
    async fn duplicate_reducer_is_tolerated() {
        let (pipeline, queue, plugin) = pipeline();
        let request_id = pipeline
            .driver(DriverRequest::new(
                "counting",
                [crate::request::InputLocation::new("n:1")],
                "TRUE",
            ))
            .await
            .unwrap();
        run_queue(&pipeline, &queue).await;

        pipeline
            .reducer(ReducerTask {
                request_id,
                format: "counting".into(),
            })
            .await
            .unwrap();
        assert_eq!(plugin.reduced.load(Ordering::SeqCst), 2);
        let status = pipeline.status(request_id).await.unwrap();
        assert_eq!(status.state.completed_reducer_executions, 2);
        assert_eq!(status.phase, Phase::Complete);
    }

    #[tokio::test]
    async fn local_dispatch_runs_to_completion() {
        let plugin = Arc::new(Counting::default());
        let registry = FormatRegistry::new().with(plugin.clone()).unwrap();
        let (pipeline, workers) = Pipeline::start_local(
            PipelineConfig::default(),
            registry,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryRecordStore::new()),
        )
        .unwrap();

        let request_id = pipeline
            .driver(DriverRequest::new(
                "counting",
                [
                    crate::request::InputLocation::new("n:4"),
                    crate::request::InputLocation::new("n:0"),
                    crate::request::InputLocation::new("n:3"),
                ],
                "TRUE",
            ))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let status = pipeline.status(request_id).await.unwrap();
            if status.phase == Phase::Complete {
                assert_eq!(status.state.completed_work_executions, 7);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "pipeline stalled");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(plugin.reduced.load(Ordering::SeqCst) >= 1);
        workers.abort();
    }
}
