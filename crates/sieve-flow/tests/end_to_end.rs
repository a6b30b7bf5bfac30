//! End-to-end runs of the bundled formats through a queued pipeline.
//!
//! Tasks are handled one at a time in dispatch order, so every run here is
//! deterministic. Concurrency is covered in `concurrent_writers.rs`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;

use serde_json::json;

use sieve_core::{RequestId, StorageBackend};
use sieve_flow::formats::{chunked, row_groups};
use sieve_flow::output::ChunkedArrayReader;
use sieve_flow::paths::ArrayPaths;
use sieve_flow::request::{ReducerTask, Stage};
use sieve_flow::state::{Phase, RequestState};
use sieve_flow::Error;
use sieve_test_utils::{
    assert_same_bytes, init_test_logging, run_queue, CellFactory, RowFactory, TestContext,
};

const CELLS_PER_INPUT: usize = 10;
const INPUT_CHUNK_ROWS: u64 = 4;
const QC_FILTER: &str = "n_genes > 100 AND pct_mito < 0.3";

fn passes_qc(i: usize) -> bool {
    CellFactory::n_genes(i) > 100.0 && CellFactory::pct_mito(i) < 0.3
}

type CellRow = (Vec<f32>, Vec<f32>);

fn expected_cells(locations: &[&str]) -> BTreeMap<String, CellRow> {
    locations
        .iter()
        .flat_map(|location| {
            (0..CELLS_PER_INPUT).filter(|&i| passes_qc(i)).map(move |i| {
                (
                    CellFactory::cell_name(location, i),
                    (
                        CellFactory::expression(i),
                        vec![CellFactory::n_genes(i), CellFactory::pct_mito(i)],
                    ),
                )
            })
        })
        .collect()
}

async fn result_cells(ctx: &TestContext, request_id: RequestId) -> BTreeMap<String, CellRow> {
    let reader = ChunkedArrayReader::new(
        ctx.storage.clone(),
        ArrayPaths::for_result(&ctx.config.result_prefix, request_id),
    );
    let names = reader.read_all(chunked::CELL_NAME).await.unwrap();
    let data = reader.read_all(chunked::DATA).await.unwrap();
    let qc = reader.read_all(chunked::QC_VALUES).await.unwrap();
    assert_eq!(data.rows(), names.rows());
    assert_eq!(qc.rows(), names.rows());

    names
        .as_strings()
        .unwrap()
        .iter()
        .enumerate()
        .map(|(row, name)| {
            (
                name.clone(),
                (
                    data.f32_row(row).unwrap().to_vec(),
                    qc.f32_row(row).unwrap().to_vec(),
                ),
            )
        })
        .collect()
}

async fn snapshot(ctx: &TestContext, root: &str) -> BTreeMap<String, Vec<u8>> {
    let mut objects = BTreeMap::new();
    for meta in ctx.storage.list(&format!("{root}/")).await.unwrap() {
        let data = ctx.storage.get(&meta.path).await.unwrap();
        objects.insert(meta.path, data.to_vec());
    }
    objects
}

#[tokio::test]
async fn chunked_run_merges_surviving_cells_from_every_input() {
    init_test_logging();
    let ctx = TestContext::new();
    let locations = ["inputs/donor-a", "inputs/donor-b"];
    for location in locations {
        ctx.seed_chunked(location, CELLS_PER_INPUT, INPUT_CHUNK_ROWS).await;
    }
    let (pipeline, queue) = ctx.queued_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": locations.iter().map(|l| json!({ "location": l })).collect::<Vec<_>>(),
            "filterExpression": QC_FILTER,
        }))
        .await
        .unwrap();
    assert_eq!(queue.count(Stage::Mapper).unwrap(), 2);

    run_queue(&pipeline, &queue).await;

    let status = pipeline.status(response.request_id).await.unwrap();
    assert_eq!(status.phase, Phase::Complete);
    assert_eq!(status.state.expected_mapper_executions, 2);
    assert_eq!(status.state.completed_mapper_executions, 2);
    assert_eq!(status.state.expected_work_executions, 6);
    assert_eq!(status.state.completed_work_executions, 6);
    assert_eq!(status.state.completed_reducer_executions, 1);

    let timing = status.timing.expect("timing record");
    assert!(timing.driver_started.is_some());
    assert!(timing.work_complete.is_some());
    assert!(timing.reduce_complete.is_some());

    let actual = result_cells(&ctx, response.request_id).await;
    assert_eq!(actual, expected_cells(&locations));

    let reader = ChunkedArrayReader::new(
        ctx.storage.clone(),
        ArrayPaths::for_result(&ctx.config.result_prefix, response.request_id),
    );
    let group = reader.group().await.unwrap().expect("group document");
    assert!(group.datasets.iter().any(|d| d == chunked::GENE_NAME));
    let genes = reader.read_all(chunked::GENE_NAME).await.unwrap();
    assert_eq!(genes.as_strings().unwrap(), CellFactory::GENE_NAMES);
}

#[tokio::test]
async fn chunked_filter_can_select_on_gene_expression() {
    let ctx = TestContext::new();
    let locations = ["inputs/donor-a", "inputs/donor-b"];
    for location in locations {
        ctx.seed_chunked(location, CELLS_PER_INPUT, INPUT_CHUNK_ROWS).await;
    }
    let (pipeline, queue) = ctx.queued_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": locations.iter().map(|l| json!({ "location": l })).collect::<Vec<_>>(),
            "filterExpression": "MS4A1 > 40 AND n_genes < 300",
        }))
        .await
        .unwrap();
    run_queue(&pipeline, &queue).await;

    let status = pipeline.status(response.request_id).await.unwrap();
    assert_eq!(status.phase, Phase::Complete);

    let actual = result_cells(&ctx, response.request_id).await;
    let expected: Vec<String> = locations
        .iter()
        .flat_map(|location| {
            (0..CELLS_PER_INPUT)
                .filter(|&i| {
                    CellFactory::expression(i)[1] > 40.0 && CellFactory::n_genes(i) < 300.0
                })
                .map(move |i| CellFactory::cell_name(location, i))
        })
        .collect();
    assert_eq!(expected.len(), 10);
    assert_eq!(actual.keys().cloned().collect::<Vec<_>>(), {
        let mut sorted = expected;
        sorted.sort();
        sorted
    });
}

#[tokio::test]
async fn completion_counts_never_decrease_during_a_run() {
    let ctx = TestContext::new();
    let locations = ["inputs/a", "inputs/b", "inputs/c"];
    for location in locations {
        ctx.seed_chunked(location, CELLS_PER_INPUT, INPUT_CHUNK_ROWS).await;
    }
    let (pipeline, queue) = ctx.queued_pipeline();
    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": locations.iter().map(|l| json!({ "location": l })).collect::<Vec<_>>(),
            "filterExpression": QC_FILTER,
        }))
        .await
        .unwrap();

    let counts = |state: &RequestState| {
        [
            state.completed_mapper_executions,
            state.completed_work_executions,
            state.completed_reducer_executions,
            state.expected_work_executions,
        ]
    };
    let mut samples = vec![counts(&pipeline.status(response.request_id).await.unwrap().state)];
    while let Some(task) = queue.take().unwrap() {
        pipeline.handle(task).await.unwrap();
        samples.push(counts(&pipeline.status(response.request_id).await.unwrap().state));
    }

    for pair in samples.windows(2) {
        for (before, after) in pair[0].iter().zip(pair[1]) {
            assert!(after >= *before, "count went from {before} to {after}: {samples:?}");
        }
    }
    assert_eq!(samples.last().unwrap(), &[3, 9, 1, 9]);
    // Three mappers, nine work invocations and one reducer, plus the initial sample.
    assert_eq!(samples.len(), 1 + 3 + 9 + 1);
}

#[tokio::test]
async fn chunked_run_with_no_surviving_cells_produces_an_empty_result() {
    let ctx = TestContext::new();
    ctx.seed_chunked("inputs/empty", CELLS_PER_INPUT, INPUT_CHUNK_ROWS).await;
    let (pipeline, queue) = ctx.queued_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": [{ "location": "inputs/empty" }],
            "filterExpression": "n_genes > 100000",
        }))
        .await
        .unwrap();
    run_queue(&pipeline, &queue).await;

    let status = pipeline.status(response.request_id).await.unwrap();
    assert_eq!(status.phase, Phase::Complete);

    let paths = ArrayPaths::for_result(&ctx.config.result_prefix, response.request_id);
    let reader = ChunkedArrayReader::new(ctx.storage.clone(), paths.clone());
    let meta = reader.metadata(chunked::DATA).await.unwrap();
    assert_eq!(meta.rows(), 0);
    assert_eq!(meta.columns(), CellFactory::GENE_NAMES.len() as u64);
    assert!(!ctx.storage.exists(&paths.chunk(chunked::DATA, 0)).await.unwrap());
}

#[tokio::test]
async fn repeated_finalize_is_byte_identical() {
    let ctx = TestContext::new();
    ctx.seed_chunked("inputs/a", CELLS_PER_INPUT, INPUT_CHUNK_ROWS).await;
    let (pipeline, queue) = ctx.queued_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": [{ "location": "inputs/a" }],
            "filterExpression": QC_FILTER,
        }))
        .await
        .unwrap();
    run_queue(&pipeline, &queue).await;

    let root = ArrayPaths::for_result(&ctx.config.result_prefix, response.request_id)
        .root()
        .to_string();
    let first = snapshot(&ctx, &root).await;
    assert!(!first.is_empty());

    pipeline
        .reducer(ReducerTask {
            request_id: response.request_id,
            format: chunked::FORMAT_NAME.to_string(),
        })
        .await
        .unwrap();

    let second = snapshot(&ctx, &root).await;
    assert_eq!(first.keys().collect::<Vec<_>>(), second.keys().collect::<Vec<_>>());
    for (path, bytes) in &first {
        assert_same_bytes(path, bytes, &second[path]);
    }
    let status = pipeline.status(response.request_id).await.unwrap();
    assert_eq!(status.state.completed_reducer_executions, 2);
}

#[tokio::test]
async fn row_group_run_writes_one_shard_per_row_group() {
    let ctx = TestContext::new();
    ctx.seed_row_groups("tables/east", 3, 5).await;
    ctx.seed_row_groups("tables/west", 3, 5).await;
    let (pipeline, queue) = ctx.queued_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "row_groups",
            "inputs": [{ "location": "tables/east" }, { "location": "tables/west" }],
            "filterExpression": "depth >= 3",
        }))
        .await
        .unwrap();
    run_queue(&pipeline, &queue).await;

    let status = pipeline.status(response.request_id).await.unwrap();
    assert_eq!(status.phase, Phase::Complete);
    assert_eq!(status.state.expected_work_executions, 6);

    let manifest = row_groups::read_manifest(&pipeline.context(response.request_id))
        .await
        .unwrap()
        .expect("manifest");
    assert_eq!(manifest.columns, RowFactory::COLUMNS);
    assert_eq!(manifest.shards.len(), 6);

    let per_input = (0..15).filter(|i| RowFactory::row(*i)[1] >= 3.0).count() as u64;
    assert_eq!(manifest.total_rows, 2 * per_input);
    assert_eq!(
        manifest.shards.iter().map(|s| s.rows).sum::<u64>(),
        manifest.total_rows
    );
    let mut ids: Vec<_> = manifest.shards.iter().map(|s| s.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, manifest.shards.iter().map(|s| s.id.clone()).collect::<Vec<_>>());
}

#[tokio::test]
async fn unknown_format_touches_no_state() {
    let ctx = TestContext::new();
    let (pipeline, queue) = ctx.queued_pipeline();

    let err = pipeline
        .submit(&json!({
            "format": "loom",
            "inputs": [{ "location": "inputs/a" }],
            "filterExpression": "TRUE",
        }))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownFormat { ref format } if format == "loom"));
    assert!(queue.is_empty().unwrap());
    assert!(ctx.records.operations().is_empty());
    assert!(ctx.storage.operations().is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_write() {
    let ctx = TestContext::new();
    let (pipeline, queue) = ctx.queued_pipeline();

    let payloads = [
        json!({ "format": "chunked", "inputs": [] , "filterExpression": "TRUE" }),
        json!({ "format": "", "inputs": [{ "location": "a" }], "filterExpression": "TRUE" }),
        json!({ "format": "chunked", "inputs": [{ "location": "" }], "filterExpression": "TRUE" }),
        json!({ "format": "chunked", "inputs": "a", "filterExpression": "TRUE" }),
        json!(["chunked"]),
    ];
    for payload in &payloads {
        let err = pipeline.submit(payload).await.unwrap_err();
        assert!(err.is_validation(), "{payload} should fail validation, got {err}");
    }

    let err = pipeline
        .submit(&json!({ "inputs": [{ "location": "a" }] }))
        .await
        .unwrap_err();
    let Error::Validation { missing_keys, .. } = err else {
        panic!("expected a validation error");
    };
    assert_eq!(missing_keys, vec!["format", "filterExpression"]);

    assert!(queue.is_empty().unwrap());
    assert!(ctx.records.operations().is_empty());
}

#[tokio::test]
async fn bad_filter_fails_work_and_stalls_the_request() {
    let ctx = TestContext::new();
    ctx.seed_chunked("inputs/a", CELLS_PER_INPUT, INPUT_CHUNK_ROWS).await;
    let (pipeline, queue) = ctx.queued_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": [{ "location": "inputs/a" }],
            "filterExpression": "no_such_metric > 1",
        }))
        .await
        .unwrap();

    let mut failures = 0;
    while let Some(task) = queue.take().unwrap() {
        if let Err(e) = pipeline.handle(task).await {
            assert!(matches!(e, Error::Filter { .. }), "unexpected error: {e}");
            failures += 1;
        }
    }

    assert_eq!(failures, 3);
    let status = pipeline.status(response.request_id).await.unwrap();
    assert_eq!(status.phase, Phase::Working);
    assert_eq!(status.state.completed_work_executions, 0);
}
