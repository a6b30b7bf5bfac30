//! Concurrency tests for row allocation and chunk merging.
//!
//! Writers share chunk boundaries on purpose: with four rows per chunk and
//! odd-sized ranges, most chunks receive rows from more than one writer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use sieve_core::{Condition, RequestId, WriteOutcome};
use sieve_flow::formats::chunked;
use sieve_flow::output::{ArrayBlock, ChunkedOutputWriter, DatasetSpec, Dtype};
use sieve_flow::paths::chunk_lock_key;
use sieve_flow::state::Phase;
use sieve_test_utils::{
    assert_disjoint_cover, init_test_logging, wait_for_phase, CellFactory, RecordOpKind,
    TestContext,
};

const MARKER: &str = "marker";

fn writer(ctx: &TestContext, request_id: RequestId) -> ChunkedOutputWriter {
    ChunkedOutputWriter::new(request_id, ctx.storage.clone(), ctx.records.clone(), &ctx.config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_merge_without_losing_rows() {
    init_test_logging();
    let ctx = TestContext::new();
    let request_id = RequestId::generate();
    writer(&ctx, request_id).initialize_row_allocator().await.unwrap();

    let sizes: Vec<u64> = vec![3, 5, 1, 7, 2, 6, 3, 4];
    let tasks = sizes.iter().enumerate().map(|(id, &rows)| {
        let writer = writer(&ctx, request_id);
        async move {
            let range = writer.allocate_row_range(rows).await.unwrap();
            let marker = f32::from(u8::try_from(id + 1).unwrap());
            let len = usize::try_from(rows).unwrap();
            let block = ArrayBlock::from_f32(len, 1, vec![marker; len]).unwrap();
            writer.write_rows(MARKER, range, &block).await.unwrap();
            (range, marker)
        }
    });
    let written = join_all(tasks.map(tokio::spawn)).await;
    let written: Vec<_> = written.into_iter().map(Result::unwrap).collect();

    let total: u64 = sizes.iter().sum();
    let ranges: Vec<_> = written.iter().map(|(r, _)| r.start..r.end).collect();
    assert_disjoint_cover(&ranges, total);

    let summary = writer(&ctx, request_id)
        .finalize(&[DatasetSpec::new(MARKER, Dtype::Float32, 1)], &[])
        .await
        .unwrap();
    assert_eq!(summary.total_rows, total);

    let values = writer(&ctx, request_id)
        .reader()
        .read_all(MARKER)
        .await
        .unwrap();
    let values = values.as_f32().unwrap();
    for (range, marker) in &written {
        for row in range.start..range.end {
            assert_eq!(
                values[row as usize], *marker,
                "row {row} lost its value (range {range:?})"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_chunks_take_independent_locks() {
    let ctx = TestContext::new();
    let request_id = RequestId::generate();
    let rows_per_chunk = ctx.config.rows_per_chunk;
    writer(&ctx, request_id).initialize_row_allocator().await.unwrap();

    let first = writer(&ctx, request_id).allocate_row_range(rows_per_chunk).await.unwrap();
    let second = writer(&ctx, request_id).allocate_row_range(rows_per_chunk).await.unwrap();
    assert_eq!(first.chunk_span(rows_per_chunk), 0..1);
    assert_eq!(second.chunk_span(rows_per_chunk), 1..2);
    ctx.records.clear_operations();

    let tasks = [(first, 1.0f32), (second, 2.0)].map(|(range, marker)| {
        let writer = writer(&ctx, request_id);
        tokio::spawn(async move {
            let len = usize::try_from(range.len()).unwrap();
            let block = ArrayBlock::from_f32(len, 1, vec![marker; len]).unwrap();
            writer.write_rows(MARKER, range, &block).await.unwrap();
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    let lock_ops = ctx.records.operations_on(&ctx.config.tables.locks);
    let keys = [
        chunk_lock_key(request_id, MARKER, 0),
        chunk_lock_key(request_id, MARKER, 1),
    ];
    assert!(
        lock_ops.iter().all(|op| keys.contains(&op.key)),
        "unexpected lock keys: {lock_ops:?}"
    );
    for key in &keys {
        let creates: Vec<_> = lock_ops
            .iter()
            .filter(|op| &op.key == key && op.kind == RecordOpKind::Put)
            .collect();
        assert_eq!(creates.len(), 1, "lock {key}: {lock_ops:?}");
        assert_eq!(creates[0].condition, Some(Condition::NotExists));
        assert_eq!(creates[0].outcome, Some(WriteOutcome::Applied));
        assert!(
            !lock_ops
                .iter()
                .any(|op| &op.key == key && op.kind == RecordOpKind::Update),
            "lock {key} was taken over"
        );
    }
    assert_eq!(ctx.records.condition_failures(), 0, "{lock_ops:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_partition_the_row_space() {
    let ctx = TestContext::new();
    let request_id = RequestId::generate();
    writer(&ctx, request_id).initialize_row_allocator().await.unwrap();

    let tasks = (1..=20u64).map(|rows| {
        let writer = writer(&ctx, request_id);
        tokio::spawn(async move { writer.allocate_row_range(rows).await.unwrap() })
    });
    let ranges: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| {
            let range = r.unwrap();
            range.start..range.end
        })
        .collect();

    assert_disjoint_cover(&ranges, (1..=20).sum());
    assert_eq!(
        writer(&ctx, request_id).total_rows().await.unwrap(),
        (1..=20).sum::<u64>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locally_dispatched_run_matches_the_sequential_result() {
    let ctx = TestContext::new();
    let locations = ["inputs/p1", "inputs/p2", "inputs/p3"];
    for location in locations {
        ctx.seed_chunked(location, 11, 3).await;
    }
    let (pipeline, workers) = ctx.local_pipeline();

    let response = pipeline
        .submit(&json!({
            "format": "chunked",
            "inputs": locations.iter().map(|l| json!({ "location": l })).collect::<Vec<_>>(),
            "filterExpression": "pct_mito < 0.22",
        }))
        .await
        .unwrap();
    let status = wait_for_phase(
        &pipeline,
        response.request_id,
        Phase::Complete,
        Duration::from_secs(20),
    )
    .await;
    assert_eq!(status.state.expected_work_executions, 12);
    assert_eq!(status.state.completed_work_executions, 12);

    let reader = writer(&ctx, response.request_id).reader();
    let names = reader.read_all(chunked::CELL_NAME).await.unwrap();
    let data = reader.read_all(chunked::DATA).await.unwrap();

    let expected: BTreeSet<String> = locations
        .iter()
        .flat_map(|l| {
            (0..11)
                .filter(|&i| CellFactory::pct_mito(i) < 0.22)
                .map(move |i| CellFactory::cell_name(l, i))
        })
        .collect();
    let actual: BTreeSet<String> = names.as_strings().unwrap().iter().cloned().collect();
    assert_eq!(actual, expected);
    assert_eq!(names.rows(), expected.len());

    for (row, name) in names.as_strings().unwrap().iter().enumerate() {
        let i: usize = name.rsplit('#').next().unwrap().parse().unwrap();
        assert_eq!(data.f32_row(row).unwrap(), CellFactory::expression(i).as_slice());
    }

    workers.abort();
}
