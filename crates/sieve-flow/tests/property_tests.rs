//! Property-based tests for allocation, chunk spans and filters.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_test::block_on;

use sieve_core::{MemoryBackend, MemoryRecordStore, RequestId};
use sieve_flow::config::PipelineConfig;
use sieve_flow::filter::RowFilter;
use sieve_flow::output::{ArrayBlock, ChunkedOutputWriter, DatasetSpec, Dtype, RowRange};
use sieve_test_utils::assert_disjoint_cover;

fn writer(rows_per_chunk: u64) -> ChunkedOutputWriter {
    let config = PipelineConfig::default()
        .with_rows_per_chunk(rows_per_chunk)
        .with_counter_retry(Duration::from_millis(1));
    ChunkedOutputWriter::new(
        RequestId::generate(),
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryRecordStore::new()),
        &config,
    )
}

/// Column values that never sit on a threshold boundary by accident.
fn arb_value() -> impl Strategy<Value = f32> {
    (-4000i32..4000).prop_map(|v| v as f32 / 4.0)
}

fn arb_threshold() -> impl Strategy<Value = f64> {
    (-2000i32..2000).prop_map(|t| f64::from(t) / 2.0 + 0.125)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Sequential allocations are contiguous and sum to the total.
    #[test]
    fn allocations_partition_rows(sizes in prop::collection::vec(0u64..40, 1..20)) {
        let writer = writer(8);
        let ranges = block_on(async {
            writer.initialize_row_allocator().await.unwrap();
            let mut ranges = Vec::new();
            for &size in &sizes {
                let range = writer.allocate_row_range(size).await.unwrap();
                ranges.push(range.start..range.end);
            }
            ranges
        });

        let total: u64 = sizes.iter().sum();
        assert_disjoint_cover(&ranges, total);
        prop_assert_eq!(block_on(writer.total_rows()).unwrap(), total);
    }

    /// Every row of a range falls in one of its chunks, and no chunk is spare.
    #[test]
    fn chunk_span_is_tight(start in 0u64..500, len in 1u64..200, per_chunk in 1u64..64) {
        let range = RowRange::new(start, start + len);
        let span = range.chunk_span(per_chunk);

        prop_assert_eq!(span.start, start / per_chunk);
        prop_assert_eq!(span.end - 1, (range.end - 1) / per_chunk);
        for row in range.start..range.end {
            prop_assert!(span.contains(&(row / per_chunk)));
        }
    }

    /// Numeric comparisons agree with the same comparison done in f64.
    #[test]
    fn comparison_matches_native(value in arb_value(), threshold in arb_threshold()) {
        let gt = RowFilter::compile(&format!("x > {threshold}"), &["x"]).unwrap();
        let le = RowFilter::compile(&format!("x <= {threshold}"), &["x"]).unwrap();

        prop_assert_eq!(gt.matches(&[value]), f64::from(value) > threshold);
        prop_assert_eq!(le.matches(&[value]), !gt.matches(&[value]));
    }

    /// NOT inverts and AND/OR follow boolean algebra.
    #[test]
    fn logic_follows_boolean_algebra(
        a in arb_value(),
        b in arb_value(),
        ta in arb_threshold(),
        tb in arb_threshold(),
    ) {
        let columns = ["a", "b"];
        let left = format!("a < {ta}");
        let right = format!("b >= {tb}");
        let row = [a, b];
        let eval = |src: &str| RowFilter::compile(src, &columns).unwrap().matches(&row);

        let l = eval(&left);
        let r = eval(&right);
        prop_assert_eq!(eval(&format!("NOT ({left})")), !l);
        prop_assert_eq!(eval(&format!("{left} AND {right}")), l && r);
        prop_assert_eq!(eval(&format!("{left} OR {right}")), l || r);
        prop_assert_eq!(eval(&format!("NOT ({left} OR {right})")), !l && !r);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Rows written in arbitrary batches read back in allocation order.
    #[test]
    fn merged_chunks_read_back(
        batches in prop::collection::vec(1usize..9, 1..8),
        per_chunk in 1u64..6,
    ) {
        let writer = writer(per_chunk);
        let (expected, actual) = block_on(async {
            writer.initialize_row_allocator().await.unwrap();
            let mut expected = Vec::new();
            for (batch, &rows) in batches.iter().enumerate() {
                let values: Vec<f32> = (0..rows * 2)
                    .map(|i| f32::from(u16::try_from(batch * 100 + i).unwrap()))
                    .collect();
                let range = writer.allocate_row_range(rows as u64).await.unwrap();
                let block = ArrayBlock::from_f32(rows, 2, values.clone()).unwrap();
                writer.write_rows("values", range, &block).await.unwrap();
                expected.extend(values);
            }
            writer
                .finalize(&[DatasetSpec::new("values", Dtype::Float32, 2)], &[])
                .await
                .unwrap();
            let actual = writer.reader().read_all("values").await.unwrap();
            (expected, actual)
        });

        prop_assert_eq!(actual.as_f32().unwrap(), expected.as_slice());
    }
}
