//! Assertion helpers for coordination invariants.

use std::ops::Range;

/// Asserts that `ranges` are pairwise disjoint and together cover `[0, total)`.
///
/// # Panics
///
/// Panics with the first gap or overlap found.
pub fn assert_disjoint_cover(ranges: &[Range<u64>], total: u64) {
    let mut sorted: Vec<Range<u64>> = ranges.iter().filter(|r| !r.is_empty()).cloned().collect();
    sorted.sort_by_key(|r| r.start);

    let mut next = 0;
    for range in &sorted {
        assert!(
            range.start >= next,
            "range {range:?} overlaps rows before {next}"
        );
        assert_eq!(range.start, next, "rows {next}..{} were never allocated", range.start);
        next = range.end;
    }
    assert_eq!(next, total, "allocated rows end at {next}, expected {total}");
}

/// Asserts that two byte payloads are identical, reporting their lengths.
///
/// # Panics
///
/// Panics if the payloads differ.
pub fn assert_same_bytes(label: &str, left: &[u8], right: &[u8]) {
    assert!(
        left == right,
        "{label}: payloads differ ({} vs {} bytes)",
        left.len(),
        right.len()
    );
}
