//! Tests for the reduce merger and global aggregate

use chrono::DateTime;
use fleettrace::{
    merge, reduce, reduce_sequential, reduce_tree, DuplicatePolicy, GlobalAggregate,
    PartialAggregate, RecordOrigin, ReduceStrategy, TelemetryRecord,
};
use proptest::prelude::*;

fn record(device: &str, secs: i64, source: u32, row: u64) -> TelemetryRecord {
    TelemetryRecord {
        device_id: device.to_string(),
        timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        latitude: 50.0 + secs as f64 * 1e-4,
        longitude: -104.0,
        payload: Default::default(),
        origin: RecordOrigin::new(source, row),
    }
}

fn sample_records() -> Vec<TelemetryRecord> {
    vec![
        record("a", 10, 0, 0),
        record("b", 4, 0, 1),
        record("a", 2, 0, 2),
        record("c", 7, 1, 0),
        record("a", 6, 1, 1),
        record("b", 1, 1, 2),
        record("a", 14, 2, 0),
        record("c", 3, 2, 1),
    ]
}

/// Split `records` into partials of `size`, with `rejected` spread over them.
fn partials(records: &[TelemetryRecord], size: usize) -> Vec<PartialAggregate> {
    records
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| PartialAggregate::from_records(chunk.to_vec(), i % 2))
        .collect()
}

fn timestamps(records: &[TelemetryRecord]) -> Vec<i64> {
    records.iter().map(|r| r.timestamp.timestamp()).collect()
}

// ============================================================================
// Partial aggregates
// ============================================================================

#[test]
fn test_from_records_groups_and_sorts() {
    let partial = PartialAggregate::from_records(sample_records(), 2);

    assert_eq!(partial.record_count(), 8);
    assert_eq!(partial.rejected_count(), 2);
    assert_eq!(partial.device_count(), 3);
    assert_eq!(timestamps(partial.device("a").unwrap()), vec![2, 6, 10, 14]);
    assert!(partial.check_invariants().is_ok());
}

#[test]
fn test_empty_is_identity() {
    let partial = PartialAggregate::from_records(sample_records(), 3);

    assert_eq!(merge(partial.clone(), PartialAggregate::empty()), partial);
    assert_eq!(merge(PartialAggregate::empty(), partial.clone()), partial);
    assert!(PartialAggregate::empty().is_empty());
}

#[test]
fn test_merge_is_commutative() {
    let records = sample_records();
    let left = PartialAggregate::from_records(records[..5].to_vec(), 1);
    let right = PartialAggregate::from_records(records[5..].to_vec(), 2);

    let ab = merge(left.clone(), right.clone());
    let ba = merge(right, left);
    assert_eq!(ab, ba);
    assert_eq!(ab.record_count(), 8);
    assert_eq!(ab.rejected_count(), 3);
}

#[test]
fn test_merge_is_associative() {
    let parts = partials(&sample_records(), 3);
    let [a, b, c]: [PartialAggregate; 3] = parts.try_into().unwrap();

    let left_first = merge(merge(a.clone(), b.clone()), c.clone());
    let right_first = merge(a, merge(b, c));
    assert_eq!(left_first, right_first);
}

#[test]
fn test_merge_of_same_chunk_twice_keeps_rows_once() {
    let partial = PartialAggregate::from_records(vec![record("a", 1, 0, 0), record("a", 2, 0, 1)], 0);
    let merged = merge(partial.clone(), partial);

    assert_eq!(merged.record_count(), 2);
    assert!(merged.check_invariants().is_ok());
}

#[test]
fn test_equal_timestamps_from_different_rows_are_both_kept() {
    let left = PartialAggregate::from_records(vec![record("a", 5, 1, 0)], 0);
    let right = PartialAggregate::from_records(vec![record("a", 5, 0, 9)], 0);
    let merged = merge(left, right);

    let rows: Vec<_> = merged.device("a").unwrap().iter().map(|r| r.origin).collect();
    assert_eq!(rows, vec![RecordOrigin::new(0, 9), RecordOrigin::new(1, 0)]);
    assert_eq!(merged.record_count(), 2);
}

#[test]
fn test_distinct_records_sharing_origin_are_both_kept() {
    // Two chunk builders that both numbered their first row 0.
    let first = record("x", 0, 0, 0);
    let mut second = record("x", 0, 0, 0);
    second.latitude = 2.0;

    let a = PartialAggregate::from_records(vec![first.clone()], 0);
    let b = PartialAggregate::from_records(vec![second.clone()], 0);
    let ab = merge(a.clone(), b.clone());
    let ba = merge(b, a);

    assert_eq!(ab, ba);
    assert_eq!(ab.record_count(), 2);
    assert!(ab.check_invariants().is_ok());

    let both = PartialAggregate::from_records(vec![second, first], 0);
    assert_eq!(both, ab);

    let global = GlobalAggregate::finalize(ab, DuplicatePolicy::KeepFirst).unwrap();
    assert_eq!(global.record_count(), 1);
    assert_eq!(global.duplicate_count(), 1);
    assert_eq!(global.device("x").unwrap()[0].latitude, 2.0);
}

// ============================================================================
// Reduction strategies
// ============================================================================

#[test]
fn test_tree_and_sequential_agree_for_every_chunking() {
    let records = sample_records();
    let reference = PartialAggregate::from_records(records.clone(), 0);

    for size in 1..=records.len() {
        let parts: Vec<_> = records
            .chunks(size)
            .map(|chunk| PartialAggregate::from_records(chunk.to_vec(), 0))
            .collect();

        assert_eq!(reduce_tree(parts.clone()), reference, "tree, chunk size {size}");
        assert_eq!(reduce_sequential(parts.clone()), reference, "fold, chunk size {size}");

        let mut reversed = parts;
        reversed.reverse();
        assert_eq!(reduce(reversed, ReduceStrategy::Tree), reference, "reversed, {size}");
    }
}

#[test]
fn test_reduce_empty_input() {
    assert_eq!(reduce_tree(Vec::new()), PartialAggregate::empty());
    assert_eq!(reduce_sequential(Vec::new()), PartialAggregate::empty());
}

#[test]
fn test_reduce_conserves_counts() {
    let parts = partials(&sample_records(), 2);
    let expected_rejected: usize = parts.iter().map(|p| p.rejected_count()).sum();
    let reduced = reduce(parts, ReduceStrategy::Sequential);

    assert_eq!(reduced.record_count(), 8);
    assert_eq!(reduced.rejected_count(), expected_rejected);
}

// ============================================================================
// Global aggregate
// ============================================================================

#[test]
fn test_finalize_keeps_first_duplicate() {
    let partial = PartialAggregate::from_records(
        vec![
            record("a", 5, 2, 0),
            record("a", 5, 0, 3),
            record("a", 5, 1, 1),
            record("a", 8, 0, 4),
        ],
        1,
    );
    let global = GlobalAggregate::finalize(partial, DuplicatePolicy::KeepFirst).unwrap();

    let kept = global.device("a").unwrap();
    assert_eq!(timestamps(kept), vec![5, 8]);
    assert_eq!(kept[0].origin, RecordOrigin::new(0, 3));
    assert_eq!(global.record_count(), 2);
    assert_eq!(global.duplicate_count(), 2);
    assert_eq!(global.rejected_count(), 1);
}

#[test]
fn test_finalize_reject_policy_drops_all_colliding_records() {
    let partial = PartialAggregate::from_records(
        vec![
            record("a", 5, 0, 0),
            record("a", 5, 1, 0),
            record("a", 9, 1, 1),
            record("b", 5, 0, 1),
            record("b", 5, 0, 2),
        ],
        0,
    );
    let global = GlobalAggregate::finalize(partial, DuplicatePolicy::Reject).unwrap();

    assert_eq!(timestamps(global.device("a").unwrap()), vec![9]);
    assert!(global.device("b").is_none());
    assert_eq!(global.device_count(), 1);
    assert_eq!(global.record_count(), 1);
    assert_eq!(global.rejected_count(), 4);
    assert_eq!(global.duplicate_count(), 0);
}

#[test]
fn test_global_sequences_strictly_increasing() {
    let global = GlobalAggregate::finalize(
        reduce_tree(partials(&sample_records(), 3)),
        DuplicatePolicy::KeepFirst,
    )
    .unwrap();

    for (device_id, records) in global.devices() {
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.device_id == device_id));
        assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
    assert_eq!(global.records().count(), global.record_count());
    assert_eq!(global.device_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
}

#[test]
fn test_finalize_empty() {
    let global = GlobalAggregate::finalize(PartialAggregate::empty(), DuplicatePolicy::KeepFirst)
        .unwrap();
    assert!(global.is_empty());
    assert_eq!(global.record_count(), 0);
}

// ============================================================================
// Property tests
// ============================================================================

fn arb_records() -> impl Strategy<Value = Vec<TelemetryRecord>> {
    prop::collection::vec((0usize..4, 0i64..50), 0..60).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(row, (device, secs))| {
                let device = ["a", "b", "c", "d"][device];
                record(device, secs, (row % 3) as u32, row as u64)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_chunking_and_tree_shape_do_not_matter(
        records in arb_records(),
        size in 1usize..10,
        rotate in 0usize..10,
    ) {
        let reference = GlobalAggregate::finalize(
            PartialAggregate::from_records(records.clone(), 0),
            DuplicatePolicy::KeepFirst,
        ).unwrap();

        let mut parts: Vec<_> = records
            .chunks(size)
            .map(|chunk| PartialAggregate::from_records(chunk.to_vec(), 0))
            .collect();
        if !parts.is_empty() {
            let k = rotate % parts.len();
            parts.rotate_left(k);
        }

        let tree = GlobalAggregate::finalize(reduce_tree(parts.clone()), DuplicatePolicy::KeepFirst)
            .unwrap();
        let fold = GlobalAggregate::finalize(reduce_sequential(parts), DuplicatePolicy::KeepFirst)
            .unwrap();

        prop_assert_eq!(&tree, &reference);
        prop_assert_eq!(&fold, &reference);
        prop_assert_eq!(
            tree.record_count() + tree.duplicate_count(),
            records.len()
        );
    }

    #[test]
    fn prop_merge_commutes(a in arb_records(), b in arb_records()) {
        let left = PartialAggregate::from_records(a, 1);
        let right = PartialAggregate::from_records(b, 2);
        prop_assert_eq!(merge(left.clone(), right.clone()), merge(right, left));
    }
}
