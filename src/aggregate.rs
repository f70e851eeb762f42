//! Partial and global aggregates, and the reduce merger.
//!
//! A [`PartialAggregate`] is owned by exactly one producer (a map worker or a
//! merge) and never mutated after it is handed off. [`merge`] consumes two
//! partials and returns a fresh one. Because every per-device sequence is kept
//! in the total order of [`TelemetryRecord::canonical_cmp`] (timestamp, origin,
//! then content), merging is exactly commutative and associative, so any
//! reduction tree over any chunking yields the same result.
//!
//! Deduplication by `(device_id, timestamp)` is not part of the pairwise merge;
//! it runs once in [`GlobalAggregate::finalize`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::config::{DuplicatePolicy, ReduceStrategy};
use crate::error::{EngineError, Result};
use crate::TelemetryRecord;

type DeviceMap = BTreeMap<String, Vec<TelemetryRecord>>;

/// Per-chunk (or partially reduced) aggregate.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PartialAggregate {
    per_device: DeviceMap,
    record_count: usize,
    rejected_count: usize,
}

impl PartialAggregate {
    /// The identity element of [`merge`].
    pub fn empty() -> Self {
        Self::default()
    }

    /// Group accepted records by device and sort each device canonically.
    ///
    /// Identical records (same row handed in twice) are kept once; records
    /// that only share `(timestamp, origin)` are both kept.
    pub fn from_records(records: Vec<TelemetryRecord>, rejected_count: usize) -> Self {
        let mut per_device: DeviceMap = BTreeMap::new();
        for record in records {
            per_device
                .entry(record.device_id.clone())
                .or_default()
                .push(record);
        }

        let mut record_count = 0;
        for sequence in per_device.values_mut() {
            sequence.sort_by(TelemetryRecord::canonical_cmp);
            sequence.dedup_by(|a, b| a.canonical_cmp(b) == Ordering::Equal);
            record_count += sequence.len();
        }

        Self {
            per_device,
            record_count,
            rejected_count,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected_count
    }

    pub fn device_count(&self) -> usize {
        self.per_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0 && self.rejected_count == 0
    }

    /// Canonically ordered records of one device.
    pub fn device(&self, device_id: &str) -> Option<&[TelemetryRecord]> {
        self.per_device.get(device_id).map(Vec::as_slice)
    }

    /// Devices in id order with their record sequences.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &[TelemetryRecord])> {
        self.per_device
            .iter()
            .map(|(id, records)| (id.as_str(), records.as_slice()))
    }

    /// Combine two partials into a new one. See [`merge`].
    pub fn merge(self, other: Self) -> Self {
        // Fold the smaller device map into the larger one.
        let (base, extra) = if self.per_device.len() >= other.per_device.len() {
            (self, other)
        } else {
            (other, self)
        };

        let mut per_device = base.per_device;
        let mut record_count = base.record_count + extra.record_count;

        for (device_id, incoming) in extra.per_device {
            match per_device.remove(&device_id) {
                Some(existing) => {
                    let (merged, collapsed) = merge_sorted(existing, incoming);
                    record_count -= collapsed;
                    per_device.insert(device_id, merged);
                }
                None => {
                    per_device.insert(device_id, incoming);
                }
            }
        }

        Self {
            per_device,
            record_count,
            rejected_count: base.rejected_count + extra.rejected_count,
        }
    }

    /// Verify canonical ordering and the count invariant.
    pub fn check_invariants(&self) -> Result<()> {
        check_sequences(&self.per_device, self.record_count, false)
    }
}

/// Associative, commutative merge of two partial aggregates.
///
/// Per device, the two canonically sorted sequences are merged in linear time.
/// Counts add; an exact duplicate (the same record merged twice) is kept once
/// and the record count is adjusted so it always equals the number of stored
/// records. Distinct records are never dropped here.
pub fn merge(a: PartialAggregate, b: PartialAggregate) -> PartialAggregate {
    a.merge(b)
}

/// Merge two canonically sorted sequences. Returns the merged sequence and
/// how many exact duplicates were collapsed.
fn merge_sorted(
    left: Vec<TelemetryRecord>,
    right: Vec<TelemetryRecord>,
) -> (Vec<TelemetryRecord>, usize) {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut collapsed = 0;
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let order = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => a.canonical_cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match order {
            Ordering::Less => out.extend(left.next()),
            Ordering::Greater => out.extend(right.next()),
            Ordering::Equal => {
                out.extend(left.next());
                right.next();
                collapsed += 1;
            }
        }
    }

    (out, collapsed)
}

/// Left fold over `parts` in order.
pub fn reduce_sequential(parts: Vec<PartialAggregate>) -> PartialAggregate {
    parts
        .into_iter()
        .fold(PartialAggregate::empty(), PartialAggregate::merge)
}

/// Pairwise tree reduction. Halves are reduced concurrently with the
/// `parallel` feature; every intermediate result is a fresh value owned only
/// by the merge that consumes it.
pub fn reduce_tree(mut parts: Vec<PartialAggregate>) -> PartialAggregate {
    match parts.len() {
        0 => PartialAggregate::empty(),
        1 => parts.pop().unwrap_or_default(),
        n => {
            let right = parts.split_off(n / 2);
            let (left, right) = join(move || reduce_tree(parts), move || reduce_tree(right));
            left.merge(right)
        }
    }
}

/// Reduce with the given strategy.
pub fn reduce(parts: Vec<PartialAggregate>, strategy: ReduceStrategy) -> PartialAggregate {
    match strategy {
        ReduceStrategy::Tree => reduce_tree(parts),
        ReduceStrategy::Sequential => reduce_sequential(parts),
    }
}

#[cfg(feature = "parallel")]
pub(crate) fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    rayon::join(a, b)
}

#[cfg(not(feature = "parallel"))]
pub(crate) fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA,
    B: FnOnce() -> RB,
{
    (a(), b())
}

// ============================================================================
// Global Aggregate
// ============================================================================

/// The union of all chunks: deduplicated, globally time-sorted, read-only.
///
/// Invariants (checked by [`GlobalAggregate::finalize`]):
/// - `record_count` equals the total length of all device sequences
/// - every sequence is non-empty and strictly increasing in timestamp
/// - every record's `device_id` matches its key
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GlobalAggregate {
    per_device: DeviceMap,
    record_count: usize,
    rejected_count: usize,
    duplicate_count: usize,
}

impl GlobalAggregate {
    /// Apply the duplicate policy to a fully reduced partial and verify the
    /// global invariants.
    pub fn finalize(partial: PartialAggregate, policy: DuplicatePolicy) -> Result<Self> {
        partial.check_invariants()?;

        let PartialAggregate {
            per_device,
            rejected_count,
            ..
        } = partial;

        let mut global = GlobalAggregate {
            rejected_count,
            ..Default::default()
        };

        for (device_id, records) in per_device {
            let (kept, dropped) = dedup_device(records, policy);
            if dropped > 0 {
                debug!(
                    "[Reduce] {}: {} records share a timestamp ({:?})",
                    device_id, dropped, policy
                );
                match policy {
                    DuplicatePolicy::KeepFirst => global.duplicate_count += dropped,
                    DuplicatePolicy::Reject => global.rejected_count += dropped,
                }
            }
            if kept.is_empty() {
                continue;
            }
            global.record_count += kept.len();
            global.per_device.insert(device_id, kept);
        }

        check_sequences(&global.per_device, global.record_count, true)?;
        Ok(global)
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Rows rejected by normalization, plus duplicate collisions under
    /// [`DuplicatePolicy::Reject`].
    pub fn rejected_count(&self) -> usize {
        self.rejected_count
    }

    /// Records dropped under [`DuplicatePolicy::KeepFirst`].
    pub fn duplicate_count(&self) -> usize {
        self.duplicate_count
    }

    pub fn device_count(&self) -> usize {
        self.per_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_device.is_empty()
    }

    /// Time-sorted records of one device.
    pub fn device(&self, device_id: &str) -> Option<&[TelemetryRecord]> {
        self.per_device.get(device_id).map(Vec::as_slice)
    }

    /// Devices in id order with their record sequences.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &[TelemetryRecord])> {
        self.per_device
            .iter()
            .map(|(id, records)| (id.as_str(), records.as_slice()))
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.per_device.keys().map(String::as_str)
    }

    /// All records, device by device.
    pub fn records(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.per_device.values().flatten()
    }
}

fn dedup_device(
    records: Vec<TelemetryRecord>,
    policy: DuplicatePolicy,
) -> (Vec<TelemetryRecord>, usize) {
    let mut kept = Vec::with_capacity(records.len());
    let mut dropped = 0;
    let mut iter = records.into_iter().peekable();

    while let Some(first) = iter.next() {
        let mut run = 1;
        while iter
            .peek()
            .is_some_and(|next| next.timestamp == first.timestamp)
        {
            iter.next();
            run += 1;
        }
        match policy {
            DuplicatePolicy::KeepFirst => {
                kept.push(first);
                dropped += run - 1;
            }
            DuplicatePolicy::Reject if run > 1 => dropped += run,
            DuplicatePolicy::Reject => kept.push(first),
        }
    }

    (kept, dropped)
}

fn violation(device_id: &str, detail: String) -> EngineError {
    EngineError::MergeInvariantViolation {
        device_id: device_id.to_string(),
        detail,
    }
}

/// `strict`: timestamps strictly increasing (post-dedup); otherwise the
/// canonical order must be strictly increasing.
fn check_sequences(per_device: &DeviceMap, record_count: usize, strict: bool) -> Result<()> {
    let mut total = 0;

    for (device_id, records) in per_device {
        if records.is_empty() {
            return Err(violation(device_id, "empty record sequence".to_string()));
        }
        if let Some(stray) = records.iter().find(|r| &r.device_id != device_id) {
            return Err(violation(
                device_id,
                format!("holds a record of device '{}'", stray.device_id),
            ));
        }
        for pair in records.windows(2) {
            let ordered = if strict {
                pair[0].timestamp < pair[1].timestamp
            } else {
                pair[0].canonical_cmp(&pair[1]) == Ordering::Less
            };
            if !ordered {
                return Err(violation(
                    device_id,
                    format!(
                        "record {} (row {}) is not after {} (row {})",
                        pair[1].timestamp, pair[1].origin.row, pair[0].timestamp, pair[0].origin.row
                    ),
                ));
            }
        }
        total += records.len();
    }

    if total != record_count {
        return Err(violation(
            "*",
            format!("record_count is {record_count} but sequences hold {total} records"),
        ));
    }
    Ok(())
}
