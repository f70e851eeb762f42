//! # Fleet Trace
//!
//! Concurrent map-reduce aggregation of fleet location telemetry.
//!
//! This library provides:
//! - Validation and normalization of raw telemetry rows
//! - Parallel map workers producing privately owned partial aggregates
//! - An associative, commutative merge with tree or sequential reduction
//! - Per-device dwell time, visit counts and idle intervals
//! - Weighted point sets for heatmap rendering and density estimation
//!
//! ## Features
//!
//! - **`parallel`** - Run map workers, reduction and derivations on rayon (default)
//! - **`synthetic`** - Synthetic fleet generator for benchmarks and stress tests
//! - **`cli`** - Build the `fleettrace-cli` debug binary
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use fleettrace::{EngineConfig, Orchestrator, RawRow, RunStatus};
//! use serde_json::json;
//!
//! fn row(value: serde_json::Value) -> RawRow {
//!     value.as_object().cloned().unwrap()
//! }
//!
//! let chunk = vec![
//!     row(json!({"device_id": "truck-1", "timestamp": "2024-03-01T08:00:00Z", "latitude": 52.1, "longitude": -106.6})),
//!     row(json!({"device_id": "truck-1", "timestamp": "2024-03-01T08:01:00Z", "latitude": 52.2, "longitude": -106.6})),
//! ];
//!
//! let engine = Orchestrator::new(EngineConfig::with_max_gap(Duration::from_secs(300))).unwrap();
//! let report = engine.run_rows(vec![("file-1".to_string(), chunk)]).unwrap();
//!
//! assert_eq!(report.status, RunStatus::Success);
//! assert_eq!(report.aggregate.record_count(), 2);
//! assert_eq!(report.device_stats[0].visit_count, 1);
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{EngineError, OptionExt, Result};

// Configuration
pub mod config;
pub use config::{
    DuplicatePolicy, EngineConfig, FieldAliases, PayloadFilter, ReduceStrategy, TemporalConfig,
    WeightingConfig, WeightingMode,
};

// Record normalization (row -> TelemetryRecord)
pub mod normalize;
pub use normalize::{normalize_row, RawRow, RejectKind, RejectReason};

// Map workers (chunk -> PartialAggregate)
pub mod worker;
pub use worker::{map_chunk, map_source, split_rows, Chunk, MapOutput, Rejection};

// Reduce merger and global aggregate
pub mod aggregate;
pub use aggregate::{merge, reduce, reduce_sequential, reduce_tree, GlobalAggregate, PartialAggregate};

// Per-device temporal statistics
pub mod temporal;
pub use temporal::{DeviceTemporalStats, Interval, TemporalAnalyzer};

// Heatmap / density point sets
pub mod spatial;
pub use spatial::{point_cloud, SpatialWeightBuilder};

// Row sources (file ingestion collaborators)
pub mod source;
pub use source::{source_for_path, CsvSource, JsonLinesSource, MemorySource, RowSource};

// Run coordination
pub mod orchestrator;
pub use orchestrator::{ChunkFailure, Diagnostics, Orchestrator, RunReport, RunStatus};

// Synthetic fleet generator
#[cfg(feature = "synthetic")]
pub mod synthetic;

// ============================================================================
// Core Types
// ============================================================================

/// Identifies one unit of map work.
///
/// `source` is the index of the row source in the run's input list; `part` is
/// the index of the sub-chunk when a large source was split (0 otherwise).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ChunkId {
    pub source: u32,
    pub part: u32,
}

impl ChunkId {
    pub fn new(source: u32, part: u32) -> Self {
        Self { source, part }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.part)
    }
}

/// Where a record came from: source index and row index within that source.
///
/// Row indices are source-relative, so origins do not change when a source is
/// split into a different number of chunks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RecordOrigin {
    pub source: u32,
    pub row: u64,
}

impl RecordOrigin {
    pub fn new(source: u32, row: u64) -> Self {
        Self { source, row }
    }
}

/// Opaque auxiliary fields carried by a record.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// A validated telemetry record.
///
/// Only produced by [`normalize_row`]; coordinates are finite and in range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: Payload,
    pub origin: RecordOrigin,
}

impl TelemetryRecord {
    /// Primary ordering key within a device: time first, then provenance.
    pub fn sort_key(&self) -> (DateTime<Utc>, RecordOrigin) {
        (self.timestamp, self.origin)
    }

    /// Total order over records of one device: [`sort_key`](Self::sort_key),
    /// then content. `Equal` only for identical records.
    ///
    /// Origins come from whoever builds the chunks and may collide.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.device_id.cmp(&other.device_id))
            .then_with(|| self.latitude.total_cmp(&other.latitude))
            .then_with(|| self.longitude.total_cmp(&other.longitude))
            .then_with(|| {
                if self.payload == other.payload {
                    return Ordering::Equal;
                }
                let left = serde_json::to_string(&self.payload).unwrap_or_default();
                let right = serde_json::to_string(&other.payload).unwrap_or_default();
                left.cmp(&right)
            })
    }
}

/// A geographic coordinate annotated with a positive intensity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub weight: f64,
}

impl WeightedPoint {
    pub fn new(latitude: f64, longitude: f64, weight: f64) -> Self {
        Self {
            latitude,
            longitude,
            weight,
        }
    }

    /// Finite, geographically valid, strictly positive weight.
    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.latitude, self.longitude)
            && self.weight.is_finite()
            && self.weight > 0.0
    }
}

/// Check that a latitude/longitude pair is finite and within range.
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}
