//! Synthetic fleet telemetry for stress testing and benchmarking.
//!
//! Generates device tracks as random walks around a depot, with regular
//! sampling, occasional idle stretches and a controlled share of defective
//! rows, so expected record and reject counts are known up front.
//!
//! Feature-gated behind `synthetic`.
//!
//! # Example
//!
//! ```rust
//! use fleettrace::synthetic::SyntheticFleet;
//!
//! let fleet = SyntheticFleet {
//!     device_count: 5,
//!     records_per_device: 20,
//!     ..SyntheticFleet::regina_depot()
//! };
//!
//! let dataset = fleet.generate();
//! assert_eq!(dataset.rows.len(), 100);
//! assert_eq!(dataset.valid_rows + dataset.invalid_rows, 100);
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use crate::normalize::RawRow;

/// Meters per degree of latitude (approximately constant).
const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// Scenario configuration for a generated fleet.
#[derive(Debug, Clone)]
pub struct SyntheticFleet {
    /// Depot (latitude, longitude) every device starts from.
    pub origin: (f64, f64),
    pub device_count: usize,
    pub records_per_device: usize,
    /// Seconds between consecutive samples while active.
    pub sample_interval_secs: i64,
    /// Probability that a sample is preceded by an idle stretch.
    pub idle_probability: f64,
    /// Length of an idle stretch in seconds.
    pub idle_secs: i64,
    /// Fraction of rows replaced by defective rows (0.0-1.0).
    pub invalid_fraction: f64,
    /// Largest step of the random walk in meters.
    pub max_step_meters: f64,
    /// Unix time of the first sample.
    pub start_epoch: i64,
    /// RNG seed for deterministic reproduction.
    pub seed: u64,
}

/// Generated rows with their ground truth.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub rows: Vec<RawRow>,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    pub device_ids: Vec<String>,
}

impl SyntheticDataset {
    /// Deal rows round-robin into `count` labelled chunks.
    pub fn into_chunks(self, count: usize) -> Vec<(String, Vec<RawRow>)> {
        let count = count.max(1);
        let mut chunks: Vec<(String, Vec<RawRow>)> = (0..count)
            .map(|i| (format!("synthetic-{i}"), Vec::new()))
            .collect();
        for (i, row) in self.rows.into_iter().enumerate() {
            chunks[i % count].1.push(row);
        }
        chunks
    }
}

impl SyntheticFleet {
    /// A mid-sized delivery fleet around Regina, SK.
    pub fn regina_depot() -> Self {
        Self {
            origin: (50.4452, -104.6189),
            device_count: 50,
            records_per_device: 200,
            sample_interval_secs: 30,
            idle_probability: 0.05,
            idle_secs: 3_600,
            invalid_fraction: 0.02,
            max_step_meters: 150.0,
            start_epoch: 1_704_103_200,
            seed: 42,
        }
    }

    pub fn generate(&self) -> SyntheticDataset {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut rows = Vec::with_capacity(self.device_count * self.records_per_device);
        let mut invalid_rows = 0;
        let device_ids: Vec<String> = (0..self.device_count)
            .map(|i| format!("unit-{i:04}"))
            .collect();

        for device_id in &device_ids {
            let (mut lat, mut lon) = self.origin;
            let mut t = self.start_epoch;

            for _ in 0..self.records_per_device {
                if rng.gen_bool(self.idle_probability.clamp(0.0, 1.0)) {
                    t += self.idle_secs;
                }
                t += self.sample_interval_secs;

                let step = self.max_step_meters / METERS_PER_DEG_LAT;
                lat = (lat + rng.gen_range(-step..=step)).clamp(-89.0, 89.0);
                lon = (lon + rng.gen_range(-step..=step)).clamp(-179.0, 179.0);

                let row = if rng.gen_bool(self.invalid_fraction.clamp(0.0, 1.0)) {
                    invalid_rows += 1;
                    defective_row(&mut rng, device_id, t)
                } else {
                    row_from(json!({
                        "device_id": device_id,
                        "timestamp": t,
                        "latitude": lat,
                        "longitude": lon,
                        "Status": if rng.gen_bool(0.8) { "Driving" } else { "Stopped" },
                        "Duration": format_duration(rng.gen_range(0..7_200)),
                    }))
                };
                rows.push(row);
            }
        }

        SyntheticDataset {
            valid_rows: rows.len() - invalid_rows,
            invalid_rows,
            rows,
            device_ids,
        }
    }
}

fn row_from(value: Value) -> RawRow {
    match value {
        Value::Object(map) => map,
        _ => RawRow::new(),
    }
}

fn format_duration(secs: u32) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// One of the four defect kinds the normalizer must reject.
fn defective_row(rng: &mut StdRng, device_id: &str, t: i64) -> RawRow {
    match rng.gen_range(0..4) {
        0 => row_from(json!({
            "device_id": device_id, "timestamp": t, "latitude": 200.0, "longitude": 0.0,
        })),
        1 => row_from(json!({ "timestamp": t, "latitude": 10.0, "longitude": 10.0 })),
        2 => row_from(json!({
            "device_id": device_id, "timestamp": "not a time", "latitude": 10.0, "longitude": 10.0,
        })),
        _ => row_from(json!({
            "device_id": device_id, "timestamp": t, "latitude": 10.0, "longitude": 10.0,
            "Duration": "soon",
        })),
    }
}

// ============================================================================
// Tests
// ============================================================================
