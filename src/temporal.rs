//! Per-device temporal statistics.
//!
//! Each device's time-sorted records are cut into activity intervals wherever
//! the gap between consecutive records exceeds `max_gap`; the gaps become idle
//! intervals. Activity and idle intervals alternate and exactly tile the span
//! from the first to the last record.
//!
//! Stats are always recomputed from a [`GlobalAggregate`], never patched.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::aggregate::GlobalAggregate;
use crate::config::TemporalConfig;
use crate::error::{EngineError, Result};
use crate::TelemetryRecord;

/// A closed time interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

/// Derived statistics for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTemporalStats {
    pub device_id: String,
    pub record_count: usize,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub activity_intervals: Vec<Interval>,
    pub idle_intervals: Vec<Interval>,
    #[serde(with = "humantime_serde")]
    pub total_dwell_time: Duration,
    #[serde(with = "humantime_serde")]
    pub total_idle_time: Duration,
    pub visit_count: usize,
}

impl DeviceTemporalStats {
    pub fn dwell_seconds(&self) -> f64 {
        self.total_dwell_time.as_secs_f64()
    }
}

/// Segments device timelines into activity and idle intervals.
#[derive(Debug, Clone, Copy)]
pub struct TemporalAnalyzer {
    max_gap: TimeDelta,
}

impl TemporalAnalyzer {
    pub fn new(config: TemporalConfig) -> Result<Self> {
        let max_gap = TimeDelta::from_std(config.max_gap)
            .map_err(|e| EngineError::config("max_gap", e.to_string()))?;
        if max_gap <= TimeDelta::zero() {
            return Err(EngineError::config("max_gap", "must be positive"));
        }
        Ok(Self { max_gap })
    }

    /// Shorthand for `TemporalAnalyzer::new(TemporalConfig::new(max_gap)?)`.
    pub fn with_max_gap(max_gap: Duration) -> Result<Self> {
        Self::new(TemporalConfig::new(max_gap)?)
    }

    pub fn max_gap(&self) -> TimeDelta {
        self.max_gap
    }

    /// Stats for every device, in device-id order.
    pub fn analyze(&self, aggregate: &GlobalAggregate) -> Vec<DeviceTemporalStats> {
        let devices: Vec<(&str, &[TelemetryRecord])> = aggregate.devices().collect();

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            devices
                .par_iter()
                .map(|(id, records)| self.analyze_device(id, records))
                .collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            devices
                .iter()
                .map(|(id, records)| self.analyze_device(id, records))
                .collect()
        }
    }

    /// Stats for one device from its time-sorted records.
    pub fn analyze_device(
        &self,
        device_id: &str,
        records: &[TelemetryRecord],
    ) -> DeviceTemporalStats {
        let mut activity_intervals = Vec::new();
        let mut idle_intervals = Vec::new();

        if let Some(first) = records.first() {
            let mut start = first.timestamp;
            let mut previous = first.timestamp;

            for record in &records[1..] {
                let current = record.timestamp;
                if current - previous > self.max_gap {
                    activity_intervals.push(Interval::new(start, previous));
                    idle_intervals.push(Interval::new(previous, current));
                    start = current;
                }
                previous = current;
            }
            activity_intervals.push(Interval::new(start, previous));
        }

        let total_dwell_time = activity_intervals.iter().map(Interval::duration).sum();
        let total_idle_time = idle_intervals.iter().map(Interval::duration).sum();

        DeviceTemporalStats {
            device_id: device_id.to_string(),
            record_count: records.len(),
            first_seen: records.first().map(|r| r.timestamp),
            last_seen: records.last().map(|r| r.timestamp),
            visit_count: activity_intervals.len(),
            activity_intervals,
            idle_intervals,
            total_dwell_time,
            total_idle_time,
        }
    }
}
