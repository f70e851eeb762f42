//! Weighted point sets for heatmap rendering and density estimation.
//!
//! The builder is a projection of a [`GlobalAggregate`]: it never bins points
//! spatially except in zone mode, and device weights come from the
//! [`TemporalAnalyzer`] rather than being recomputed here. An optional
//! [`PayloadFilter`] restricts which records become points; device weights
//! still come from every record of the device.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::aggregate::GlobalAggregate;
use crate::config::{PayloadFilter, WeightingConfig, WeightingMode};
use crate::temporal::{DeviceTemporalStats, TemporalAnalyzer};
use crate::{TelemetryRecord, WeightedPoint};

/// Zone key: latitude and longitude scaled by 10^precision and rounded half
/// to even.
type ZoneKey = (i64, i64);

/// Builds [`WeightedPoint`]s according to a [`WeightingConfig`].
#[derive(Debug, Clone)]
pub struct SpatialWeightBuilder {
    config: WeightingConfig,
}

impl SpatialWeightBuilder {
    pub fn new(config: WeightingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WeightingConfig {
        &self.config
    }

    /// Build the point set, running `analyzer` first when the mode needs
    /// per-device stats.
    pub fn build(
        &self,
        aggregate: &GlobalAggregate,
        analyzer: &TemporalAnalyzer,
    ) -> Vec<WeightedPoint> {
        if self.config.mode.needs_device_stats() {
            let stats = analyzer.analyze(aggregate);
            self.build_with_stats(aggregate, &stats)
        } else {
            self.build_with_stats(aggregate, &[])
        }
    }

    /// Build the point set from already computed device stats.
    ///
    /// `stats` is only consulted by the device-weighted modes; devices missing
    /// from it contribute no points.
    pub fn build_with_stats(
        &self,
        aggregate: &GlobalAggregate,
        stats: &[DeviceTemporalStats],
    ) -> Vec<WeightedPoint> {
        let include = self.config.include.as_ref();
        let mut points = match self.config.mode {
            WeightingMode::PerRecord => aggregate
                .records()
                .filter(|r| included(include, r))
                .map(|r| WeightedPoint::new(r.latitude, r.longitude, 1.0))
                .collect(),
            WeightingMode::DeviceDwell => {
                device_weighted(aggregate, stats, include, DeviceTemporalStats::dwell_seconds)
            }
            WeightingMode::DeviceVisits => {
                device_weighted(aggregate, stats, include, |s| s.visit_count as f64)
            }
            WeightingMode::Zone { precision } => {
                zone_points(aggregate, include, precision, self.config.crossover_quantile)
            }
        };

        if self.config.normalize {
            normalize_weights(&mut points);
        }

        debug_assert!(points.iter().all(WeightedPoint::is_valid));
        points
    }

    /// Unweighted coordinates of the records this builder would include.
    pub fn point_cloud(&self, aggregate: &GlobalAggregate) -> Vec<(f64, f64)> {
        let include = self.config.include.as_ref();
        aggregate
            .records()
            .filter(|r| included(include, r))
            .map(|r| (r.latitude, r.longitude))
            .collect()
    }
}

fn included(filter: Option<&PayloadFilter>, record: &TelemetryRecord) -> bool {
    filter.map_or(true, |f| f.matches(record))
}

/// Unweighted coordinates of every record, for density estimation.
pub fn point_cloud(aggregate: &GlobalAggregate) -> Vec<(f64, f64)> {
    aggregate
        .records()
        .map(|r| (r.latitude, r.longitude))
        .collect()
}

fn device_weighted(
    aggregate: &GlobalAggregate,
    stats: &[DeviceTemporalStats],
    include: Option<&PayloadFilter>,
    weight_of: impl Fn(&DeviceTemporalStats) -> f64,
) -> Vec<WeightedPoint> {
    let weights: HashMap<&str, f64> = stats
        .iter()
        .map(|s| (s.device_id.as_str(), weight_of(s)))
        .collect();

    let mut points = Vec::with_capacity(aggregate.record_count());
    for (device_id, records) in aggregate.devices() {
        match weights.get(device_id) {
            Some(&weight) if weight.is_finite() && weight > 0.0 => {
                points.extend(
                    records
                        .iter()
                        .filter(|r| included(include, r))
                        .map(|r| WeightedPoint::new(r.latitude, r.longitude, weight)),
                );
            }
            _ => debug!(
                "[Spatial] {} has no positive weight, {} records skipped",
                device_id,
                records.len()
            ),
        }
    }
    points
}

fn zone_key(latitude: f64, longitude: f64, scale: f64) -> ZoneKey {
    (
        (latitude * scale).round_ties_even() as i64,
        (longitude * scale).round_ties_even() as i64,
    )
}

fn zone_points(
    aggregate: &GlobalAggregate,
    include: Option<&PayloadFilter>,
    precision: u32,
    crossover_quantile: Option<f64>,
) -> Vec<WeightedPoint> {
    let scale = 10f64.powi(precision as i32);

    let mut crossover: BTreeMap<ZoneKey, u64> = BTreeMap::new();
    for record in aggregate.records().filter(|r| included(include, r)) {
        *crossover
            .entry(zone_key(record.latitude, record.longitude, scale))
            .or_insert(0) += 1;
    }

    let cap = crossover_quantile.and_then(|q| {
        let counts: Vec<f64> = crossover.values().map(|&c| c as f64).collect();
        quantile(&counts, q)
    });

    let points: Vec<WeightedPoint> = crossover
        .into_iter()
        .filter(|&(_, count)| cap.map_or(true, |cap| count as f64 <= cap))
        .map(|((lat, lon), count)| {
            WeightedPoint::new(lat as f64 / scale, lon as f64 / scale, count as f64)
        })
        .collect();

    debug!(
        "[Spatial] {} zones at precision {} (cap {:?})",
        points.len(),
        precision,
        cap
    );
    points
}

/// Linear-interpolated quantile of `values`, `q` in [0, 1].
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

fn normalize_weights(points: &mut [WeightedPoint]) {
    let max = points.iter().map(|p| p.weight).fold(0.0_f64, f64::max);
    if max > 0.0 {
        for point in points.iter_mut() {
            point.weight /= max;
        }
    }
}
