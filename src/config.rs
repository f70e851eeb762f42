//! Engine configuration.
//!
//! All structs deserialize with `#[serde(default)]` so a JSON config file only
//! needs to carry the values it changes. The one exception to "has a default"
//! is `max_gap`: the activity threshold is domain specific and must always be
//! supplied, so [`EngineConfig::validate`] rejects a config without it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, OptionExt, Result};
use crate::TelemetryRecord;

/// Largest supported zone precision (decimal places, ~0.1m at 6).
pub const MAX_ZONE_PRECISION: u32 = 6;

/// How the reduce phase combines partial aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceStrategy {
    /// Pairwise tree reduction (logarithmic depth, halves reduced in parallel).
    #[default]
    Tree,
    /// Left fold over partials in chunk order.
    Sequential,
}

/// What to do with several records sharing `(device_id, timestamp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the record with the smallest origin (source index, then row index).
    #[default]
    KeepFirst,
    /// Drop every record of a colliding key and count them as rejected.
    Reject,
}

/// Weighting scheme for the heatmap point set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMode {
    /// Every record contributes weight 1 (visit density).
    #[default]
    PerRecord,
    /// Every record of a device is weighted by the device's dwell seconds.
    DeviceDwell,
    /// Every record of a device is weighted by the device's visit count.
    DeviceVisits,
    /// One point per rounded lat/lon zone, weighted by records in the zone.
    Zone { precision: u32 },
}

impl WeightingMode {
    /// Whether this mode needs per-device temporal statistics.
    pub fn needs_device_stats(&self) -> bool {
        matches!(self, WeightingMode::DeviceDwell | WeightingMode::DeviceVisits)
    }
}

/// Configuration for the spatial weight builder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    pub mode: WeightingMode,
    /// Scale weights by the maximum weight so they fall in (0, 1].
    pub normalize: bool,
    /// Zone mode only: drop zones whose record count exceeds this quantile
    /// of all zone counts. Must be in (0, 1].
    pub crossover_quantile: Option<f64>,
    /// Only records matching this filter become points.
    pub include: Option<PayloadFilter>,
}

/// Selects records by one payload value, e.g. `Status` in `["Driving"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFilter {
    pub field: String,
    pub values: Vec<String>,
}

impl PayloadFilter {
    pub fn new(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// A record matches when its payload value for `field` equals one of
    /// `values`. Non-string values compare by their JSON text.
    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        match record.payload.get(&self.field) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => self.values.iter().any(|v| v == s),
            Some(other) => {
                let text = other.to_string();
                self.values.iter().any(|v| *v == text)
            }
        }
    }
}

/// Configuration for the temporal analyzer.
///
/// There is no `Default`: callers must choose `max_gap` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Largest gap between consecutive records that still counts as activity.
    #[serde(with = "humantime_serde")]
    pub max_gap: Duration,
}

impl TemporalConfig {
    pub fn new(max_gap: Duration) -> Result<Self> {
        if max_gap.is_zero() {
            return Err(EngineError::config("max_gap", "must be positive"));
        }
        Ok(Self { max_gap })
    }
}

/// Column names accepted for each core field, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldAliases {
    pub device_id: Vec<String>,
    pub timestamp: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    /// Optional duration column, normalized into `duration_secs`.
    pub duration: Vec<String>,
    /// Column holding a nested payload object.
    pub payload: String,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            device_id: names(&["device_id", "device", "vehicle", "Vehicle"]),
            timestamp: names(&["timestamp", "time", "Time"]),
            latitude: names(&["latitude", "lat", "Lat"]),
            longitude: names(&["longitude", "lon", "lng", "Lon"]),
            duration: names(&["duration", "Duration"]),
            payload: "payload".to_string(),
        }
    }
}

impl FieldAliases {
    /// Whether `key` names one of the core fields (not payload).
    pub fn is_core(&self, key: &str) -> bool {
        [&self.device_id, &self.timestamp, &self.latitude, &self.longitude]
            .iter()
            .any(|aliases| aliases.iter().any(|a| a == key))
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads in the map pool. 0 = one per available core.
    pub workers: usize,
    /// Sources with more rows are split into chunks of at most this size.
    /// Default: 50_000
    pub max_rows_per_chunk: usize,
    pub reduce_strategy: ReduceStrategy,
    pub duplicate_policy: DuplicatePolicy,
    /// Required activity threshold (e.g. "5m" in JSON).
    #[serde(with = "humantime_serde")]
    pub max_gap: Option<Duration>,
    /// Upper bound on waiting for map workers. None = wait for all.
    #[serde(with = "humantime_serde")]
    pub run_timeout: Option<Duration>,
    pub weighting: WeightingConfig,
    pub fields: FieldAliases,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_rows_per_chunk: 50_000,
            reduce_strategy: ReduceStrategy::Tree,
            duplicate_policy: DuplicatePolicy::KeepFirst,
            max_gap: None,
            run_timeout: None,
            weighting: WeightingConfig::default(),
            fields: FieldAliases::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration with the given activity threshold.
    pub fn with_max_gap(max_gap: Duration) -> Self {
        Self {
            max_gap: Some(max_gap),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The temporal analyzer configuration, failing if `max_gap` is unset.
    pub fn temporal(&self) -> Result<TemporalConfig> {
        TemporalConfig::new(self.max_gap.ok_or_config("max_gap")?)
    }

    /// Check every parameter. Called before any work is dispatched.
    pub fn validate(&self) -> Result<()> {
        self.temporal()?;

        if self.max_rows_per_chunk == 0 {
            return Err(EngineError::config("max_rows_per_chunk", "must be at least 1"));
        }
        if self.run_timeout.is_some_and(|t| t.is_zero()) {
            return Err(EngineError::config("run_timeout", "must be positive when set"));
        }

        if let WeightingMode::Zone { precision } = self.weighting.mode {
            if precision > MAX_ZONE_PRECISION {
                return Err(EngineError::config(
                    "weighting.mode.zone.precision",
                    format!("must be at most {MAX_ZONE_PRECISION}, got {precision}"),
                ));
            }
        }
        if let Some(q) = self.weighting.crossover_quantile {
            if !(q > 0.0 && q <= 1.0) {
                return Err(EngineError::config(
                    "weighting.crossover_quantile",
                    format!("must be in (0, 1], got {q}"),
                ));
            }
        }
        if let Some(filter) = &self.weighting.include {
            if filter.field.is_empty() {
                return Err(EngineError::config("weighting.include.field", "must not be empty"));
            }
            if filter.values.is_empty() {
                return Err(EngineError::config(
                    "weighting.include.values",
                    "needs at least one value",
                ));
            }
        }

        let fields = &self.fields;
        for (name, aliases) in [
            ("fields.device_id", &fields.device_id),
            ("fields.timestamp", &fields.timestamp),
            ("fields.latitude", &fields.latitude),
            ("fields.longitude", &fields.longitude),
        ] {
            if aliases.is_empty() {
                return Err(EngineError::config(name, "needs at least one column name"));
            }
        }

        Ok(())
    }
}
