//! Record normalization.
//!
//! Turns one untyped row into a [`TelemetryRecord`] or a [`RejectReason`].
//! Everything here is a pure function of its inputs and safe to call from any
//! number of workers at once.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::FieldAliases;
use crate::{is_valid_coordinate, Payload, RecordOrigin, TelemetryRecord};

/// One raw input row: column name to untyped value.
pub type RawRow = serde_json::Map<String, Value>;

/// Payload key holding a normalized duration in seconds.
pub const DURATION_KEY: &str = "duration_secs";

/// Naive date-time layouts accepted after RFC 3339, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Why a row was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("missing field `{field}`")]
    MissingField { field: String },

    #[error("`{field}` out of range: {value}")]
    OutOfRange { field: String, value: String },

    #[error("unparsable timestamp: {raw}")]
    UnparsableTimestamp { raw: String },

    #[error("malformed payload: {detail}")]
    MalformedPayload { detail: String },
}

/// Fieldless discriminant of [`RejectReason`], used for per-kind counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    MissingField,
    OutOfRange,
    UnparsableTimestamp,
    MalformedPayload,
}

impl RejectReason {
    pub fn kind(&self) -> RejectKind {
        match self {
            RejectReason::MissingField { .. } => RejectKind::MissingField,
            RejectReason::OutOfRange { .. } => RejectKind::OutOfRange,
            RejectReason::UnparsableTimestamp { .. } => RejectKind::UnparsableTimestamp,
            RejectReason::MalformedPayload { .. } => RejectKind::MalformedPayload,
        }
    }

    fn missing(field: &str) -> Self {
        RejectReason::MissingField {
            field: field.to_string(),
        }
    }
}

/// Validate and convert one raw row.
///
/// Field lookup follows `fields`: the first alias present with a non-null
/// value wins. Columns that are not core fields end up in the payload.
pub fn normalize_row(
    row: &RawRow,
    origin: RecordOrigin,
    fields: &FieldAliases,
) -> Result<TelemetryRecord, RejectReason> {
    let device_id = parse_device_id(lookup(row, &fields.device_id).ok_or_else(|| {
        RejectReason::missing("device_id")
    })?)?;

    let timestamp = parse_timestamp(
        lookup(row, &fields.timestamp).ok_or_else(|| RejectReason::missing("timestamp"))?,
    )?;

    let latitude = parse_coordinate(
        "latitude",
        lookup(row, &fields.latitude).ok_or_else(|| RejectReason::missing("latitude"))?,
    )?;
    let longitude = parse_coordinate(
        "longitude",
        lookup(row, &fields.longitude).ok_or_else(|| RejectReason::missing("longitude"))?,
    )?;

    if !is_valid_coordinate(latitude, longitude) {
        let (field, value) = if (-90.0..=90.0).contains(&latitude) {
            ("longitude", longitude)
        } else {
            ("latitude", latitude)
        };
        return Err(RejectReason::OutOfRange {
            field: field.to_string(),
            value: value.to_string(),
        });
    }

    let payload = build_payload(row, fields)?;

    Ok(TelemetryRecord {
        device_id,
        timestamp,
        latitude,
        longitude,
        payload,
        origin,
    })
}

fn lookup<'a>(row: &'a RawRow, aliases: &[String]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| row.get(alias))
        .find(|value| !value.is_null())
}

fn parse_device_id(value: &Value) -> Result<String, RejectReason> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
        _ => String::new(),
    };
    if id.is_empty() {
        return Err(RejectReason::missing("device_id"));
    }
    Ok(id)
}

/// Parse an absolute instant from a string or an epoch-seconds number.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, RejectReason> {
    let unparsable = || RejectReason::UnparsableTimestamp {
        raw: value.to_string(),
    };

    match value {
        Value::String(s) => parse_timestamp_str(s.trim()).ok_or_else(unparsable),
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0).ok_or_else(unparsable)
            } else {
                let secs = n.as_f64().filter(|s| s.is_finite()).ok_or_else(unparsable)?;
                DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
                    .ok_or_else(unparsable)
            }
        }
        _ => Err(unparsable()),
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn parse_coordinate(field: &str, value: &Value) -> Result<f64, RejectReason> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(RejectReason::OutOfRange {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

fn build_payload(row: &RawRow, fields: &FieldAliases) -> Result<Payload, RejectReason> {
    let mut payload = Payload::new();

    if let Some(nested) = row.get(&fields.payload) {
        match nested {
            Value::Object(map) => {
                payload.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Value::Null => {}
            other => {
                return Err(RejectReason::MalformedPayload {
                    detail: format!("`{}` must be an object, got {}", fields.payload, other),
                })
            }
        }
    }

    for (key, value) in row {
        if key == &fields.payload || fields.is_core(key) {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }

    // Duration columns are normalized to seconds under one key.
    let duration = fields
        .duration
        .iter()
        .find_map(|alias| payload.remove(alias).map(|v| (alias, v)));
    if let Some((alias, value)) = duration {
        if !value.is_null() {
            let secs = parse_duration_secs(&value).ok_or_else(|| RejectReason::MalformedPayload {
                detail: format!("`{alias}` is not a duration: {value}"),
            })?;
            payload.insert(DURATION_KEY.to_string(), Value::from(secs));
        }
    }

    Ok(payload)
}

/// Parse `H:MM:SS`, `H:MM`, or a non-negative number of seconds.
pub fn parse_duration_secs(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|s| s.is_finite() && *s >= 0.0),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<f64>() {
                return (secs.is_finite() && secs >= 0.0).then_some(secs);
            }
            let parts: Vec<&str> = s.split(':').collect();
            let (h, m, sec) = match parts.as_slice() {
                [h, m, sec] => (*h, *m, *sec),
                [h, m] => (*h, *m, "0"),
                _ => return None,
            };
            let h: u64 = h.parse().ok()?;
            let m: u64 = m.parse().ok()?;
            let sec: f64 = sec.parse().ok()?;
            if m >= 60 || !(0.0..60.0).contains(&sec) {
                return None;
            }
            let whole = h.checked_mul(3600)?.checked_add(m * 60)?;
            Some(whole as f64 + sec)
        }
        _ => None,
    }
}
