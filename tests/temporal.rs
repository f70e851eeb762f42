//! Tests for temporal analysis

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleettrace::{
    DeviceTemporalStats, DuplicatePolicy, EngineConfig, EngineError, GlobalAggregate, Interval,
    PartialAggregate, RecordOrigin, TelemetryRecord, TemporalAnalyzer, TemporalConfig,
};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn record(device: &str, secs: i64, row: u64) -> TelemetryRecord {
    TelemetryRecord {
        device_id: device.to_string(),
        timestamp: at(secs),
        latitude: 50.0,
        longitude: -104.0,
        payload: Default::default(),
        origin: RecordOrigin::new(0, row),
    }
}

fn aggregate(records: Vec<TelemetryRecord>) -> GlobalAggregate {
    GlobalAggregate::finalize(
        PartialAggregate::from_records(records, 0),
        DuplicatePolicy::KeepFirst,
    )
    .unwrap()
}

fn analyzer(max_gap_secs: u64) -> TemporalAnalyzer {
    TemporalAnalyzer::with_max_gap(Duration::from_secs(max_gap_secs)).unwrap()
}

fn secs(intervals: &[Interval]) -> Vec<(i64, i64)> {
    intervals
        .iter()
        .map(|i| (i.start.timestamp(), i.end.timestamp()))
        .collect()
}

/// Activity and idle intervals alternate and cover [first_seen, last_seen].
fn assert_tiles(stats: &DeviceTemporalStats) {
    let (Some(first), Some(last)) = (stats.first_seen, stats.last_seen) else {
        assert!(stats.activity_intervals.is_empty());
        return;
    };
    assert_eq!(
        stats.activity_intervals.len(),
        stats.idle_intervals.len() + 1,
        "{}",
        stats.device_id
    );

    let mut cursor = first;
    for (i, activity) in stats.activity_intervals.iter().enumerate() {
        assert_eq!(activity.start, cursor);
        assert!(activity.start <= activity.end);
        cursor = activity.end;
        if let Some(idle) = stats.idle_intervals.get(i) {
            assert_eq!(idle.start, cursor);
            assert!(idle.start < idle.end);
            cursor = idle.end;
        }
    }
    assert_eq!(cursor, last);
    assert_eq!(
        stats.total_dwell_time + stats.total_idle_time,
        (last - first).to_std().unwrap()
    );
}

#[test]
fn test_gap_splits_activity() {
    // Records at 0, 5, 10 with max_gap 3: every gap is idle.
    let agg = aggregate(vec![record("A", 0, 0), record("A", 5, 1), record("A", 10, 2)]);
    let stats = analyzer(3).analyze(&agg);

    assert_eq!(stats.len(), 1);
    let a = &stats[0];
    assert_eq!(a.device_id, "A");
    assert_eq!(a.record_count, 3);
    assert_eq!(secs(&a.activity_intervals), vec![(0, 0), (5, 5), (10, 10)]);
    assert_eq!(secs(&a.idle_intervals), vec![(0, 5), (5, 10)]);
    assert_eq!(a.visit_count, 3);
    assert_eq!(a.total_dwell_time, Duration::ZERO);
    assert_eq!(a.total_idle_time, Duration::from_secs(10));
    assert_tiles(a);
}

#[test]
fn test_gap_equal_to_max_gap_is_activity() {
    let agg = aggregate(vec![
        record("A", 0, 0),
        record("A", 3, 1),
        record("A", 6, 2),
        record("A", 20, 3),
        record("A", 22, 4),
    ]);
    let a = &analyzer(3).analyze(&agg)[0];

    assert_eq!(secs(&a.activity_intervals), vec![(0, 6), (20, 22)]);
    assert_eq!(secs(&a.idle_intervals), vec![(6, 20)]);
    assert_eq!(a.visit_count, 2);
    assert_eq!(a.total_dwell_time, Duration::from_secs(8));
    assert_eq!(a.total_idle_time, Duration::from_secs(14));
    assert_tiles(a);
}

#[test]
fn test_single_record_device() {
    let agg = aggregate(vec![record("solo", 42, 0)]);
    let a = &analyzer(60).analyze(&agg)[0];

    assert_eq!(secs(&a.activity_intervals), vec![(42, 42)]);
    assert!(a.idle_intervals.is_empty());
    assert_eq!(a.visit_count, 1);
    assert_eq!(a.total_dwell_time, Duration::ZERO);
    assert_eq!(a.first_seen, Some(at(42)));
    assert_eq!(a.last_seen, Some(at(42)));
}

#[test]
fn test_empty_device_sequence() {
    let stats = analyzer(60).analyze_device("ghost", &[]);

    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.visit_count, 0);
    assert!(stats.first_seen.is_none());
    assert!(stats.activity_intervals.is_empty());
    assert_eq!(stats.total_dwell_time, Duration::ZERO);
}

#[test]
fn test_empty_aggregate() {
    let agg = aggregate(Vec::new());
    assert!(analyzer(60).analyze(&agg).is_empty());
}

#[test]
fn test_devices_reported_in_id_order() {
    let agg = aggregate(vec![
        record("zulu", 1, 0),
        record("alpha", 2, 1),
        record("mike", 3, 2),
    ]);
    let ids: Vec<String> = analyzer(60)
        .analyze(&agg)
        .into_iter()
        .map(|s| s.device_id)
        .collect();
    assert_eq!(ids, vec!["alpha", "mike", "zulu"]);
}

#[test]
fn test_analysis_is_idempotent() {
    let records: Vec<_> = (0..200)
        .map(|i| {
            let device = ["a", "b", "c"][i % 3];
            let t = (i as i64) * 37 + if i % 17 == 0 { 5_000 } else { 0 };
            record(device, t, i as u64)
        })
        .collect();
    let agg = aggregate(records);
    let analyzer = analyzer(120);

    let first = analyzer.analyze(&agg);
    let second = analyzer.analyze(&agg);
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    for stats in &first {
        assert_tiles(stats);
    }
    let total: usize = first.iter().map(|s| s.record_count).sum();
    assert_eq!(total, agg.record_count());
}

#[test]
fn test_dwell_sum_matches_activity_intervals() {
    let agg = aggregate(vec![
        record("A", 0, 0),
        record("A", 60, 1),
        record("A", 120, 2),
        record("A", 4_000, 3),
        record("A", 4_030, 4),
    ]);
    let a = &analyzer(300).analyze(&agg)[0];

    let summed: Duration = a.activity_intervals.iter().map(Interval::duration).sum();
    assert_eq!(a.total_dwell_time, summed);
    assert_eq!(a.total_dwell_time, Duration::from_secs(150));
    assert_eq!(a.dwell_seconds(), 150.0);
}

#[test]
fn test_zero_max_gap_is_configuration_error() {
    let err = TemporalConfig::new(Duration::ZERO).unwrap_err();
    assert!(matches!(err, EngineError::Configuration { ref parameter, .. } if parameter == "max_gap"));

    assert!(TemporalAnalyzer::with_max_gap(Duration::ZERO).is_err());
}

#[test]
fn test_missing_max_gap_is_configuration_error() {
    let config = EngineConfig::default();
    let err = config.temporal().unwrap_err();
    assert!(err.to_string().contains("max_gap"));
}

#[test]
fn test_stats_serialize_durations_humanized() {
    let agg = aggregate(vec![record("A", 0, 0), record("A", 90, 1)]);
    let stats = analyzer(300).analyze(&agg);
    let json = serde_json::to_value(&stats[0]).unwrap();

    assert_eq!(json["total_dwell_time"], "1m 30s");
    assert_eq!(json["visit_count"], 1);
}
