//! Tests for map workers

use fleettrace::worker::EXCERPT_CHARS;
use fleettrace::{map_chunk, map_source, split_rows, ChunkId, FieldAliases, RawRow, RejectKind};
use serde_json::json;

fn rows(n: usize) -> Vec<RawRow> {
    (0..n)
        .map(|i| {
            json!({
                "device_id": format!("d{}", i % 3),
                "timestamp": i as i64 * 10,
                "latitude": 10.0,
                "longitude": if i % 4 == 3 { 999.0 } else { 20.0 },
            })
            .as_object()
            .cloned()
            .unwrap()
        })
        .collect()
}

#[test]
fn test_split_rows_keeps_source_relative_indices() {
    let rows = rows(10);
    let chunks = split_rows(4, &rows, 4);

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2].id, ChunkId::new(4, 2));
    assert_eq!(chunks[2].first_row, 8);
    assert_eq!(chunks[2].rows.len(), 2);
}

#[test]
fn test_split_empty_source_yields_one_chunk() {
    let chunks = split_rows(0, &[], 100);
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].rows.is_empty());
}

#[test]
fn test_map_chunk_counts_and_rejections() {
    let rows = rows(8);
    let output = map_chunk(split_rows(1, &rows, 8)[0], &FieldAliases::default());

    assert_eq!(output.partial.record_count(), 6);
    assert_eq!(output.partial.rejected_count(), 2);
    assert_eq!(output.rejections.len(), 2);
    assert_eq!(output.rejections[0].row, 3);
    assert_eq!(output.rejections[1].row, 7);
    assert_eq!(output.rejections[0].reason.kind(), RejectKind::OutOfRange);
    assert_eq!(output.rejections[0].chunk_id, ChunkId::new(1, 0));

    let origin = output.partial.device("d0").unwrap()[0].origin;
    assert_eq!((origin.source, origin.row), (1, 0));
}

#[test]
fn test_empty_chunk_maps_to_empty_partial() {
    let output = map_chunk(split_rows(0, &[], 10)[0], &FieldAliases::default());
    assert!(output.partial.is_empty());
    assert!(output.rejections.is_empty());
}

#[test]
fn test_map_source_matches_single_chunk() {
    let rows = rows(25);
    let fields = FieldAliases::default();

    let outputs = map_source(0, &rows, 4, &fields);
    assert_eq!(outputs.len(), 7);
    assert!(outputs.windows(2).all(|w| w[0].chunk_id < w[1].chunk_id));

    let merged = outputs
        .into_iter()
        .map(|o| o.partial)
        .reduce(fleettrace::merge)
        .unwrap();
    let whole = map_chunk(split_rows(0, &rows, rows.len())[0], &fields).partial;
    assert_eq!(merged, whole);
}

#[test]
fn test_long_rows_are_truncated_in_excerpts() {
    let row = json!({"device_id": "x", "timestamp": "never", "note": "n".repeat(500)})
        .as_object()
        .cloned()
        .unwrap();
    let rows = vec![row];
    let output = map_chunk(split_rows(0, &rows, 1)[0], &FieldAliases::default());

    let excerpt = &output.rejections[0].excerpt;
    assert!(excerpt.ends_with("..."));
    assert_eq!(excerpt.chars().count(), EXCERPT_CHARS + 3);
}
