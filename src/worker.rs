//! Map workers.
//!
//! A worker takes one chunk of raw rows, normalizes each row and groups the
//! accepted records per device. It touches nothing but its own chunk and
//! returns a freshly owned [`PartialAggregate`] plus the rows it rejected.

use serde::Serialize;

use crate::aggregate::PartialAggregate;
use crate::config::FieldAliases;
use crate::normalize::{normalize_row, RawRow, RejectReason};
use crate::{ChunkId, RecordOrigin};

/// Longest row excerpt kept in diagnostics, in characters.
pub const EXCERPT_CHARS: usize = 160;

/// A slice of one source's rows.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub id: ChunkId,
    /// Source-relative index of `rows[0]`.
    pub first_row: u64,
    pub rows: &'a [RawRow],
}

/// A row the normalizer refused, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub chunk_id: ChunkId,
    /// Source-relative row index.
    pub row: u64,
    pub reason: RejectReason,
    pub excerpt: String,
}

/// What one map worker hands back.
#[derive(Debug, Clone)]
pub struct MapOutput {
    pub chunk_id: ChunkId,
    pub partial: PartialAggregate,
    pub rejections: Vec<Rejection>,
}

/// Split a source's rows into chunks of at most `max_rows` rows.
///
/// An empty source still yields one (empty) chunk so every source is
/// represented in the reduction.
pub fn split_rows(source: u32, rows: &[RawRow], max_rows: usize) -> Vec<Chunk<'_>> {
    let max_rows = max_rows.max(1);
    if rows.is_empty() {
        return vec![Chunk {
            id: ChunkId::new(source, 0),
            first_row: 0,
            rows,
        }];
    }

    rows.chunks(max_rows)
        .enumerate()
        .map(|(part, slice)| Chunk {
            id: ChunkId::new(source, part as u32),
            first_row: (part * max_rows) as u64,
            rows: slice,
        })
        .collect()
}

/// Normalize and group one chunk.
pub fn map_chunk(chunk: Chunk<'_>, fields: &FieldAliases) -> MapOutput {
    let mut accepted = Vec::with_capacity(chunk.rows.len());
    let mut rejections = Vec::new();

    for (offset, row) in chunk.rows.iter().enumerate() {
        let row_index = chunk.first_row + offset as u64;
        let origin = RecordOrigin::new(chunk.id.source, row_index);

        match normalize_row(row, origin, fields) {
            Ok(record) => accepted.push(record),
            Err(reason) => rejections.push(Rejection {
                chunk_id: chunk.id,
                row: row_index,
                reason,
                excerpt: excerpt(row),
            }),
        }
    }

    MapOutput {
        chunk_id: chunk.id,
        partial: PartialAggregate::from_records(accepted, rejections.len()),
        rejections,
    }
}

/// Map every chunk of one source.
///
/// With the `parallel` feature the chunks are mapped on the current rayon
/// pool; outputs are returned in chunk order either way.
pub fn map_source(
    source: u32,
    rows: &[RawRow],
    max_rows: usize,
    fields: &FieldAliases,
) -> Vec<MapOutput> {
    let chunks = split_rows(source, rows, max_rows);

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        chunks
            .into_par_iter()
            .map(|chunk| map_chunk(chunk, fields))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        chunks
            .into_iter()
            .map(|chunk| map_chunk(chunk, fields))
            .collect()
    }
}

fn excerpt(row: &RawRow) -> String {
    let text = serde_json::to_string(row).unwrap_or_else(|_| format!("{row:?}"));
    if text.chars().count() <= EXCERPT_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}
