//! Row sources: the ingestion collaborators that feed the map workers.
//!
//! A source hands over all of its rows as one unit. The engine makes no
//! assumption about ordering across sources.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::normalize::RawRow;

/// Key under which a non-object JSON line is preserved.
pub const RAW_LINE_KEY: &str = "_raw";

/// Supplies the raw rows of one input unit (typically one file).
///
/// Sources are shared with pool threads, so they must be `Send + Sync`.
pub trait RowSource: Send + Sync {
    /// Human-readable name used in diagnostics.
    fn label(&self) -> String;

    /// Read every row. An error fails this source only, not the run.
    fn read_rows(&self) -> Result<Vec<RawRow>>;
}

/// Rows already in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    label: String,
    rows: Vec<RawRow>,
}

impl MemorySource {
    pub fn new(label: impl Into<String>, rows: Vec<RawRow>) -> Self {
        Self {
            label: label.into(),
            rows,
        }
    }
}

impl RowSource for MemorySource {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn read_rows(&self) -> Result<Vec<RawRow>> {
        Ok(self.rows.clone())
    }
}

fn unreadable(path: &Path, reason: impl ToString) -> EngineError {
    EngineError::SourceUnreadable {
        source_label: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Newline-delimited JSON objects.
///
/// Blank lines are skipped. A line that is not a JSON object becomes a row
/// holding the raw text under [`RAW_LINE_KEY`], which the normalizer rejects,
/// so one bad line never fails the whole file.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RowSource for JsonLinesSource {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn read_rows(&self) -> Result<Vec<RawRow>> {
        let file = File::open(&self.path).map_err(|e| unreadable(&self.path, e))?;
        let mut rows = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| unreadable(&self.path, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => rows.push(map),
                _ => {
                    let mut row = RawRow::new();
                    row.insert(RAW_LINE_KEY.to_string(), Value::String(line));
                    rows.push(row);
                }
            }
        }

        Ok(rows)
    }
}

/// Delimited text with a header row. Empty cells become `null`.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

impl RowSource for CsvSource {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn read_rows(&self) -> Result<Vec<RawRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| unreadable(&self.path, e))?;

        let headers = reader
            .headers()
            .map_err(|e| unreadable(&self.path, e))?
            .clone();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| unreadable(&self.path, e))?;
            let row: RawRow = headers
                .iter()
                .zip(record.iter())
                .map(|(name, cell)| {
                    let cell = cell.trim();
                    let value = if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    };
                    (name.to_string(), value)
                })
                .collect();
            rows.push(row);
        }

        Ok(rows)
    }
}

/// Pick a source implementation from the file extension.
pub fn source_for_path(path: &Path) -> Result<Box<dyn RowSource>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("jsonl") | Some("ndjson") | Some("json") => Ok(Box::new(JsonLinesSource::new(path))),
        Some("csv") => Ok(Box::new(CsvSource::new(path))),
        Some("tsv") => Ok(Box::new(CsvSource::new(path).with_delimiter(b'\t'))),
        _ => Err(EngineError::config(
            "input",
            format!("unsupported file type: {}", path.display()),
        )),
    }
}
