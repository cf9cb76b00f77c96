//! Record I/O shared by every stage.
//!
//! A [`Record`] is one artifact as an ordered JSON object. Stages read and
//! write either CSV (header row, one record per line) or JSON (array of
//! objects), chosen by file extension. Key order is preserved so captions
//! built from record fields come out in column order.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(Format::Csv),
            Some("json") => Ok(Format::Json),
            _ => bail!(
                "Unsupported record file: {} (expected .csv or .json)",
                path.display()
            ),
        }
    }
}

pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    match Format::from_path(path)? {
        Format::Csv => read_csv(path),
        Format::Json => read_json(path),
    }
}

pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    match Format::from_path(path)? {
        Format::Csv => write_csv(path, records),
        Format::Json => write_json(path, &records),
    }
}

fn read_csv(path: &Path) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV: {}", path.display()))?;
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("{}: malformed row {}", path.display(), line + 2))?;
        let mut record = Record::new();
        for (key, cell) in headers.iter().zip(row.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            record.insert(key.to_string(), value);
        }
        records.push(record);
    }
    Ok(records)
}

fn read_json(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON: {}", path.display()))?;

    let Value::Array(items) = value else {
        bail!("{}: expected a JSON array of objects", path.display());
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => bail!(
                "{}: element {} is not an object (found {})",
                path.display(),
                i,
                type_name(&other)
            ),
        })
        .collect()
}

fn write_csv(path: &Path, records: &[Record]) -> Result<()> {
    ensure_parent(path)?;

    let mut header: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !header.contains(&key.as_str()) {
                header.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    if !header.is_empty() {
        writer.write_record(&header)?;
    }
    for record in records {
        let row: Vec<String> = header
            .iter()
            .map(|key| {
                record
                    .get(*key)
                    .and_then(value_text)
                    .unwrap_or_default()
            })
            .collect();
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write any serializable value as pretty JSON, creating parent dirs.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Plain-text rendering of a field value.
///
/// Strings come back unquoted; numbers and booleans use their JSON text.
/// `null` has no text.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Non-blank string text of `record[field]`.
pub fn field_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Final component of a `/`-separated record path.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
