//! Caption flattening: collapse the sparse descriptive fields of a record
//! into a single `captions` string next to its `filename`.
//!
//! The transform is one-way. Output records have the shape
//! `{"filename": ..., "captions": ...}` (plus any field whose text was the
//! literal `none`, which is left alone). Feeding flattened output back in is
//! a no-op; feeding a record that mixes `captions` with raw fields is an
//! error rather than a silent re-split.

use anyhow::{Context, Result};
use serde_json::Value;
use thiserror::Error;

use crate::config::FlattenConfig;
use crate::outcome::{skipped_path_for, Outcome, SkipReason};
use crate::records::{read_records, value_text, write_records, Record};

const STAGE: &str = "flatten";
pub const FILENAME_FIELD: &str = "filename";
pub const CAPTIONS_FIELD: &str = "captions";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlattenError {
    #[error("record {index} already has `captions` alongside raw fields {fields:?}; refusing to flatten it again")]
    AlreadyFlattened { index: usize, fields: Vec<String> },
}

/// Field text that flattening leaves in place instead of merging.
fn is_none_text(value: &Value) -> bool {
    value_text(value).is_some_and(|text| text.trim().eq_ignore_ascii_case("none"))
}

/// True when `record` only carries the flattened schema: `captions`,
/// `filename` and any leftover `none` fields.
pub fn is_flattened(record: &Record) -> bool {
    record.contains_key(CAPTIONS_FIELD)
        && record
            .iter()
            .all(|(k, v)| k == CAPTIONS_FIELD || k == FILENAME_FIELD || is_none_text(v))
}

/// Flatten one record in place.
///
/// Returns `Ok(false)` when the record has no path and should be skipped.
pub fn flatten_record(
    record: &mut Record,
    index: usize,
    path_field: &str,
    drop_fields: &[String],
) -> Result<bool, FlattenError> {
    if is_flattened(record) {
        return Ok(true);
    }
    if record.contains_key(CAPTIONS_FIELD) {
        let fields = record
            .iter()
            .filter(|(k, v)| *k != CAPTIONS_FIELD && *k != FILENAME_FIELD && !is_none_text(v))
            .map(|(k, _)| k.clone())
            .collect();
        return Err(FlattenError::AlreadyFlattened { index, fields });
    }

    if path_field != FILENAME_FIELD {
        if let Some(path) = record.shift_remove(path_field) {
            record.insert(FILENAME_FIELD.to_string(), path);
        }
    }
    if !matches!(record.get(FILENAME_FIELD), Some(Value::String(_))) {
        return Ok(false);
    }

    let mut caption = String::new();
    let keys: Vec<String> = record.keys().cloned().collect();
    for key in keys {
        if key == FILENAME_FIELD {
            continue;
        }
        if drop_fields.contains(&key) || record[&key].is_null() {
            record.shift_remove(&key);
            continue;
        }
        if is_none_text(&record[&key]) {
            continue;
        }
        if let Some(text) = value_text(&record[&key]) {
            caption.push_str(&text);
            caption.push(' ');
            record.shift_remove(&key);
        }
    }

    record.insert(
        CAPTIONS_FIELD.to_string(),
        Value::String(caption.trim().to_string()),
    );
    Ok(true)
}

pub fn flatten_records(
    records: Vec<Record>,
    path_field: &str,
    drop_fields: &[String],
) -> Result<Outcome<Record>, FlattenError> {
    let mut outcome = Outcome::new();
    for (i, mut record) in records.into_iter().enumerate() {
        if flatten_record(&mut record, i, path_field, drop_fields)? {
            outcome.ok(record);
        } else {
            outcome.skip(
                STAGE,
                format!("row {}", i),
                SkipReason::MissingField(path_field.to_string()),
            );
        }
    }
    Ok(outcome)
}

pub fn run_flatten(config: &FlattenConfig) -> Result<Outcome<Record>> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load records from {}", config.input.display()))?;
    let total = records.len();

    let outcome = flatten_records(records, &config.path_field, &config.drop_fields)
        .with_context(|| format!("Cannot flatten {}", config.input.display()))?;
    write_records(&config.output, &outcome.succeeded)?;
    outcome.persist_skipped(&skipped_path_for(&config.output))?;

    println!("flatten");
    println!("  records: {}", total);
    println!("  flattened: {}", outcome.succeeded.len());
    println!("  skipped: {}", outcome.skipped.len());
    println!("ok");

    Ok(outcome)
}
