//! Training-set filter: keep only records whose image is actually on disk.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::FilterConfig;
use crate::outcome::{skipped_path_for, Outcome, SkipReason};
use crate::records::{basename, field_str, read_records, write_records, Record};

const STAGE: &str = "filter";

/// Names of the regular files directly inside `dir`.
pub fn list_files(dir: &Path) -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry
            .with_context(|| format!("Failed to list image directory {}", dir.display()))?;
        if entry.file_type().is_file() {
            names.insert(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}

/// Keep records whose `path_field` names a file in `present`.
pub fn filter_records(
    records: Vec<Record>,
    path_field: &str,
    present: &HashSet<String>,
) -> Outcome<Record> {
    let mut outcome = Outcome::new();
    for (i, record) in records.into_iter().enumerate() {
        let Some(path) = field_str(&record, path_field).map(str::to_string) else {
            outcome.skip(
                STAGE,
                format!("row {}", i),
                SkipReason::MissingField(path_field.to_string()),
            );
            continue;
        };
        if present.contains(basename(&path)) {
            outcome.ok(record);
        } else {
            outcome.skip(STAGE, path.clone(), SkipReason::FileMissing(path));
        }
    }
    outcome
}

pub fn run_filter(config: &FilterConfig) -> Result<Outcome<Record>> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load records from {}", config.input.display()))?;
    let total = records.len();
    let present = list_files(&config.image_dir)?;

    let outcome = filter_records(records, &config.path_field, &present);
    write_records(&config.output, &outcome.succeeded)?;
    outcome.persist_skipped(&skipped_path_for(&config.output))?;

    println!("filter");
    println!("  records: {}", total);
    println!("  files on disk: {}", present.len());
    println!("  kept: {}", outcome.succeeded.len());
    println!("  skipped: {}", outcome.skipped.len());
    println!("ok");

    Ok(outcome)
}
