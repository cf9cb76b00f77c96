//! Path annotation: record where the fetcher puts each record's image.
//!
//! Does not look at the filesystem; `filter` reconciles against what was
//! actually downloaded.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::AnnotateConfig;
use crate::naming::{local_filename, NamingError};
use crate::outcome::{skipped_path_for, Outcome};
use crate::records::{field_str, read_records, write_records, Record};

const STAGE: &str = "annotate";
pub const IMAGE_PATH_FIELD: &str = "image_path";

/// Add `image_path` to every record.
///
/// Records without a URL get `image_path: null`. Records whose URL cannot be
/// turned into a filename are dropped and reported.
pub fn annotate_records(records: Vec<Record>, config: &AnnotateConfig) -> Outcome<Record> {
    let mut outcome = Outcome::new();
    let prefix = config.path_prefix.trim_end_matches('/');

    for (i, mut record) in records.into_iter().enumerate() {
        match local_filename(
            &record,
            config.naming,
            &config.url_field,
            &config.resource_field,
        ) {
            Ok(name) => {
                let path = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                record.insert(IMAGE_PATH_FIELD.to_string(), Value::String(path));
                outcome.ok(record);
            }
            Err(NamingError::MissingUrl) => {
                record.insert(IMAGE_PATH_FIELD.to_string(), Value::Null);
                outcome.ok(record);
            }
            Err(e) => {
                let key = field_str(&record, &config.url_field)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("row {}", i));
                outcome.skip(STAGE, key, e);
            }
        }
    }

    outcome
}

pub fn run_annotate(config: &AnnotateConfig) -> Result<Outcome<Record>> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load metadata from {}", config.input.display()))?;
    let total = records.len();

    let outcome = annotate_records(records, config);
    write_records(&config.output, &outcome.succeeded)?;
    let skipped_path = skipped_path_for(&config.output);
    outcome.persist_skipped(&skipped_path)?;

    let without_url = outcome
        .succeeded
        .iter()
        .filter(|r| r.get(IMAGE_PATH_FIELD) == Some(&Value::Null))
        .count();

    println!("annotate");
    println!("  records: {}", total);
    println!("  annotated: {}", outcome.succeeded.len() - without_url);
    println!("  without url: {}", without_url);
    println!("  skipped: {}", outcome.skipped.len());
    println!("ok");

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NamingPolicy;
    use serde_json::json;
    use std::path::PathBuf;

    fn config() -> AnnotateConfig {
        AnnotateConfig {
            input: PathBuf::from("in.json"),
            output: PathBuf::from("out.json"),
            url_field: "image_file__uri".into(),
            resource_field: "media__uri".into(),
            naming: NamingPolicy::Url,
            path_prefix: "training".into(),
        }
    }

    fn record(url: Value) -> Record {
        let mut r = Record::new();
        r.insert("image_file__uri".into(), url);
        r
    }

    #[test]
    fn end_to_end_record_paths() {
        let records = vec![
            record(json!("https://images.example.org/iiif/abc123/full/default.jpg")),
            record(json!("https://example.org/media/xyz.jpg")),
        ];
        let outcome = annotate_records(records, &config());
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.succeeded[0]["image_path"], "training/abc123.jpg");
        assert_eq!(outcome.succeeded[1]["image_path"], "training/xyz.jpg");
    }

    #[test]
    fn missing_url_gets_null_path() {
        let outcome = annotate_records(vec![record(Value::Null)], &config());
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.succeeded[0]["image_path"], Value::Null);
    }

    #[test]
    fn unparseable_url_is_dropped() {
        let outcome = annotate_records(
            vec![record(json!("https://example.org/default.jpg"))],
            &config(),
        );
        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].key, "https://example.org/default.jpg");
    }
}
