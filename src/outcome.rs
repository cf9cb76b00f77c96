//! Per-stage result sets.
//!
//! Rows that a stage cannot process are not fatal. Each is recorded as a
//! [`Skipped`] entry with a machine-readable [`SkipReason`], logged, and
//! persisted next to the stage output so a rerun can target just those rows.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::naming::NamingError;
use crate::records::write_json;

#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("{0}")]
    Naming(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("write failed: {0}")]
    Write(String),
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("file not found: {0}")]
    FileMissing(String),
    #[error("unreadable image: {0}")]
    UnreadableImage(String),
    #[error("summarization failed: {0}")]
    Summarize(String),
}

impl From<NamingError> for SkipReason {
    fn from(err: NamingError) -> Self {
        SkipReason::Naming(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Skipped {
    /// What was skipped: a URL, a filename, or a row index.
    pub key: String,
    pub reason: SkipReason,
}

/// Succeeded items plus everything skipped along the way.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub succeeded: Vec<T>,
    pub skipped: Vec<Skipped>,
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl<T> Outcome<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&mut self, item: T) {
        self.succeeded.push(item);
    }

    /// Record a skip and emit a warning for it.
    pub fn skip(&mut self, stage: &str, key: impl Into<String>, reason: impl Into<SkipReason>) {
        let key = key.into();
        let reason = reason.into();
        tracing::warn!(stage, key = %key, reason = %reason, "skipped");
        self.skipped.push(Skipped { key, reason });
    }

    /// Write the skipped set to `path`. An empty set still writes `[]` so a
    /// stale file from an earlier run never lingers.
    pub fn persist_skipped(&self, path: &Path) -> Result<()> {
        write_json(path, &self.skipped)
    }
}

/// `<output>.skipped.json` next to a stage output file.
pub fn skipped_path_for(output: &Path) -> PathBuf {
    let mut name = output
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".skipped.json");
    output.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn skipped_path_replaces_extension() {
        assert_eq!(
            skipped_path_for(Path::new("out/training_set.json")),
            PathBuf::from("out/training_set.skipped.json")
        );
    }

    #[test]
    fn persist_writes_tagged_reasons() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.skipped.json");
        let mut outcome: Outcome<()> = Outcome::new();
        outcome.skip("fetch", "http://a/b.jpg", SkipReason::HttpStatus(404));
        outcome.persist_skipped(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["key"], "http://a/b.jpg");
        assert_eq!(value[0]["reason"]["kind"], "http_status");
        assert_eq!(value[0]["reason"]["detail"], 404);
    }

    #[test]
    fn naming_errors_convert() {
        let reason: SkipReason = NamingError::MissingUrl.into();
        assert_eq!(reason.to_string(), "record has no image url");
    }
}
