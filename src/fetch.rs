//! Image fetcher.
//!
//! Downloads the image of every training record into a flat directory.
//! Requests are strictly sequential with a fixed pause after each one to
//! keep the load on the image server low. Failures are not retried: the
//! URL is recorded in the skipped set and the next record is processed.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::naming::local_filename;
use crate::outcome::{Outcome, SkipReason};
use crate::progress::{ProgressReporter, Throttled};
use crate::records::{field_str, read_records, Record};

const STAGE: &str = "fetch";

/// One image present on disk after the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub url: String,
    pub path: PathBuf,
    /// `true` when the file was already present and no request was made.
    pub existing: bool,
}

pub async fn run_fetch(
    config: &FetchConfig,
    progress: &dyn ProgressReporter,
) -> Result<Outcome<Fetched>> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load metadata from {}", config.input.display()))?;

    let outcome = fetch_records(config, &records, progress).await?;
    outcome.persist_skipped(&config.skipped_path())?;

    let existing = outcome.succeeded.iter().filter(|f| f.existing).count();
    println!("fetch");
    println!("  records: {}", records.len());
    println!("  downloaded: {}", outcome.succeeded.len() - existing);
    println!("  already present: {}", existing);
    println!("  skipped: {}", outcome.skipped.len());
    println!("  skipped list: {}", config.skipped_path().display());
    println!("ok");

    Ok(outcome)
}

/// Download every record's image. Only filesystem errors creating the
/// target directory are fatal.
pub async fn fetch_records(
    config: &FetchConfig,
    records: &[Record],
    progress: &dyn ProgressReporter,
) -> Result<Outcome<Fetched>> {
    std::fs::create_dir_all(&config.image_dir).with_context(|| {
        format!(
            "Failed to create image directory {}",
            config.image_dir.display()
        )
    })?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    let delay = Duration::from_millis(config.delay_ms);
    let ticker = Throttled::new(progress, STAGE, "images", records.len() as u64, 10);

    let mut outcome = Outcome::new();

    for (i, record) in records.iter().enumerate() {
        ticker.tick(i as u64 + 1);

        let key = field_str(record, &config.url_field)
            .map(str::to_string)
            .unwrap_or_else(|| format!("row {}", i));

        let filename = match local_filename(
            record,
            config.naming,
            &config.url_field,
            &config.resource_field,
        ) {
            Ok(name) => name,
            Err(e) => {
                outcome.skip(STAGE, key, e);
                continue;
            }
        };
        let url = key;
        let path = config.image_dir.join(&filename);

        if config.skip_existing && path.is_file() {
            tracing::debug!(path = %path.display(), "already present");
            outcome.ok(Fetched {
                url,
                path,
                existing: true,
            });
            continue;
        }

        let result = download(&client, &url).await;
        match result {
            Ok(bytes) => match std::fs::write(&path, &bytes) {
                Ok(()) => {
                    tracing::debug!(url = %url, path = %path.display(), bytes = bytes.len(), "saved");
                    outcome.ok(Fetched {
                        url,
                        path,
                        existing: false,
                    });
                }
                Err(e) => outcome.skip(STAGE, url, SkipReason::Write(e.to_string())),
            },
            Err(reason) => outcome.skip(STAGE, url, reason),
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(outcome)
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, SkipReason> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| SkipReason::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SkipReason::HttpStatus(status.as_u16()));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| SkipReason::Request(e.to_string()))?;
    Ok(bytes.to_vec())
}
