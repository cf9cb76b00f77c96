//! Caption simplification.
//!
//! Rewrites the long flattened caption of each record into a short summary
//! stored in a separate field. Backends, selected by `simplify.provider`:
//! - **`local`**: T5 run in-process on candle ([`local_t5`]).
//! - **`ollama`**: a local Ollama server's `/api/generate` endpoint.
//! - **`disabled`**: refuses to run.
//!
//! # Retry Strategy
//!
//! The Ollama backend retries transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! A record whose summary fails is written out unchanged and listed in the
//! skipped file.

pub mod local_t5;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::time::Duration;

use crate::config::SimplifyConfig;
use crate::model_cache::ModelCache;
use crate::outcome::{skipped_path_for, Outcome, SkipReason};
use crate::progress::{ProgressReporter, Throttled};
use crate::records::{read_records, value_text, write_records, Record};

const STAGE: &str = "simplify";

/// A text summarization backend. Calls are blocking.
pub trait Summarizer: Send {
    fn model_name(&self) -> &str;
    fn summarize(&mut self, prompt: &str) -> Result<String>;
}

pub struct DisabledSummarizer;

impl Summarizer for DisabledSummarizer {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn summarize(&mut self, _prompt: &str) -> Result<String> {
        bail!("Caption simplification is disabled")
    }
}

pub struct OllamaSummarizer {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    max_length: usize,
    max_retries: u32,
}

impl OllamaSummarizer {
    pub fn new(config: &SimplifyConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("simplify.model required for Ollama provider"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model,
            max_length: config.max_length,
            max_retries: config.max_retries,
        })
    }
}

impl Summarizer for OllamaSummarizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn summarize(&mut self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": self.max_length },
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                std::thread::sleep(delay);
            }

            let resp = self
                .client
                .post(format!("{}/api/generate", self.url))
                .json(&body)
                .send();

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json()?;
                        return parse_generate_response(&json);
                    }

                    let body_text = response.text().unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!(
                            "Ollama API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }
                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url,
                        e
                    ));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama generation failed after retries")))
    }
}

fn parse_generate_response(json: &Value) -> Result<String> {
    let text = json
        .get("response")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response text"))?;
    Ok(text.trim().to_string())
}

/// | `provider` | backend |
/// |------------|---------|
/// | `"disabled"` | [`DisabledSummarizer`] |
/// | `"local"` | [`local_t5::T5Summarizer`] |
/// | `"ollama"` | [`OllamaSummarizer`] |
pub fn create_summarizer(
    config: &SimplifyConfig,
    cache: &ModelCache,
) -> Result<Box<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSummarizer)),
        "local" => Ok(Box::new(local_t5::T5Summarizer::load(config, cache)?)),
        "ollama" => Ok(Box::new(OllamaSummarizer::new(config)?)),
        other => bail!("Unknown simplify provider: {}", other),
    }
}

/// Summarize every record in place. `succeeded` holds the indices of the
/// records that gained a summary.
pub fn simplify_records(
    records: &mut [Record],
    summarizer: &mut dyn Summarizer,
    config: &SimplifyConfig,
    progress: &dyn ProgressReporter,
) -> Outcome<usize> {
    let mut outcome = Outcome::new();
    let ticker = Throttled::new(progress, STAGE, "captions", records.len() as u64, 10);

    for (i, record) in records.iter_mut().enumerate() {
        ticker.tick(i as u64 + 1);
        let caption = record
            .get(&config.caption_field)
            .and_then(value_text)
            .unwrap_or_default();
        let prompt = format!("{}{}", config.prompt_prefix, caption);

        match summarizer.summarize(&prompt) {
            Ok(summary) => {
                record.insert(config.output_field.clone(), Value::String(summary));
                outcome.ok(i);
            }
            Err(e) => {
                let key = record
                    .get("filename")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("row {}", i));
                outcome.skip(STAGE, key, SkipReason::Summarize(format!("{:#}", e)));
            }
        }
    }
    outcome
}

pub fn run_simplify(
    config: &SimplifyConfig,
    cache: &ModelCache,
    progress: &dyn ProgressReporter,
) -> Result<Vec<Record>> {
    if config.provider == "disabled" {
        bail!("Caption simplification is disabled (simplify.provider = \"disabled\")");
    }
    let mut records = read_records(&config.input)
        .with_context(|| format!("Failed to load records from {}", config.input.display()))?;

    let mut summarizer = create_summarizer(config, cache)?;
    let outcome = simplify_records(&mut records, summarizer.as_mut(), config, progress);

    write_records(&config.output, &records)?;
    outcome.persist_skipped(&skipped_path_for(&config.output))?;

    println!("simplify");
    println!("  model: {}", summarizer.model_name());
    println!("  records: {}", records.len());
    println!("  summarized: {}", outcome.succeeded.len());
    println!("  skipped: {}", outcome.skipped.len());
    println!("ok");

    Ok(records)
}
