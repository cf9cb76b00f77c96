//! Local seq2seq summarizer: T5 on candle, weights from the model cache.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use tokenizers::Tokenizer;

use super::Summarizer;
use crate::config::SimplifyConfig;
use crate::model_cache::ModelCache;

pub const DEFAULT_MODEL: &str = "google-t5/t5-small";

pub struct T5Summarizer {
    name: String,
    model: t5::T5ForConditionalGeneration,
    config: t5::Config,
    tokenizer: Tokenizer,
    device: Device,
    max_input_tokens: usize,
    min_length: usize,
    max_length: usize,
}

impl T5Summarizer {
    pub fn load(config: &SimplifyConfig, cache: &ModelCache) -> Result<Self> {
        let repo = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let revision = &config.revision;

        let config_path = cache.ensure_file(repo, revision, "config.json")?;
        let tokenizer_path = cache.ensure_file(repo, revision, "tokenizer.json")?;
        let weights_path = cache.ensure_file(repo, revision, "model.safetensors")?;

        let model_config: t5::Config = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("Cannot read {}", config_path.display()))?,
        )
        .with_context(|| format!("Invalid T5 config {}", config_path.display()))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", tokenizer_path.display(), e))?;

        let device = Device::cuda_if_available(0)?;
        // Cached weights are immutable once downloaded.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)? };
        let model = t5::T5ForConditionalGeneration::load(vb, &model_config)?;
        tracing::info!(model = repo, revision = %revision, "summarization model loaded");

        Ok(Self {
            name: repo.to_string(),
            model,
            config: model_config,
            tokenizer,
            device,
            max_input_tokens: config.max_input_tokens,
            min_length: config.min_length,
            max_length: config.max_length,
        })
    }

    fn generate(&mut self, prompt: &str) -> Result<String> {
        let eos = self.config.eos_token_id as u32;
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Failed to tokenize prompt: {}", e))?;
        let ids = truncate_input(encoding.get_ids().to_vec(), self.max_input_tokens, eos);

        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let encoder_output = self.model.encode(&input_ids)?;

        let start = self
            .config
            .decoder_start_token_id
            .unwrap_or(self.config.pad_token_id) as u32;
        let mut output = vec![start];

        for step in 0..self.max_length {
            let decoder_input = if step == 0 || !self.config.use_cache {
                Tensor::new(output.as_slice(), &self.device)?.unsqueeze(0)?
            } else {
                let last = output[output.len() - 1];
                Tensor::new(&[last], &self.device)?.unsqueeze(0)?
            };
            let logits = self
                .model
                .decode(&decoder_input, &encoder_output)?
                .squeeze(0)?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?;

            let next = pick_token(&logits, step, self.min_length, eos);
            if next == eos {
                break;
            }
            output.push(next);
        }

        self.tokenizer
            .decode(&output[1..], true)
            .map_err(|e| anyhow!("Failed to decode summary: {}", e))
    }
}

impl Summarizer for T5Summarizer {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn summarize(&mut self, prompt: &str) -> Result<String> {
        let summary = self.generate(prompt);
        // cached keys/values belong to this prompt only, also when decoding failed
        self.model.clear_kv_cache();
        summary.map(|s| s.trim().to_string())
    }
}

/// Keep at most `max` tokens, ending with `eos` when cut.
fn truncate_input(mut ids: Vec<u32>, max: usize, eos: u32) -> Vec<u32> {
    if ids.len() > max {
        ids.truncate(max);
        if let Some(last) = ids.last_mut() {
            *last = eos;
        }
    }
    ids
}

/// Greedy choice for decoding step `step`; end-of-sequence is not allowed
/// before `min_length` tokens have been produced.
fn pick_token(logits: &[f32], step: usize, min_length: usize, eos: u32) -> u32 {
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (i, &score) in logits.iter().enumerate() {
        if i as u32 == eos && step < min_length {
            continue;
        }
        if score > best_score {
            best = i;
            best_score = score;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_suppressed_until_min_length() {
        let logits = [0.1, 5.0, 0.3, 0.2];
        assert_eq!(pick_token(&logits, 0, 3, 1), 2);
        assert_eq!(pick_token(&logits, 3, 3, 1), 1);
    }

    #[test]
    fn greedy_picks_highest_score() {
        assert_eq!(pick_token(&[0.0, -1.0, 7.5, 7.0], 10, 0, 1), 2);
    }

    #[test]
    fn long_prompt_truncated_with_eos() {
        let ids = truncate_input((10..20).collect(), 4, 1);
        assert_eq!(ids, vec![10, 11, 12, 1]);
        assert_eq!(truncate_input(vec![5, 1], 4, 1), vec![5, 1]);
    }
}
