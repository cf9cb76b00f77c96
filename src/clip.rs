//! CLIP ViT-B/32 on candle: model construction, weight loading, text
//! tokenization and the symmetric contrastive loss.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use std::path::Path;
use tokenizers::Tokenizer;

/// Context length of the CLIP text encoder.
pub const MAX_TOKENS: usize = 77;

const END_OF_TEXT: &str = "<|endoftext|>";

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

pub fn config() -> ClipConfig {
    ClipConfig::vit_base_patch32()
}

/// Build a trainable model whose parameters live in `varmap`.
///
/// `logit_scale` is registered up front so it is trained and restored from
/// weights like any other parameter.
pub fn trainable(varmap: &VarMap, config: &ClipConfig, device: &Device) -> Result<ClipModel> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    vb.get_with_hints((), "logit_scale", Init::Const(config.logit_scale_init_value as f64))?;
    Ok(ClipModel::new(vb, config)?)
}

/// Overwrite every variable in `varmap` with the tensor of the same name
/// from a safetensors file.
pub fn load_into(varmap: &VarMap, weights: &Path, device: &Device) -> Result<usize> {
    let tensors = candle_core::safetensors::load(weights, device)
        .with_context(|| format!("Failed to read weights {}", weights.display()))?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock poisoned"))?;
    for (name, var) in vars.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| anyhow!("{} has no tensor named {}", weights.display(), name))?;
        var.set(&tensor.to_dtype(var.dtype())?)
            .with_context(|| format!("Shape mismatch for {}", name))?;
    }
    Ok(vars.len())
}

/// Read-only model straight from a safetensors file.
pub fn frozen(weights: &Path, config: &ClipConfig, device: &Device) -> Result<ClipModel> {
    // The file is produced by this crate or downloaded into the cache and is
    // not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
    Ok(ClipModel::new(vb, config)?)
}

/// (logits_per_image, logits_per_text) are `[n, n]`; pair `i` is the
/// positive for row `i`.
pub fn contrastive_loss(logits_per_image: &Tensor, logits_per_text: &Tensor) -> Result<Tensor> {
    let n = logits_per_image.dim(0)?;
    let targets = Tensor::arange(0u32, n as u32, logits_per_image.device())?;
    let image_loss = candle_nn::loss::cross_entropy(logits_per_image, &targets)?;
    let text_loss = candle_nn::loss::cross_entropy(logits_per_text, &targets)?;
    Ok(((image_loss + text_loss)? / 2.0)?)
}

pub struct ClipTokenizer {
    inner: Tokenizer,
    end_of_text: u32,
}

impl ClipTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
        let end_of_text = inner
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| anyhow!("Tokenizer has no {} token", END_OF_TEXT))?;
        Ok(Self { inner, end_of_text })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow!("Failed to tokenize {:?}: {}", text, e))?;
        Ok(fit_context(encoding.get_ids().to_vec(), self.end_of_text))
    }

    /// `[n, len]` token ids, padded with end-of-text to the longest entry.
    pub fn batch(&self, texts: &[String], device: &Device) -> Result<Tensor> {
        let encoded = texts
            .iter()
            .map(|t| self.encode(t))
            .collect::<Result<Vec<_>>>()?;
        let (flat, len) = pad_batch(encoded, self.end_of_text);
        Ok(Tensor::from_vec(flat, (texts.len(), len), device)?)
    }
}

/// Cut to the context length, keeping end-of-text as the last token.
fn fit_context(mut ids: Vec<u32>, end_of_text: u32) -> Vec<u32> {
    if ids.len() > MAX_TOKENS {
        ids.truncate(MAX_TOKENS);
        ids[MAX_TOKENS - 1] = end_of_text;
    }
    ids
}

fn pad_batch(seqs: Vec<Vec<u32>>, pad: u32) -> (Vec<u32>, usize) {
    let len = seqs.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(seqs.len() * len);
    for mut s in seqs {
        s.resize(len, pad);
        flat.extend(s);
    }
    (flat, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_input_is_cut_to_context() {
        let ids: Vec<u32> = (0..100).collect();
        let fitted = fit_context(ids, 49407);
        assert_eq!(fitted.len(), MAX_TOKENS);
        assert_eq!(fitted[MAX_TOKENS - 1], 49407);
        assert_eq!(fitted[0], 0);
    }

    #[test]
    fn padding_uses_end_of_text() {
        let (flat, len) = pad_batch(vec![vec![1, 2, 3], vec![4]], 9);
        assert_eq!(len, 3);
        assert_eq!(flat, vec![1, 2, 3, 4, 9, 9]);
    }

    #[test]
    fn loss_prefers_matching_pairs() {
        let device = Device::Cpu;
        let aligned = Tensor::new(&[[10f32, 0.0], [0.0, 10.0]], &device).unwrap();
        let crossed = Tensor::new(&[[0f32, 10.0], [10.0, 0.0]], &device).unwrap();

        let good = contrastive_loss(&aligned, &aligned.t().unwrap())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let bad = contrastive_loss(&crossed, &crossed.t().unwrap())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(good < 0.01, "aligned loss {}", good);
        assert!(bad > 9.0, "crossed loss {}", bad);
    }
}
