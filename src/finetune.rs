//! Contrastive fine-tuning of CLIP ViT-B/32 on (image, caption) pairs.
//!
//! Pretrained weights come from the model cache. Training runs a fixed number
//! of epochs with AdamW and no schedule, then writes one checkpoint.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use candle_transformers::models::clip::ClipModel;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::checkpoint::{self, Manifest, OptimizerState};
use crate::clip::{self, ClipTokenizer, TOKENIZER_FILE, WEIGHTS_FILE};
use crate::config::FinetuneConfig;
use crate::flatten::{CAPTIONS_FIELD, FILENAME_FIELD};
use crate::imaging::{self, Decoder, CLIP_IMAGE_SIZE};
use crate::model_cache::ModelCache;
use crate::outcome::{Outcome, SkipReason};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::records::{basename, field_str, read_records, value_text, Record};

const STAGE: &str = "finetune";

#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub image: PathBuf,
    pub caption: String,
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// One pair per record, plus one for the secondary caption when configured
/// and present.
pub fn build_pairs(records: &[Record], config: &FinetuneConfig) -> Outcome<Pair> {
    let mut outcome = Outcome::new();
    for (i, record) in records.iter().enumerate() {
        let Some(filename) = field_str(record, FILENAME_FIELD) else {
            outcome.skip(
                STAGE,
                format!("row {}", i),
                SkipReason::MissingField(FILENAME_FIELD.to_string()),
            );
            continue;
        };
        let Some(caption) = record.get(CAPTIONS_FIELD).and_then(value_text) else {
            outcome.skip(
                STAGE,
                filename,
                SkipReason::MissingField(CAPTIONS_FIELD.to_string()),
            );
            continue;
        };

        let image = config.image_dir.join(basename(filename));
        outcome.ok(Pair {
            image: image.clone(),
            caption: truncate_chars(&caption, config.caption_max_chars),
        });

        if let Some(field) = &config.secondary_caption_field {
            if let Some(text) = record.get(field).and_then(value_text) {
                if !text.trim().is_empty() {
                    outcome.ok(Pair {
                        image,
                        caption: truncate_chars(&text, config.caption_max_chars),
                    });
                }
            }
        }
    }
    outcome
}

/// A fresh permutation of `0..n` from `rng`.
pub fn epoch_order(rng: &mut StdRng, n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    order
}

pub fn optimizer_params(config: &FinetuneConfig) -> ParamsAdamW {
    ParamsAdamW {
        lr: config.learning_rate,
        beta1: config.beta1,
        beta2: config.beta2,
        eps: config.eps,
        weight_decay: config.weight_decay,
    }
}

/// One AdamW step on a batch of aligned (image, caption) pairs; returns the
/// batch loss.
pub fn train_step(
    model: &ClipModel,
    optimizer: &mut AdamW,
    pixel_values: &Tensor,
    input_ids: &Tensor,
) -> Result<f32> {
    let (logits_per_text, logits_per_image) = model.forward(pixel_values, input_ids)?;
    let loss = clip::contrastive_loss(&logits_per_image, &logits_per_text)?;
    optimizer.backward_step(&loss)?;
    Ok(loss.to_scalar::<f32>()?)
}

pub fn run_finetune(
    config: &FinetuneConfig,
    cache: &ModelCache,
    progress: &dyn ProgressReporter,
) -> Result<Manifest> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load records from {}", config.input.display()))?;
    let mut outcome = build_pairs(&records, config);
    let pairs = std::mem::take(&mut outcome.succeeded);
    if pairs.is_empty() {
        bail!("No training pairs in {}", config.input.display());
    }
    tracing::info!(pairs = pairs.len(), "training pairs ready");

    let weights = cache.ensure_file(&config.base_model, &config.base_revision, WEIGHTS_FILE)?;
    let tokenizer_path =
        cache.ensure_file(&config.base_model, &config.base_revision, TOKENIZER_FILE)?;
    let tokenizer = ClipTokenizer::from_file(&tokenizer_path)?;

    let device = Device::cuda_if_available(0)?;
    let clip_config = clip::config();
    let varmap = VarMap::new();
    let model = clip::trainable(&varmap, &clip_config, &device)?;
    let loaded = clip::load_into(&varmap, &weights, &device)?;
    tracing::info!(
        model = %config.base_model,
        tensors = loaded,
        device = ?device,
        "pretrained weights loaded"
    );

    let params = optimizer_params(config);
    let mut optimizer = AdamW::new(varmap.all_vars(), params.clone())?;

    let decoder = Decoder::new(imaging::default_workers(), CLIP_IMAGE_SIZE)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut unreadable: HashSet<PathBuf> = HashSet::new();
    let mut steps: u64 = 0;
    let mut last_loss = f32::NAN;
    let mut last_epoch = 0;

    for epoch in 0..config.epochs {
        let order = epoch_order(&mut rng, pairs.len());
        let mut epoch_loss = 0f32;
        let mut epoch_batches = 0usize;

        for chunk in order.chunks(config.batch_size) {
            let batch: Vec<&Pair> = chunk
                .iter()
                .map(|&i| &pairs[i])
                .filter(|p| !unreadable.contains(&p.image))
                .collect();
            let paths: Vec<PathBuf> = batch.iter().map(|p| p.image.clone()).collect();
            let decoded = decoder.decode(&paths);

            let mut pixels = Vec::with_capacity(batch.len());
            let mut captions = Vec::with_capacity(batch.len());
            for (pair, result) in batch.iter().zip(decoded) {
                match result {
                    Ok(p) => {
                        pixels.push(p);
                        captions.push(pair.caption.clone());
                    }
                    Err(e) => {
                        // first failure is reported, later epochs skip silently
                        if unreadable.insert(pair.image.clone()) {
                            outcome.skip(
                                STAGE,
                                pair.image.display().to_string(),
                                SkipReason::UnreadableImage(e),
                            );
                        }
                    }
                }
            }
            if pixels.is_empty() {
                continue;
            }

            let pixel_values = imaging::batch_tensor(&pixels, CLIP_IMAGE_SIZE, &device)?;
            let input_ids = tokenizer.batch(&captions, &device)?;
            last_loss = train_step(&model, &mut optimizer, &pixel_values, &input_ids)?;
            steps += 1;
            epoch_loss += last_loss;
            epoch_batches += 1;
        }

        if epoch_batches == 0 {
            bail!("Epoch {} had no readable images", epoch);
        }
        last_epoch = epoch;
        let mean = epoch_loss / epoch_batches as f32;
        tracing::info!(epoch, mean_loss = mean, last_loss, "epoch finished");
        progress.report(ProgressEvent::Loss {
            stage: STAGE.to_string(),
            epoch: epoch + 1,
            epochs: config.epochs,
            loss: mean,
        });
    }

    let manifest = checkpoint::save(
        &config.checkpoint_dir,
        &varmap,
        Manifest {
            base_model: config.base_model.clone(),
            base_revision: config.base_revision.clone(),
            epoch: last_epoch,
            loss: last_loss,
            pairs: pairs.len(),
            optimizer: OptimizerState {
                kind: "adamw".to_string(),
                learning_rate: params.lr,
                beta1: params.beta1,
                beta2: params.beta2,
                eps: params.eps,
                weight_decay: params.weight_decay,
                steps,
            },
            weights: String::new(),
            weights_sha256: String::new(),
            created_at: Utc::now(),
        },
    )?;
    outcome.persist_skipped(&config.checkpoint_dir.join("finetune.skipped.json"))?;

    println!("finetune");
    println!("  pairs: {}", pairs.len());
    println!("  epochs: {}", config.epochs);
    println!("  steps: {}", steps);
    println!("  final loss: {:.4}", last_loss);
    println!("  skipped: {}", outcome.skipped.len());
    println!("  checkpoint: {}", config.checkpoint_dir.display());
    println!("ok");

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vectorize::{CheckpointEncoder, ImageEncoder, ImageItem};
    use candle_transformers::models::clip::ClipConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(secondary: Option<&str>) -> FinetuneConfig {
        let toml = format!(
            "[finetune]\ninput = \"augmented-data.json\"\nimage_dir = \"training\"\n{}",
            secondary
                .map(|f| format!("secondary_caption_field = \"{}\"\n", f))
                .unwrap_or_default()
        );
        let cfg: Config = toml::from_str(&toml).unwrap();
        cfg.finetune.unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn captions_are_truncated_by_characters() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ñandú cerámica", 5), "ñandú");
    }

    #[test]
    fn pairs_use_basename_under_image_dir() {
        let records = vec![
            record(json!({"filename": "training/a.jpg", "captions": "Bowl 12 Ceramic with a very long description text"})),
            record(json!({"filename": "b.jpg"})),
        ];
        let outcome = build_pairs(&records, &config(None));
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.succeeded[0].image, PathBuf::from("training/a.jpg"));
        assert_eq!(outcome.succeeded[0].caption.chars().count(), 40);
        assert_eq!(outcome.skipped.len(), 1);
    }

    #[test]
    fn secondary_caption_adds_pair() {
        let records = vec![
            record(json!({"filename": "a.jpg", "captions": "Bowl", "period": "Iron Age"})),
            record(json!({"filename": "b.jpg", "captions": "Lamp"})),
        ];
        let outcome = build_pairs(&records, &config(Some("period")));
        let captions: Vec<&str> = outcome
            .succeeded
            .iter()
            .map(|p| p.caption.as_str())
            .collect();
        assert_eq!(captions, vec!["Bowl", "Iron Age", "Lamp"]);
        assert_eq!(outcome.succeeded[0].image, outcome.succeeded[1].image);
    }

    #[test]
    fn epoch_order_is_seeded_permutation() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let first = epoch_order(&mut a, 20);
        assert_eq!(first, epoch_order(&mut b, 20));

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        // successive epochs reshuffle
        assert_ne!(epoch_order(&mut a, 20), first);
    }

    #[test]
    fn default_optimizer_settings() {
        let p = optimizer_params(&config(None));
        assert_eq!(p.lr, 5e-5);
        assert_eq!(p.beta1, 0.9);
        assert_eq!(p.beta2, 0.98);
        assert_eq!(p.eps, 1e-6);
        assert_eq!(p.weight_decay, 0.2);
    }

    /// ViT-B/32 layout shrunk to a size that trains in milliseconds.
    fn tiny_clip() -> ClipConfig {
        let mut c = ClipConfig::vit_base_patch32();
        c.text_config.vocab_size = 32;
        c.text_config.embed_dim = 16;
        c.text_config.intermediate_size = 32;
        c.text_config.max_position_embeddings = 8;
        c.text_config.num_hidden_layers = 1;
        c.text_config.num_attention_heads = 2;
        c.text_config.projection_dim = 8;
        c.vision_config.embed_dim = 16;
        c.vision_config.intermediate_size = 32;
        c.vision_config.num_hidden_layers = 1;
        c.vision_config.num_attention_heads = 2;
        c.vision_config.projection_dim = 8;
        c.vision_config.image_size = 8;
        c.vision_config.patch_size = 4;
        c.image_size = 8;
        c
    }

    fn tiny_images(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|img| {
                (0..3 * 8 * 8)
                    .map(|i| ((i * (img + 3)) % 17) as f32 / 17.0 - 0.5)
                    .collect()
            })
            .collect()
    }

    fn var_values(varmap: &VarMap, name: &str) -> Vec<f32> {
        let vars = varmap.data().lock().unwrap();
        vars[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn tiny_manifest(steps: u64, loss: f32) -> Manifest {
        Manifest {
            base_model: "tiny".into(),
            base_revision: "main".into(),
            epoch: 0,
            loss,
            pairs: 2,
            optimizer: OptimizerState {
                kind: "adamw".into(),
                learning_rate: 1e-2,
                beta1: 0.9,
                beta2: 0.98,
                eps: 1e-6,
                weight_decay: 0.0,
                steps,
            },
            weights: String::new(),
            weights_sha256: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn training_step_reaches_projections_and_logit_scale() {
        let device = Device::Cpu;
        let clip_config = tiny_clip();
        let varmap = VarMap::new();
        let model = clip::trainable(&varmap, &clip_config, &device).unwrap();
        assert!(varmap.data().lock().unwrap().contains_key("logit_scale"));

        let pixels = imaging::batch_tensor(&tiny_images(2), 8, &device).unwrap();
        let ids = Tensor::new(&[[1u32, 5, 9, 31], [2, 7, 31, 0]], &device).unwrap();

        let (per_text, per_image) = model.forward(&pixels, &ids).unwrap();
        let grads = clip::contrastive_loss(&per_image, &per_text)
            .unwrap()
            .backward()
            .unwrap();
        {
            let vars = varmap.data().lock().unwrap();
            for name in ["logit_scale", "visual_projection.weight", "text_projection.weight"] {
                assert!(grads.get(vars[name].as_tensor()).is_some(), "no gradient for {}", name);
            }
        }

        // weight decay off, so any change comes from the gradient
        let mut params = optimizer_params(&config(None));
        params.lr = 1e-2;
        params.weight_decay = 0.0;
        let mut optimizer = AdamW::new(varmap.all_vars(), params).unwrap();

        let before = var_values(&varmap, "visual_projection.weight");
        let scale_before = var_values(&varmap, "logit_scale");
        let loss = train_step(&model, &mut optimizer, &pixels, &ids).unwrap();
        assert!(loss.is_finite(), "loss {}", loss);
        assert_ne!(var_values(&varmap, "visual_projection.weight"), before);
        assert_ne!(var_values(&varmap, "logit_scale"), scale_before);
    }

    #[test]
    fn checkpoint_round_trip_embeds_like_trained_model() {
        let device = Device::Cpu;
        let clip_config = tiny_clip();
        let varmap = VarMap::new();
        let model = clip::trainable(&varmap, &clip_config, &device).unwrap();
        let images = tiny_images(2);
        let pixels = imaging::batch_tensor(&images, 8, &device).unwrap();
        let ids = Tensor::new(&[[1u32, 5, 31], [2, 31, 0]], &device).unwrap();

        let mut optimizer =
            AdamW::new(varmap.all_vars(), optimizer_params(&config(None))).unwrap();
        let loss = train_step(&model, &mut optimizer, &pixels, &ids).unwrap();
        let expected = model
            .get_image_features(&pixels)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("model_checkpoint");
        let manifest = checkpoint::save(&dir, &varmap, tiny_manifest(1, loss)).unwrap();
        assert_eq!(manifest.optimizer.steps, 1);

        // reload into a fresh trainable model
        let restored = VarMap::new();
        clip::trainable(&restored, &clip_config, &device).unwrap();
        let loaded = clip::load_into(&restored, &checkpoint::weights_path(&dir), &device).unwrap();
        assert_eq!(loaded, varmap.all_vars().len());
        assert_eq!(
            var_values(&restored, "visual_projection.weight"),
            var_values(&varmap, "visual_projection.weight")
        );

        let mut encoder = CheckpointEncoder::open_with(&dir, &clip_config, Device::Cpu).unwrap();
        let items: Vec<ImageItem> = images
            .into_iter()
            .enumerate()
            .map(|(i, pixels)| ImageItem {
                path: PathBuf::from(format!("{}.jpg", i)),
                pixels,
            })
            .collect();
        let vectors = encoder.embed(&items).unwrap();
        assert_eq!(vectors.len(), 2);
        for (got, want) in vectors.iter().zip(&expected) {
            assert_eq!(got.len(), 8);
            for (g, w) in got.iter().zip(want) {
                assert!((g - w).abs() < 1e-4, "{} vs {}", g, w);
            }
        }
    }
}
