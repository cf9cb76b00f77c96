//! Image vectors for each dataset split.
//!
//! Every decodable image under a split's directory is embedded and written to
//! `<output_dir>/vectors-<split>.tsv`, one `id\tv1,v2,...` line per image.
//! The encoder is either stock CLIP ViT-B/32 (`model = "baseline"`, via
//! fastembed) or a checkpoint directory written by `archae finetune`.

use anyhow::{Context, Result};
use candle_core::Device;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::checkpoint;
use crate::clip;
use crate::config::{SplitConfig, VectorizeConfig};
use crate::imaging::{self, Decoder, CLIP_IMAGE_SIZE};
use crate::outcome::{Outcome, SkipReason};
use crate::progress::{ProgressReporter, Throttled};

const STAGE: &str = "vectorize";
const LOG_EVERY_BATCHES: usize = 100;

/// One decoded image ready for an encoder.
pub struct ImageItem {
    pub path: PathBuf,
    pub pixels: Vec<f32>,
}

/// An image embedding backend.
pub trait ImageEncoder {
    fn name(&self) -> &str;
    fn embed(&mut self, batch: &[ImageItem]) -> Result<Vec<Vec<f32>>>;
}

#[cfg(feature = "local-embeddings-fastembed")]
pub struct BaselineEncoder {
    model: fastembed::ImageEmbedding,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl BaselineEncoder {
    pub fn new() -> Result<Self> {
        let model = fastembed::ImageEmbedding::try_new(
            fastembed::ImageInitOptions::new(fastembed::ImageEmbeddingModel::ClipVitB32)
                .with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize baseline CLIP image model: {}", e))?;
        Ok(Self { model })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl ImageEncoder for BaselineEncoder {
    fn name(&self) -> &str {
        "baseline"
    }

    fn embed(&mut self, batch: &[ImageItem]) -> Result<Vec<Vec<f32>>> {
        let paths: Vec<&Path> = batch.iter().map(|item| item.path.as_path()).collect();
        self.model
            .embed(paths, Some(batch.len()))
            .map_err(|e| anyhow::anyhow!("Baseline image embedding failed: {}", e))
    }
}

/// Image tower of a fine-tuned checkpoint.
pub struct CheckpointEncoder {
    name: String,
    model: ClipModel,
    image_size: usize,
    device: Device,
}

impl CheckpointEncoder {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, &clip::config(), Device::cuda_if_available(0)?)
    }

    /// Open a checkpoint trained with `clip_config`.
    pub fn open_with(dir: &Path, clip_config: &ClipConfig, device: Device) -> Result<Self> {
        let (manifest, weights) = checkpoint::open(dir)?;
        let model = clip::frozen(&weights, clip_config, &device)
            .with_context(|| format!("Failed to load checkpoint {}", dir.display()))?;
        tracing::info!(
            checkpoint = %dir.display(),
            base_model = %manifest.base_model,
            epoch = manifest.epoch,
            "checkpoint loaded"
        );
        Ok(Self {
            name: dir.display().to_string(),
            model,
            image_size: clip_config.vision_config.image_size,
            device,
        })
    }
}

impl ImageEncoder for CheckpointEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn embed(&mut self, batch: &[ImageItem]) -> Result<Vec<Vec<f32>>> {
        let pixels: Vec<Vec<f32>> = batch.iter().map(|item| item.pixels.clone()).collect();
        let input = imaging::batch_tensor(&pixels, self.image_size, &self.device)?;
        let features = self.model.get_image_features(&input)?;
        Ok(features.to_vec2::<f32>()?)
    }
}

pub fn create_encoder(model: &str) -> Result<Box<dyn ImageEncoder>> {
    match model {
        #[cfg(feature = "local-embeddings-fastembed")]
        "baseline" => Ok(Box::new(BaselineEncoder::new()?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "baseline" => anyhow::bail!(
            "Baseline vectors require --features local-embeddings-fastembed; point vectorize.model at a checkpoint instead"
        ),
        dir => Ok(Box::new(CheckpointEncoder::open(Path::new(dir))?)),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

/// Image files under `dir` matching `include_globs`, sorted by relative path.
pub fn discover_images(dir: &Path, include_globs: &[String]) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(include_globs)?;
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if include_set.is_match(relative) {
            paths.push(entry.path().to_path_buf());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Output id: the path relative to the split directory, `/`-separated.
pub fn image_id(split_dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(split_dir).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn format_vector_line(id: &str, vector: &[f32]) -> String {
    let values: Vec<String> = vector.iter().map(|v| format!("{:.5}", v)).collect();
    format!("{}\t{}", id, values.join(","))
}

pub fn output_path(output_dir: &Path, split: &str) -> PathBuf {
    output_dir.join(format!("vectors-{}.tsv", split))
}

/// Counts for one split.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitStats {
    pub found: usize,
    pub embedded: usize,
    pub unreadable: usize,
}

/// Embed one split and write its TSV file.
pub fn vectorize_split(
    split: &SplitConfig,
    config: &VectorizeConfig,
    encoder: &mut dyn ImageEncoder,
    decoder: &Decoder,
    progress: &dyn ProgressReporter,
) -> Result<SplitStats> {
    let paths = discover_images(&split.image_dir, &config.include_globs)?;
    let mut stats = SplitStats {
        found: paths.len(),
        ..SplitStats::default()
    };
    let mut outcome: Outcome<()> = Outcome::new();

    let out_path = output_path(&config.output_dir, &split.name);
    let file = std::fs::File::create(&out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let mut writer = BufWriter::new(file);

    let total_batches = paths.len().div_ceil(config.batch_size);
    let stage = format!("{} {}", STAGE, split.name);
    let ticker = Throttled::new(progress, &stage, "batches", total_batches as u64, 10);

    for (b, chunk) in paths.chunks(config.batch_size).enumerate() {
        let mut batch = Vec::with_capacity(chunk.len());
        for (path, result) in chunk.iter().zip(decoder.decode(chunk)) {
            match result {
                Ok(pixels) => batch.push(ImageItem {
                    path: path.clone(),
                    pixels,
                }),
                Err(e) => {
                    stats.unreadable += 1;
                    outcome.skip(
                        STAGE,
                        path.display().to_string(),
                        SkipReason::UnreadableImage(e),
                    );
                }
            }
        }

        if !batch.is_empty() {
            let vectors = encoder.embed(&batch)?;
            for (item, vector) in batch.iter().zip(&vectors) {
                let id = image_id(&split.image_dir, &item.path);
                writeln!(writer, "{}", format_vector_line(&id, vector))?;
            }
            stats.embedded += vectors.len();
        }

        ticker.tick(b as u64 + 1);
        if (b + 1) % LOG_EVERY_BATCHES == 0 {
            tracing::info!(
                split = %split.name,
                batch = b + 1,
                total = total_batches,
                "embedding"
            );
        }
    }
    writer.flush()?;

    Ok(stats)
}

pub fn run_vectorize(
    config: &VectorizeConfig,
    progress: &dyn ProgressReporter,
) -> Result<Vec<(String, SplitStats)>> {
    let mut encoder = create_encoder(&config.model)?;
    let workers = config.workers.unwrap_or_else(imaging::default_workers);
    let decoder = Decoder::new(workers, CLIP_IMAGE_SIZE)?;

    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output dir {}",
            config.output_dir.display()
        )
    })?;

    let mut results = Vec::new();
    for split in &config.splits {
        if !split.image_dir.is_dir() {
            tracing::warn!(
                split = %split.name,
                dir = %split.image_dir.display(),
                "split directory missing, skipped"
            );
            continue;
        }
        let stats = vectorize_split(split, config, encoder.as_mut(), &decoder, progress)?;
        tracing::info!(
            split = %split.name,
            embedded = stats.embedded,
            unreadable = stats.unreadable,
            "split done"
        );
        results.push((split.name.clone(), stats));
    }

    println!("vectorize");
    println!("  model: {}", encoder.name());
    for (name, stats) in &results {
        println!(
            "  {}: {} vectors ({} unreadable) -> {}",
            name,
            stats.embedded,
            stats.unreadable,
            output_path(&config.output_dir, name).display()
        );
    }
    println!("ok");

    Ok(results)
}
