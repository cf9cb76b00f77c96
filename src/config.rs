//! TOML configuration.
//!
//! Every pipeline stage reads its paths and knobs from its own section, so
//! stages can be rerun with different inputs without editing code:
//!
//! ```toml
//! [export]
//! input = "csv_data/artifact_images_w_descriptions.csv"
//! sample_fraction = 0.10
//! seed = 42
//!
//! [fetch]
//! input = "training_metadata.json"
//! image_dir = "training"
//! ```
//!
//! All sections are optional. A command whose section is missing fails with
//! a descriptive error instead of falling back to hidden defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::augment::Transform;
use crate::naming::NamingPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    pub export: Option<ExportConfig>,
    pub fetch: Option<FetchConfig>,
    pub annotate: Option<AnnotateConfig>,
    pub filter: Option<FilterConfig>,
    pub flatten: Option<FlattenConfig>,
    pub augment: Option<AugmentConfig>,
    pub simplify: Option<SimplifyConfig>,
    pub vectorize: Option<VectorizeConfig>,
    pub finetune: Option<FinetuneConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelsConfig {
    /// Where downloaded model weights are kept. Defaults to
    /// `$HOME/.cache/archae-prep/models`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    pub input: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_url_field")]
    pub url_field: String,
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    #[serde(default = "default_train_name")]
    pub train_name: String,
    #[serde(default = "default_test_name")]
    pub test_name: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_url_field() -> String {
    "image_file__uri".to_string()
}
fn default_resource_field() -> String {
    "media__uri".to_string()
}
fn default_sample_fraction() -> f64 {
    0.10
}
fn default_seed() -> u64 {
    42
}
fn default_formats() -> Vec<String> {
    vec!["csv".to_string(), "json".to_string()]
}
fn default_train_name() -> String {
    "training_metadata".to_string()
}
fn default_test_name() -> String {
    "testing_metadata".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    pub input: PathBuf,
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(default = "default_url_field")]
    pub url_field: String,
    #[serde(default = "default_resource_field")]
    pub resource_field: String,
    #[serde(default)]
    pub naming: NamingPolicy,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
    /// Defaults to `<image_dir>/fetch.skipped.json`.
    #[serde(default)]
    pub skipped_path: Option<PathBuf>,
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("training")
}
fn default_fetch_timeout_secs() -> u64 {
    5
}
fn default_delay_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}

impl FetchConfig {
    pub fn skipped_path(&self) -> PathBuf {
        self.skipped_path
            .clone()
            .unwrap_or_else(|| self.image_dir.join("fetch.skipped.json"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotateConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_url_field")]
    pub url_field: String,
    #[serde(default = "default_resource_field")]
    pub resource_field: String,
    #[serde(default)]
    pub naming: NamingPolicy,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_path_prefix() -> String {
    "training".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(default = "default_path_field")]
    pub path_field: String,
}

fn default_path_field() -> String {
    "image_path".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FlattenConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_path_field")]
    pub path_field: String,
    #[serde(default = "default_drop_fields")]
    pub drop_fields: Vec<String>,
}

fn default_drop_fields() -> Vec<String> {
    vec![default_url_field(), default_resource_field()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct AugmentConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_output_dir")]
    pub image_root: PathBuf,
    #[serde(default = "default_transforms")]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_transforms() -> Vec<Transform> {
    Transform::ALL.to_vec()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimplifyConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_simplify_provider")]
    pub provider: String,
    /// Hugging Face repo for `local`, model tag for `ollama`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_caption_field")]
    pub caption_field: String,
    #[serde(default = "default_simplified_field")]
    pub output_field: String,
    #[serde(default = "default_prompt_prefix")]
    pub prompt_prefix: String,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_simplify_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_simplify_provider() -> String {
    "local".to_string()
}
fn default_revision() -> String {
    "main".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_caption_field() -> String {
    "captions".to_string()
}
fn default_simplified_field() -> String {
    "simplified_caption".to_string()
}
// T5 checkpoints only know the task prefixes they were trained with.
fn default_prompt_prefix() -> String {
    "summarize: ".to_string()
}
fn default_max_input_tokens() -> usize {
    512
}
fn default_min_length() -> usize {
    30
}
fn default_max_length() -> usize {
    70
}
fn default_simplify_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorizeConfig {
    /// `"baseline"` for stock CLIP ViT-B/32, otherwise a directory written
    /// by `archae finetune`.
    #[serde(default = "default_vectorize_model")]
    pub model: String,
    #[serde(default = "default_vectors_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_vectorize_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_image_globs")]
    pub include_globs: Vec<String>,
    /// Decoder threads. Defaults to one less than the number of CPUs.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_splits")]
    pub splits: Vec<SplitConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SplitConfig {
    pub name: String,
    pub image_dir: PathBuf,
}

fn default_vectorize_model() -> String {
    "baseline".to_string()
}
fn default_vectors_dir() -> PathBuf {
    PathBuf::from("vectors")
}
fn default_vectorize_batch_size() -> usize {
    64
}
fn default_image_globs() -> Vec<String> {
    vec![
        "**/*.jpg".to_string(),
        "**/*.jpeg".to_string(),
        "**/*.png".to_string(),
    ]
}
fn default_splits() -> Vec<SplitConfig> {
    ["training", "validation", "test"]
        .iter()
        .map(|name| SplitConfig {
            name: name.to_string(),
            image_dir: PathBuf::from("images").join(name),
        })
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FinetuneConfig {
    pub input: PathBuf,
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_finetune_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_caption_max_chars")]
    pub caption_max_chars: usize,
    /// Extra text field paired with every image, e.g. a time-range label.
    #[serde(default)]
    pub secondary_caption_field: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_base_model")]
    pub base_model: String,
    #[serde(default = "default_base_revision")]
    pub base_revision: String,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("model_checkpoint")
}
fn default_epochs() -> usize {
    30
}
fn default_finetune_batch_size() -> usize {
    50
}
fn default_learning_rate() -> f64 {
    5e-5
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.98
}
fn default_eps() -> f64 {
    1e-6
}
fn default_weight_decay() -> f64 {
    0.2
}
fn default_caption_max_chars() -> usize {
    40
}
fn default_base_model() -> String {
    "openai/clip-vit-base-patch32".to_string()
}
fn default_base_revision() -> String {
    "refs/pr/15".to_string()
}

impl Config {
    /// An empty configuration for commands that work without a config file.
    pub fn minimal() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(export) = &self.export {
            if !(0.0..=1.0).contains(&export.sample_fraction) {
                bail!("export.sample_fraction must be in [0.0, 1.0]");
            }
            if export.formats.is_empty() {
                bail!("export.formats must name at least one of: csv, json");
            }
            for format in &export.formats {
                match format.as_str() {
                    "csv" | "json" => {}
                    other => bail!("Unknown export format: '{}'. Must be csv or json.", other),
                }
            }
        }

        if let Some(simplify) = &self.simplify {
            match simplify.provider.as_str() {
                "disabled" | "local" | "ollama" => {}
                other => bail!(
                    "Unknown simplify provider: '{}'. Must be disabled, local, or ollama.",
                    other
                ),
            }
            if simplify.provider == "ollama" && simplify.model.is_none() {
                bail!("simplify.model must be specified when provider is 'ollama'");
            }
            if simplify.max_length == 0 || simplify.min_length > simplify.max_length {
                bail!("simplify.min_length must be <= simplify.max_length, and max_length > 0");
            }
            if simplify.max_input_tokens == 0 {
                bail!("simplify.max_input_tokens must be > 0");
            }
        }

        if let Some(vectorize) = &self.vectorize {
            if vectorize.batch_size == 0 {
                bail!("vectorize.batch_size must be > 0");
            }
            if vectorize.splits.is_empty() {
                bail!("vectorize.splits must not be empty");
            }
            if vectorize.workers == Some(0) {
                bail!("vectorize.workers must be > 0");
            }
        }

        if let Some(finetune) = &self.finetune {
            if finetune.epochs == 0 {
                bail!("finetune.epochs must be > 0");
            }
            if finetune.batch_size == 0 {
                bail!("finetune.batch_size must be > 0");
            }
            if finetune.caption_max_chars == 0 {
                bail!("finetune.caption_max_chars must be > 0");
            }
            if finetune.learning_rate <= 0.0 {
                bail!("finetune.learning_rate must be > 0");
            }
        }

        Ok(())
    }
}

/// Fails with a uniform message when a stage's section is absent.
pub fn require<'a, T>(section: &'a Option<T>, name: &str) -> Result<&'a T> {
    section
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("[{}] section not configured", name))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
