//! Fine-tuned model checkpoints.
//!
//! A checkpoint is a directory holding `model.safetensors` and a
//! `checkpoint.json` manifest. The manifest records where training ended and
//! the SHA-256 of the weights so a stale or swapped file is caught on load.

use anyhow::{bail, Context, Result};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::clip::WEIGHTS_FILE;

pub const MANIFEST_FILE: &str = "checkpoint.json";

/// AdamW settings plus how many steps were taken.
///
/// Moment estimates are not part of the checkpoint; resuming from one starts
/// the optimizer fresh with these settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub steps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub base_model: String,
    pub base_revision: String,
    /// Zero-based index of the last completed epoch.
    pub epoch: usize,
    pub loss: f32,
    pub pairs: usize,
    pub optimizer: OptimizerState,
    pub weights: String,
    pub weights_sha256: String,
    pub created_at: DateTime<Utc>,
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn weights_path(dir: &Path) -> PathBuf {
    dir.join(WEIGHTS_FILE)
}

/// Write the manifest for weights already saved in `dir`.
pub fn write_manifest(dir: &Path, mut manifest: Manifest) -> Result<Manifest> {
    manifest.weights = WEIGHTS_FILE.to_string();
    manifest.weights_sha256 = sha256_file(&weights_path(dir))?;
    let json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(dir.join(MANIFEST_FILE), json)
        .with_context(|| format!("Failed to write manifest in {}", dir.display()))?;
    Ok(manifest)
}

/// Save the variables of `varmap` into `dir` and write their manifest.
pub fn save(dir: &Path, varmap: &VarMap, manifest: Manifest) -> Result<Manifest> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
    varmap
        .save(weights_path(dir))
        .with_context(|| format!("Failed to save weights in {}", dir.display()))?;
    write_manifest(dir, manifest)
}

/// Load and verify a checkpoint directory; returns the manifest and the
/// weights path.
pub fn open(dir: &Path) -> Result<(Manifest, PathBuf)> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path).with_context(|| {
        format!(
            "{} is not a checkpoint directory (missing {})",
            dir.display(),
            MANIFEST_FILE
        )
    })?;
    let manifest: Manifest = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", manifest_path.display()))?;

    let weights = dir.join(&manifest.weights);
    let actual = sha256_file(&weights)?;
    if actual != manifest.weights_sha256 {
        bail!(
            "Checkpoint weights {} do not match manifest (sha256 {} != {})",
            weights.display(),
            actual,
            manifest.weights_sha256
        );
    }
    Ok((manifest, weights))
}
