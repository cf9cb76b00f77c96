//! Local cache of model files downloaded from Hugging Face.
//!
//! Files are fetched once with a blocking HTTP client and reused from
//! `<cache_dir>/<repo>/<revision>/<file>` afterwards. Call from blocking
//! contexts only (`spawn_blocking` inside the async CLI).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::ModelsConfig;

const HF_BASE: &str = "https://huggingface.co";

#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
    base_url: String,
}

impl ModelCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            base_url: HF_BASE.to_string(),
        }
    }

    pub fn from_config(config: &ModelsConfig) -> Self {
        Self::new(config.cache_dir.clone().unwrap_or_else(default_cache_dir))
    }

    /// Point downloads at a mirror instead of huggingface.co.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cached path of `file` in `repo@revision`; nothing is downloaded.
    pub fn path_for(&self, repo: &str, revision: &str, file: &str) -> PathBuf {
        self.root
            .join(repo.replace('/', "--"))
            .join(revision.replace('/', "--"))
            .join(file)
    }

    /// Download `file` unless it is already cached; returns the local path.
    pub fn ensure_file(&self, repo: &str, revision: &str, file: &str) -> Result<PathBuf> {
        let cache_path = self.path_for(repo, revision, file);
        if cache_path.exists() {
            return Ok(cache_path);
        }

        let url = format!(
            "{}/{}/resolve/{}/{}",
            self.base_url,
            repo,
            revision.replace('/', "%2F"),
            file.replace(' ', "%20")
        );
        tracing::info!(url = %url, "downloading model file");

        let resp = reqwest::blocking::get(&url)
            .with_context(|| format!("Download {}", url))?
            .error_for_status()
            .with_context(|| format!("Download {}", url))?;
        let bytes = resp.bytes().context("Read model file body")?;

        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Create cache dir {}", parent.display()))?;
        }
        // Write under a temporary name first so an interrupted download never
        // looks cached.
        let partial = cache_path.with_extension("partial");
        std::fs::write(&partial, &bytes)
            .with_context(|| format!("Write {}", partial.display()))?;
        std::fs::rename(&partial, &cache_path)?;

        Ok(cache_path)
    }
}

fn default_cache_dir() -> PathBuf {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(base)
        .join(".cache")
        .join("archae-prep")
        .join("models")
}
