//! `archae check`: one status row per stage, showing whether its section is
//! configured and its inputs exist.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::model_cache::ModelCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: &'static str,
    pub status: String,
    pub ready: bool,
}

fn configured(stage: &'static str, inputs: &[(&str, &Path)]) -> StageStatus {
    for (label, path) in inputs {
        if !path.exists() {
            return StageStatus {
                stage,
                status: format!("MISSING {} ({})", label, path.display()),
                ready: false,
            };
        }
    }
    StageStatus {
        stage,
        status: "OK".to_string(),
        ready: true,
    }
}

fn not_configured(stage: &'static str) -> StageStatus {
    StageStatus {
        stage,
        status: "NOT CONFIGURED".to_string(),
        ready: false,
    }
}

/// Status of every stage section: configured or not, and whether its input
/// files and directories exist yet.
pub fn check_config(config: &Config) -> Vec<StageStatus> {
    let mut rows = Vec::new();

    rows.push(match &config.export {
        Some(c) => configured("export", &[("input", &c.input)]),
        None => not_configured("export"),
    });
    rows.push(match &config.fetch {
        Some(c) => configured("fetch", &[("input", &c.input)]),
        None => not_configured("fetch"),
    });
    rows.push(match &config.annotate {
        Some(c) => configured("annotate", &[("input", &c.input)]),
        None => not_configured("annotate"),
    });
    rows.push(match &config.filter {
        Some(c) => configured("filter", &[("input", &c.input), ("image_dir", &c.image_dir)]),
        None => not_configured("filter"),
    });
    rows.push(match &config.flatten {
        Some(c) => configured("flatten", &[("input", &c.input)]),
        None => not_configured("flatten"),
    });
    rows.push(match &config.augment {
        Some(c) => configured("augment", &[("input", &c.input), ("image_root", &c.image_root)]),
        None => not_configured("augment"),
    });
    rows.push(match &config.simplify {
        Some(c) if c.provider == "disabled" => StageStatus {
            stage: "simplify",
            status: "DISABLED".to_string(),
            ready: false,
        },
        Some(c) => configured("simplify", &[("input", &c.input)]),
        None => not_configured("simplify"),
    });
    rows.push(match &config.vectorize {
        Some(c) => {
            let mut inputs: Vec<(&str, &Path)> = c
                .splits
                .iter()
                .map(|s| (s.name.as_str(), s.image_dir.as_path()))
                .collect();
            if c.model != "baseline" {
                inputs.push(("checkpoint", Path::new(&c.model)));
            }
            configured("vectorize", &inputs)
        }
        None => not_configured("vectorize"),
    });
    rows.push(match &config.finetune {
        Some(c) => configured("finetune", &[("input", &c.input), ("image_dir", &c.image_dir)]),
        None => not_configured("finetune"),
    });

    rows
}

pub fn run_check(config: &Config) -> Result<()> {
    println!("{:<12} {:<6} STATUS", "STAGE", "READY");
    for row in check_config(config) {
        println!("{:<12} {:<6} {}", row.stage, row.ready, row.status);
    }
    println!(
        "model cache: {}",
        ModelCache::from_config(&config.models).root().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reports_each_stage() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("simple.json");
        std::fs::write(&input, "[]").unwrap();

        let config: Config = toml::from_str(&format!(
            "[flatten]\ninput = {:?}\noutput = \"out.json\"\n[filter]\ninput = {:?}\noutput = \"o.json\"\nimage_dir = \"/no/such/dir\"\n",
            input.to_string_lossy(),
            input.to_string_lossy()
        ))
        .unwrap();

        let rows = check_config(&config);
        assert_eq!(rows.len(), 9);
        let by_stage = |s: &str| rows.iter().find(|r| r.stage == s).unwrap().clone();

        assert!(by_stage("flatten").ready);
        let filter = by_stage("filter");
        assert!(!filter.ready);
        assert!(filter.status.starts_with("MISSING image_dir"));
        assert_eq!(by_stage("export").status, "NOT CONFIGURED");
    }
}
