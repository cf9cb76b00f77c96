//! # archae-prep CLI (`archae`)
//!
//! Each command runs one stage of the artifact-image pipeline, reading its
//! settings from the matching section of the TOML config.
//!
//! ## Usage
//!
//! ```bash
//! archae --config ./config/archae.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `archae export` | Split the metadata table into training and test sets |
//! | `archae fetch` | Download the images of the training set |
//! | `archae annotate` | Add the local `image_path` of every record |
//! | `archae filter` | Keep records whose image is on disk |
//! | `archae flatten` | Collapse descriptive fields into one caption |
//! | `archae augment` | Write rotated and flipped copies of every image |
//! | `archae simplify` | Summarize captions with a seq2seq model |
//! | `archae vectorize` | Write image vectors for each split |
//! | `archae finetune` | Fine-tune CLIP on (image, caption) pairs |
//! | `archae check` | Show which stages are configured and ready |
//!
//! ## Examples
//!
//! ```bash
//! # Full data preparation with an alternative input table
//! archae export --input csv_data/artifacts.csv
//! archae fetch
//! archae annotate && archae filter && archae flatten && archae augment
//!
//! # Train, then embed the test split with the new checkpoint
//! archae finetune
//! archae vectorize --model model_checkpoint
//! ```

use anyhow::Context;
use archae_prep::config::{self, require, Config};
use archae_prep::logging::{self, LogFormat};
use archae_prep::model_cache::ModelCache;
use archae_prep::progress::ProgressMode;
use archae_prep::{
    annotate, augment, check, export, fetch, filter, finetune, flatten, simplify, vectorize,
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// archae-prep: data preparation and CLIP fine-tuning for archaeological
/// artifact images.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/archae.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "archae",
    about = "archae-prep: data preparation and CLIP fine-tuning for artifact images",
    version,
    long_about = "Turns a museum metadata table into a captioned, augmented image dataset, \
    fine-tunes CLIP on it, and writes image vectors for retrieval experiments."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/archae.toml")]
    config: PathBuf,

    /// Log line format on stderr. Filter with `RUST_LOG`.
    #[arg(long, global = true, value_enum, default_value = "human")]
    log_format: LogFormat,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// `--input` / `--output` overrides shared by the record-file stages.
#[derive(clap::Args, Default)]
struct Io {
    /// Override the section's `input` file.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Override the section's `output` file.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Split the metadata table into training and test files.
    ///
    /// Keeps rows with an image URL, samples `sample_fraction` of them with
    /// a fixed seed for training and writes the rest as the test set.
    Export {
        #[arg(long)]
        input: Option<PathBuf>,

        /// Override `export.output_dir`.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Download the image of every record.
    ///
    /// Existing files are kept. Failed downloads are listed in the skipped
    /// file and do not stop the run.
    Fetch {
        #[arg(long)]
        input: Option<PathBuf>,

        /// Override `fetch.image_dir`.
        #[arg(long)]
        image_dir: Option<PathBuf>,
    },

    /// Add `image_path` (where fetch stores the image) to every record.
    Annotate {
        #[command(flatten)]
        io: Io,
    },

    /// Keep only records whose image exists in the image directory.
    Filter {
        #[command(flatten)]
        io: Io,
    },

    /// Collapse descriptive fields into `{filename, captions}` records.
    Flatten {
        #[command(flatten)]
        io: Io,
    },

    /// Write rotated and flipped variants of every image and append them.
    Augment {
        #[command(flatten)]
        io: Io,
    },

    /// Summarize captions into a short `simplified_caption` field.
    Simplify {
        #[command(flatten)]
        io: Io,

        /// Override `simplify.provider` (`local`, `ollama`, `disabled`).
        #[arg(long)]
        provider: Option<String>,
    },

    /// Embed every image of each split and write `vectors-<split>.tsv`.
    Vectorize {
        /// `baseline` or a checkpoint directory; overrides `vectorize.model`.
        #[arg(long)]
        model: Option<String>,

        /// Override `vectorize.output_dir`.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Fine-tune CLIP ViT-B/32 on the flattened dataset.
    Finetune {
        #[arg(long)]
        input: Option<PathBuf>,

        /// Override `finetune.epochs`.
        #[arg(long)]
        epochs: Option<usize>,

        /// Override `finetune.checkpoint_dir`.
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// List pipeline stages and whether their inputs exist.
    Check,

    /// Print a shell completion script.
    Completions {
        shell: Shell,
    },
}

fn apply_io(input: &mut PathBuf, output: &mut PathBuf, io: Io) {
    if let Some(path) = io.input {
        *input = path;
    }
    if let Some(path) = io.output {
        *output = path;
    }
}

/// Run a CPU-bound stage off the async runtime.
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("stage worker panicked")?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);
    let progress_mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    // Commands that don't require config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "archae", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Check => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|e| {
                tracing::warn!(error = %format!("{:#}", e), "using empty configuration");
                Config::minimal()
            });
            return check::run_check(&cfg);
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;
    let cache = ModelCache::from_config(&cfg.models);

    match cli.command {
        Commands::Export { input, output_dir } => {
            let mut c = require(&cfg.export, "export")?.clone();
            if let Some(path) = input {
                c.input = path;
            }
            if let Some(dir) = output_dir {
                c.output_dir = dir;
            }
            export::run_export(&c)?;
        }
        Commands::Fetch { input, image_dir } => {
            let mut c = require(&cfg.fetch, "fetch")?.clone();
            if let Some(path) = input {
                c.input = path;
            }
            if let Some(dir) = image_dir {
                c.image_dir = dir;
            }
            let reporter = progress_mode.reporter();
            fetch::run_fetch(&c, reporter.as_ref()).await?;
        }
        Commands::Annotate { io } => {
            let mut c = require(&cfg.annotate, "annotate")?.clone();
            apply_io(&mut c.input, &mut c.output, io);
            annotate::run_annotate(&c)?;
        }
        Commands::Filter { io } => {
            let mut c = require(&cfg.filter, "filter")?.clone();
            apply_io(&mut c.input, &mut c.output, io);
            filter::run_filter(&c)?;
        }
        Commands::Flatten { io } => {
            let mut c = require(&cfg.flatten, "flatten")?.clone();
            apply_io(&mut c.input, &mut c.output, io);
            flatten::run_flatten(&c)?;
        }
        Commands::Augment { io } => {
            let mut c = require(&cfg.augment, "augment")?.clone();
            apply_io(&mut c.input, &mut c.output, io);
            blocking(move || {
                augment::run_augment(&c, progress_mode.reporter().as_ref()).map(|_| ())
            })
            .await?;
        }
        Commands::Simplify { io, provider } => {
            let mut c = require(&cfg.simplify, "simplify")?.clone();
            apply_io(&mut c.input, &mut c.output, io);
            if let Some(p) = provider {
                c.provider = p;
            }
            blocking(move || {
                simplify::run_simplify(&c, &cache, progress_mode.reporter().as_ref()).map(|_| ())
            })
            .await?;
        }
        Commands::Vectorize { model, output_dir } => {
            let mut c = require(&cfg.vectorize, "vectorize")?.clone();
            if let Some(m) = model {
                c.model = m;
            }
            if let Some(dir) = output_dir {
                c.output_dir = dir;
            }
            blocking(move || {
                vectorize::run_vectorize(&c, progress_mode.reporter().as_ref()).map(|_| ())
            })
            .await?;
        }
        Commands::Finetune {
            input,
            epochs,
            checkpoint_dir,
        } => {
            let mut c = require(&cfg.finetune, "finetune")?.clone();
            if let Some(path) = input {
                c.input = path;
            }
            if let Some(n) = epochs {
                anyhow::ensure!(n > 0, "--epochs must be > 0");
                c.epochs = n;
            }
            if let Some(dir) = checkpoint_dir {
                c.checkpoint_dir = dir;
            }
            blocking(move || {
                finetune::run_finetune(&c, &cache, progress_mode.reporter().as_ref()).map(|_| ())
            })
            .await?;
        }
        Commands::Completions { .. } | Commands::Check => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
