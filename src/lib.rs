//! # archae-prep
//!
//! Data preparation and CLIP fine-tuning for archaeological artifact images.
//!
//! A museum metadata table (one row per artifact, with an image URL and
//! sparse descriptive fields) is turned into a captioned, augmented image
//! dataset, used to fine-tune CLIP ViT-B/32, and embedded into per-split
//! vector files.
//!
//! ## Architecture
//!
//! ```text
//! table ─▶ export ─▶ fetch ─▶ annotate ─▶ filter ─▶ flatten ─▶ augment
//!                      │                                        │
//!                   images/                          simplify ◀─┤
//!                      │                                        ▼
//!                      └──────────▶ vectorize ◀──────────── finetune
//!                                      │                        │
//!                              vectors-<split>.tsv       model_checkpoint/
//! ```
//!
//! Every stage reads a record file and writes a new one; rows it cannot
//! handle are collected in an [`outcome::Outcome`] and written to a
//! `*.skipped.json` file instead of aborting the run.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`records`] | CSV / JSON record files |
//! | [`naming`] | Local image filenames from URLs |
//! | [`outcome`] | Succeeded / skipped result sets |
//! | [`export`] | Train/test split of the metadata table |
//! | [`fetch`] | Image download |
//! | [`annotate`] | `image_path` annotation |
//! | [`filter`] | Keep records with an image on disk |
//! | [`flatten`] | Caption flattening |
//! | [`augment`] | Rotated / flipped image variants |
//! | [`simplify`] | Caption summarization |
//! | [`vectorize`] | Per-split image vectors |
//! | [`finetune`] | Contrastive CLIP fine-tuning |
//! | [`checkpoint`] | Checkpoint manifest and verification |
//! | [`clip`] | CLIP model, tokenizer and loss on candle |
//! | [`imaging`] | Image decoding and CLIP preprocessing |
//! | [`model_cache`] | Downloaded model files |
//! | [`check`] | Stage readiness report |
//! | [`progress`] | Progress reporting on stderr |
//! | [`logging`] | `tracing` subscriber setup |

pub mod annotate;
pub mod augment;
pub mod check;
pub mod checkpoint;
pub mod clip;
pub mod config;
pub mod export;
pub mod fetch;
pub mod filter;
pub mod finetune;
pub mod flatten;
pub mod imaging;
pub mod logging;
pub mod model_cache;
pub mod naming;
pub mod outcome;
pub mod progress;
pub mod records;
pub mod simplify;
pub mod vectorize;
