//! Geometric augmentation of the flattened dataset.
//!
//! Every image gets one rotated or flipped copy per configured transform,
//! saved next to the original as `<stem>_<transform>.jpg` and appended to the
//! dataset with the original caption.

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::config::AugmentConfig;
use crate::flatten::{CAPTIONS_FIELD, FILENAME_FIELD};
use crate::outcome::{skipped_path_for, Outcome, SkipReason};
use crate::progress::{ProgressReporter, Throttled};
use crate::records::{field_str, read_records, write_records, Record};

const STAGE: &str = "augment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Transform {
    /// 90 degrees counter-clockwise; width and height swap.
    #[serde(rename = "rotate_90")]
    Rotate90,
    #[serde(rename = "rotate_180")]
    Rotate180,
    /// Top-to-bottom mirror.
    #[serde(rename = "reflect")]
    Reflect,
    /// Left-to-right mirror.
    #[serde(rename = "flip")]
    Flip,
}

impl Transform {
    pub const ALL: [Transform; 4] = [
        Transform::Rotate90,
        Transform::Rotate180,
        Transform::Reflect,
        Transform::Flip,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Transform::Rotate90 => "rotate_90",
            Transform::Rotate180 => "rotate_180",
            Transform::Reflect => "reflect",
            Transform::Flip => "flip",
        }
    }

    pub fn apply(self, img: &DynamicImage) -> DynamicImage {
        match self {
            Transform::Rotate90 => img.rotate270(),
            Transform::Rotate180 => img.rotate180(),
            Transform::Reflect => img.flipv(),
            Transform::Flip => img.fliph(),
        }
    }
}

/// `training/abc.jpg` + `flip` -> `training/abc_flip.jpg`.
///
/// The stem ends at the first `.` of the file name, so `a.b.png` becomes
/// `a_flip.jpg`.
pub fn variant_filename(filename: &str, transform: Transform) -> String {
    let (dir, name) = match filename.rfind('/') {
        Some(pos) => (&filename[..=pos], &filename[pos + 1..]),
        None => ("", filename),
    };
    let stem = name.split('.').next().unwrap_or(name);
    format!("{}{}_{}.jpg", dir, stem, transform.suffix())
}

fn resolve(root: &Path, filename: &str) -> PathBuf {
    root.join(filename)
}

/// Summary counts from one augmentation run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AugmentStats {
    pub originals: usize,
    pub opened: usize,
    /// Variant images written by this run.
    pub variants: usize,
    /// Variant images already on disk and kept as they were.
    pub existing: usize,
}

/// Augment `records` and return the new dataset.
///
/// The dataset holds every record whose image opened followed by one
/// `{filename, captions}` record per (record, transform), so its length is
/// `(1 + transforms) * opened` unless a variant fails to write. Records whose
/// image cannot be opened are dropped and listed as skipped.
pub fn augment_records(
    records: Vec<Record>,
    config: &AugmentConfig,
    progress: &dyn ProgressReporter,
) -> (Vec<Record>, Outcome<Record>, AugmentStats) {
    let mut outcome = Outcome::new();
    let mut stats = AugmentStats {
        originals: records.len(),
        ..AugmentStats::default()
    };
    let ticker = Throttled::new(progress, STAGE, "images", records.len() as u64, 25);
    let mut kept = Vec::with_capacity(records.len());

    for (i, record) in records.into_iter().enumerate() {
        ticker.tick(i as u64 + 1);

        let Some(filename) = field_str(&record, FILENAME_FIELD).map(str::to_string) else {
            outcome.skip(
                STAGE,
                format!("row {}", i),
                SkipReason::MissingField(FILENAME_FIELD.to_string()),
            );
            continue;
        };
        let captions = record.get(CAPTIONS_FIELD).cloned().unwrap_or(Value::Null);

        let source = resolve(&config.image_root, &filename);
        let original = match image::open(&source) {
            Ok(img) => img,
            Err(e) => {
                outcome.skip(
                    STAGE,
                    filename,
                    SkipReason::UnreadableImage(e.to_string()),
                );
                continue;
            }
        };
        stats.opened += 1;
        kept.push(record);

        for &transform in &config.transforms {
            let new_filename = variant_filename(&filename, transform);
            let target = resolve(&config.image_root, &new_filename);

            if !config.overwrite && target.exists() {
                tracing::debug!(variant = %target.display(), "variant exists, keeping it");
                stats.existing += 1;
            } else {
                let modified = DynamicImage::ImageRgb8(transform.apply(&original).to_rgb8());
                if let Err(e) = modified.save_with_format(&target, image::ImageFormat::Jpeg) {
                    outcome.skip(STAGE, new_filename, SkipReason::Write(e.to_string()));
                    continue;
                }
                stats.variants += 1;
            }

            let mut variant = Record::new();
            variant.insert(FILENAME_FIELD.to_string(), Value::String(new_filename));
            variant.insert(CAPTIONS_FIELD.to_string(), captions.clone());
            outcome.ok(variant);
        }
    }

    let mut dataset = kept;
    dataset.extend(outcome.succeeded.iter().cloned());
    (dataset, outcome, stats)
}

pub fn run_augment(
    config: &AugmentConfig,
    progress: &dyn ProgressReporter,
) -> Result<Vec<Record>> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load records from {}", config.input.display()))?;

    let (dataset, outcome, stats) = augment_records(records, config, progress);
    write_records(&config.output, &dataset)?;
    outcome.persist_skipped(&skipped_path_for(&config.output))?;

    println!("augment");
    println!("  records: {}", stats.originals);
    println!("  images opened: {}", stats.opened);
    println!("  variants written: {}", stats.variants);
    println!("  variants kept: {}", stats.existing);
    println!("  skipped: {}", outcome.skipped.len());
    println!("  total records: {}", dataset.len());
    println!("ok");

    Ok(dataset)
}
