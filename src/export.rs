//! Metadata export: filter artifact rows with an image and split them into
//! a small training sample and a testing remainder.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ExportConfig;
use crate::records::{field_str, read_records, write_records, Record};

/// Result of a split.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Vec<Record>,
    pub test: Vec<Record>,
}

/// Keep only rows whose `url_field` is a non-blank string.
pub fn with_image(records: Vec<Record>, url_field: &str) -> Vec<Record> {
    records
        .into_iter()
        .filter(|r| field_str(r, url_field).is_some())
        .collect()
}

/// Deterministic sample of `fraction` of `n` indices.
///
/// The same `(n, fraction, seed)` always yields the same indices in the same
/// order. Uses a partial Fisher-Yates shuffle so only the sampled prefix is
/// permuted.
pub fn sample_indices(n: usize, fraction: f64, seed: u64) -> Vec<usize> {
    let count = ((n as f64) * fraction).round() as usize;
    let count = count.min(n);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..count {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(count);
    indices
}

/// Split rows into a training sample (sampled order) and the remaining rows
/// as the testing set (original order).
pub fn split_records(records: Vec<Record>, fraction: f64, seed: u64) -> Split {
    let picked = sample_indices(records.len(), fraction, seed);
    let mut in_train = vec![false; records.len()];
    for &i in &picked {
        in_train[i] = true;
    }

    let mut slots: Vec<Option<Record>> = records.into_iter().map(Some).collect();
    let train = picked
        .iter()
        .filter_map(|&i| slots[i].take())
        .collect();
    let test = slots
        .into_iter()
        .zip(in_train)
        .filter_map(|(slot, taken)| if taken { None } else { slot })
        .collect();

    Split { train, test }
}

pub fn run_export(config: &ExportConfig) -> Result<Split> {
    let records = read_records(&config.input)
        .with_context(|| format!("Failed to load metadata from {}", config.input.display()))?;
    let total = records.len();

    let with_url = with_image(records, &config.url_field);
    if with_url.is_empty() {
        tracing::warn!(
            field = %config.url_field,
            "no rows have an image url; both splits will be empty"
        );
    }
    let usable = with_url.len();

    let split = split_records(with_url, config.sample_fraction, config.seed);

    for format in &config.formats {
        let train_path = config
            .output_dir
            .join(format!("{}.{}", config.train_name, format));
        let test_path = config
            .output_dir
            .join(format!("{}.{}", config.test_name, format));
        write_records(&train_path, &split.train)?;
        write_records(&test_path, &split.test)?;
        tracing::info!(
            train = %train_path.display(),
            test = %test_path.display(),
            "wrote metadata splits"
        );
    }

    println!("export");
    println!("  rows read: {}", total);
    println!("  rows with image: {}", usable);
    println!("  training: {}", split.train.len());
    println!("  testing: {}", split.test.len());
    println!("ok");

    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut r = Record::new();
                r.insert("id".into(), json!(i.to_string()));
                r
            })
            .collect()
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn sample_is_deterministic_for_seed() {
        assert_eq!(sample_indices(200, 0.1, 42), sample_indices(200, 0.1, 42));
        assert_ne!(sample_indices(200, 0.1, 42), sample_indices(200, 0.1, 7));
    }

    #[test]
    fn sample_size_rounds_fraction() {
        assert_eq!(sample_indices(200, 0.1, 1).len(), 20);
        assert_eq!(sample_indices(15, 0.1, 1).len(), 2);
        assert_eq!(sample_indices(10, 0.0, 1).len(), 0);
        assert_eq!(sample_indices(10, 1.0, 1).len(), 10);
    }

    #[test]
    fn split_partitions_rows() {
        let split = split_records(rows(50), 0.2, 42);
        assert_eq!(split.train.len(), 10);
        assert_eq!(split.test.len(), 40);

        let mut all = ids(&split.train);
        all.extend(ids(&split.test));
        all.sort_by_key(|s| s.parse::<usize>().unwrap());
        assert_eq!(all, (0..50).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_keeps_original_order() {
        let split = split_records(rows(30), 0.3, 9);
        let test: Vec<usize> = ids(&split.test)
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let mut sorted = test.clone();
        sorted.sort();
        assert_eq!(test, sorted);
    }

    #[test]
    fn rerun_gives_identical_membership() {
        let a = split_records(rows(100), 0.1, 42);
        let b = split_records(rows(100), 0.1, 42);
        assert_eq!(ids(&a.train), ids(&b.train));
        assert_eq!(ids(&a.test), ids(&b.test));
    }

    #[test]
    fn rows_without_url_are_dropped() {
        let mut with = Record::new();
        with.insert("image_file__uri".into(), json!("http://x/a.jpg"));
        let mut blank = Record::new();
        blank.insert("image_file__uri".into(), json!("  "));
        let mut null = Record::new();
        null.insert("image_file__uri".into(), Value::Null);
        let missing = Record::new();

        let kept = with_image(vec![with, blank, null, missing], "image_file__uri");
        assert_eq!(kept.len(), 1);
    }
}
