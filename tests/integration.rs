use image::{Rgb, RgbImage};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn archae_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("archae");
    path
}

const METADATA_CSV: &str = "\
image_file__uri,media__uri,item__label,consists_of
https://images.example.org/iiif/abc123/full/default.jpg,https://opencontext.org/media/m1,Bowl 12,Ceramic
https://example.org/media/xyz.jpg,https://opencontext.org/media/m2,Lamp 3,Bronze
https://example.org/media/qrs.jpg,https://opencontext.org/media/m3,Coin 7,Silver
,https://opencontext.org/media/m4,Sherd 1,Ceramic
";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("csv_data")).unwrap();
    fs::write(root.join("csv_data/artifacts.csv"), METADATA_CSV).unwrap();

    let config_content = format!(
        r#"[export]
input = "{root}/csv_data/artifacts.csv"
output_dir = "{root}"
sample_fraction = 1.0

[annotate]
input = "{root}/training_metadata.json"
output = "{root}/annotated.json"

[filter]
input = "{root}/annotated.json"
output = "{root}/filtered.json"
image_dir = "{root}/training"

[flatten]
input = "{root}/filtered.json"
output = "{root}/simple.json"

[augment]
input = "{root}/simple.json"
output = "{root}/augmented-data.json"
image_root = "{root}"
"#,
        root = root.display()
    );

    let config_path = root.join("config/archae.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_archae(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = archae_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run archae binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn read_json(path: &Path) -> Vec<Value> {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn write_jpeg(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut img = RgbImage::new(6, 4);
    img.put_pixel(0, 0, Rgb([200, 10, 10]));
    img.save(path).unwrap();
}

#[test]
fn test_export_splits_rows_with_images() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_archae(&config, &["export"]);
    assert!(success, "export failed: {}", stderr);
    assert!(stdout.contains("rows read: 4"), "{}", stdout);
    assert!(stdout.contains("rows with image: 3"));
    assert!(stdout.contains("training: 3"));

    let root = tmp.path();
    assert_eq!(read_json(&root.join("training_metadata.json")).len(), 3);
    assert!(read_json(&root.join("testing_metadata.json")).is_empty());
    let csv = fs::read_to_string(root.join("training_metadata.csv")).unwrap();
    assert!(csv.starts_with("image_file__uri,media__uri,item__label,consists_of"));
}

#[test]
fn test_annotate_paths_follow_url_naming() {
    let (tmp, config) = setup_test_env();
    let (_, stderr, success) = run_archae(&config, &["export"]);
    assert!(success, "{}", stderr);
    let (stdout, stderr, success) = run_archae(&config, &["annotate"]);
    assert!(success, "annotate failed: {}", stderr);
    assert!(stdout.contains("annotated: 3"));

    let mut paths: Vec<String> = read_json(&tmp.path().join("annotated.json"))
        .iter()
        .map(|r| r["image_path"].as_str().unwrap().to_string())
        .collect();
    paths.sort();
    assert_eq!(
        paths,
        vec!["training/abc123.jpg", "training/qrs.jpg", "training/xyz.jpg"]
    );
}

#[test]
fn test_pipeline_through_augment() {
    let (tmp, config) = setup_test_env();
    let root = tmp.path();
    write_jpeg(&root.join("training/abc123.jpg"));
    write_jpeg(&root.join("training/xyz.jpg"));

    for stage in ["export", "annotate", "filter", "flatten"] {
        let (_, stderr, success) = run_archae(&config, &[stage]);
        assert!(success, "{} failed: {}", stage, stderr);
    }

    let filtered = read_json(&root.join("filtered.json"));
    assert_eq!(filtered.len(), 2);
    let skipped = read_json(&root.join("filtered.skipped.json"));
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["reason"]["kind"], "file_missing");

    let simple = read_json(&root.join("simple.json"));
    let bowl = simple
        .iter()
        .find(|r| r["filename"] == "training/abc123.jpg")
        .expect("bowl record");
    assert_eq!(bowl["captions"], "Bowl 12 Ceramic");
    assert_eq!(bowl.as_object().unwrap().len(), 2);

    let (stdout, stderr, success) = run_archae(&config, &["augment"]);
    assert!(success, "augment failed: {}", stderr);
    assert!(stdout.contains("variants written: 8"), "{}", stdout);

    let augmented = read_json(&root.join("augmented-data.json"));
    assert_eq!(augmented.len(), 10);
    assert!(root.join("training/abc123_rotate_90.jpg").is_file());
    assert!(root.join("training/xyz_flip.jpg").is_file());
    let rotated = image::open(root.join("training/abc123_rotate_90.jpg")).unwrap();
    assert_eq!((rotated.width(), rotated.height()), (4, 6));
}

#[test]
fn test_flatten_twice_is_stable() {
    let (tmp, config) = setup_test_env();
    let root = tmp.path();
    write_jpeg(&root.join("training/abc123.jpg"));
    for stage in ["export", "annotate", "filter", "flatten"] {
        let (_, stderr, success) = run_archae(&config, &[stage]);
        assert!(success, "{} failed: {}", stage, stderr);
    }
    let first = fs::read_to_string(root.join("simple.json")).unwrap();

    let again = root.join("simple-again.json");
    let (_, stderr, success) = run_archae(
        &config,
        &[
            "flatten",
            "--input",
            root.join("simple.json").to_str().unwrap(),
            "--output",
            again.to_str().unwrap(),
        ],
    );
    assert!(success, "{}", stderr);
    assert_eq!(fs::read_to_string(&again).unwrap(), first);
}

#[test]
fn test_missing_section_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_archae(&config, &["simplify"]);
    assert!(!success);
    assert!(
        stderr.contains("[simplify] section not configured"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[export]\ninput = \"a.csv\"\nsample_fraction = 1.5\n").unwrap();
    let (_, stderr, success) = run_archae(&bad, &["export"]);
    assert!(!success);
    assert!(stderr.contains("sample_fraction"), "stderr: {}", stderr);
}

#[test]
fn test_check_reports_stages() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_archae(&config, &["check"]);
    assert!(success);
    assert!(stdout.contains("STAGE"));
    assert!(stdout.contains("export"));
    assert!(stdout.contains("NOT CONFIGURED"));
}

#[test]
fn test_completions_without_config() {
    let missing = PathBuf::from("/nonexistent/archae.toml");
    let (stdout, _, success) = run_archae(&missing, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("archae"));
}
