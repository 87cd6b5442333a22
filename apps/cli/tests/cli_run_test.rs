//! Integration tests for the `argus` command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const RECORDS: &str = r#"{"image_id": 1, "height": 64, "width": 64, "features": [1.0, 0.0], "objects": [{"bbox": [0, 0, 32, 32], "class_id": 1}]}
{"image_id": 2, "height": 64, "width": 64, "features": [0.0, 1.0], "objects": [{"bbox": [32, 32, 64, 64], "class_id": 0}]}
{"image_id": 3, "height": 64, "width": 64, "features": [1.0, 1.0], "objects": []}
"#;

/// A small single-level model that trains in a few steps.
const SMALL_CONFIG: &str = r"
architecture:
  num_classes: 2
  feature_dim: 2
retinanet_head:
  num_classes: 2
  min_level: 5
  max_level: 5
retinanet_loss:
  num_classes: 2
postprocess:
  num_classes: 2
  min_level: 5
  max_level: 5
anchor:
  min_level: 5
  max_level: 5
parser:
  output_size: [64, 64]
train:
  batch_size: 2
  total_steps: 4
  iterations_per_loop: 2
  learning_rate:
    warmup_steps: 1
eval:
  batch_size: 2
  eval_samples: -1
  min_eval_interval: 0
  eval_timeout: 30
";

fn argus() -> Command {
    let mut cmd = Command::cargo_bin("argus").unwrap();
    cmd.env_remove("ARGUS_MODEL_DIR").env_remove("ARGUS_STRATEGY_TYPE");
    cmd
}

fn write_fixture(temp_dir: &TempDir) -> (String, String) {
    let data = temp_dir.path().join("data.jsonl");
    fs::write(&data, RECORDS).unwrap();
    let config = temp_dir.path().join("small.yaml");
    fs::write(&config, SMALL_CONFIG).unwrap();
    (data.to_str().unwrap().to_string(), config.to_str().unwrap().to_string())
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_missing_file_patterns_fails() {
    let temp_dir = TempDir::new().unwrap();
    argus()
        .arg("--model-dir")
        .arg(path_str(temp_dir.path()))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Must provide at least one of training_file_pattern and eval_file_pattern."));
}

#[test]
fn test_unknown_mode_fails() {
    let temp_dir = TempDir::new().unwrap();
    argus()
        .args(["--mode", "bogus", "--training-file-pattern", "/data/train-*.jsonl"])
        .arg("--model-dir")
        .arg(path_str(temp_dir.path()))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Mode not found: bogus."));
}

#[test]
fn test_unknown_override_key_fails() {
    let temp_dir = TempDir::new().unwrap();
    argus()
        .args(["--training-file-pattern", "/data/train-*.jsonl", "--params-override", "train.no_such_key=1"])
        .arg("--model-dir")
        .arg(path_str(temp_dir.path()))
        .assert()
        .failure()
        .stderr(predicate::str::contains("train.no_such_key"));
}

#[test]
fn test_model_dir_is_required() {
    argus()
        .args(["--training-file-pattern", "/data/train-*.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("model_dir is required"));
}

#[test]
fn test_train_then_eval() {
    let temp_dir = TempDir::new().unwrap();
    let (data, config) = write_fixture(&temp_dir);
    let model_dir = temp_dir.path().join("model");

    argus()
        .args(["--mode", "train", "--training-file-pattern", &data, "--config-file", &config])
        .arg("--model-dir")
        .arg(path_str(&model_dir))
        .assert()
        .success()
        .stdout(predicate::str::contains("to step 4"))
        .stdout(predicate::str::contains("checkpoints written: 2"));

    assert!(model_dir.join("params.yaml").is_file());
    assert!(model_dir.join("ckpt-4.json").is_file());
    assert!(model_dir.join("train_manifest.json").is_file());

    argus()
        .args(["--mode", "eval", "--eval-file-pattern", &data, "--config-file", &config, "--json"])
        .arg("--model-dir")
        .arg(path_str(&model_dir))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""mode": "eval""#))
        .stdout(predicate::str::contains(r#""AP50""#))
        .stderr(predicate::str::contains("Final eval metric AP50:"))
        .stderr(predicate::str::contains("Final eval metric num_eval_examples: 3"));
}

#[test]
fn test_train_resumes_at_total_steps() {
    let temp_dir = TempDir::new().unwrap();
    let (data, config) = write_fixture(&temp_dir);
    let model_dir = temp_dir.path().join("model");

    for expected in ["from step 0 to step 4", "from step 4 to step 4"] {
        argus()
            .args(["--training-file-pattern", &data, "--config-file", &config])
            .arg("--model-dir")
            .arg(path_str(&model_dir))
            .assert()
            .success()
            .stdout(predicate::str::contains(expected));
    }
}
