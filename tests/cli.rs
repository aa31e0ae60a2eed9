use std::path::{Path, PathBuf};
use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tomato_detector"))
}

fn init_config(dir: &Path) -> PathBuf {
    let path = dir.join("pipeline.json");
    let status = bin().args(["config", "--init", "--config"]).arg(&path).status().unwrap();
    assert!(status.success());
    path
}

#[test]
fn workflow_without_stages_prints_help_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = init_config(dir.path());
    let output = bin().args(["workflow", "--config"]).arg(&config).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--preprocess"));
    assert!(stdout.contains("--all"));
}

#[test]
fn verify_fails_when_classes_are_missing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("raw/healthy_leaf")).unwrap();
    let status = bin()
        .args(["verify", "--input-dir"])
        .arg(dir.path().join("raw"))
        .arg("--config")
        .arg(init_config(dir.path()))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn config_init_writes_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.json");
    let status = bin().args(["config", "--init", "--config"]).arg(&path).status().unwrap();
    assert!(status.success());

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["split"]["seed"], 42);
    assert_eq!(written["preprocess"]["image_size"], 96);
}

#[test]
fn explicit_config_that_fails_to_parse_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw");
    std::fs::create_dir_all(&raw).unwrap();

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, r#"{ "device_type": "Cpu", "split": "#).unwrap();
    let output = bin().args(["config", "--config"]).arg(&broken).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!String::from_utf8_lossy(&output.stdout).contains("パイプライン設定"));

    let invalid = dir.path().join("invalid.json");
    let mut written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(init_config(dir.path())).unwrap()).unwrap();
    written["export"]["calibration_per_class"] = serde_json::json!(50);
    std::fs::write(&invalid, written.to_string()).unwrap();
    let status = bin().args(["config", "--config"]).arg(&invalid).status().unwrap();
    assert_eq!(status.code(), Some(1));

    let missing = dir.path().join("missing.json");
    let status = bin().args(["config", "--config"]).arg(&missing).status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn inspect_model_prints_settings_and_classifies_images() {
    use tomato_detector_lib::ml::inference::model_to_bytes;
    use tomato_detector_lib::ml::{CpuBackend, ModelConfig};
    use tomato_detector_lib::model::{save_model_with_metadata, ModelMetadata};

    let dir = tempfile::tempdir().unwrap();
    let config = ModelConfig::new(2).with_image_size(32);
    let model = config.init::<CpuBackend>(&Default::default());
    let metadata = ModelMetadata::new(vec!["healthy_leaf".into(), "septoria_leaf".into()], config, 1, 0.5);
    let bundle = save_model_with_metadata(&dir.path().join("model"), &metadata, &model_to_bytes(model).unwrap()).unwrap();

    let leaf = dir.path().join("leaf.png");
    image::RgbImage::from_pixel(40, 40, image::Rgb([60, 140, 50])).save(&leaf).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_inspect_model"))
        .arg(&bundle)
        .arg(&leaf)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("推論設定"));
    assert!(stdout.contains("モデル入力サイズ: 32x32"));
    assert!(stdout.contains("leaf.png: "));

    let status = Command::new(env!("CARGO_BIN_EXE_inspect_model"))
        .arg(&bundle)
        .arg(dir.path().join("missing.png"))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
