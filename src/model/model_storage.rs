//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラスラベル、モデル設定など）
//! - model.bin       - モデルの重み（burn のフル精度バイナリレコード）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.bin";

/// 出力パスを `.tar.gz` に揃える
pub fn bundle_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// 名前付きのバイト列を tar.gz に書き出す
pub fn write_bundle(tar_gz_path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent).context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file =
        File::create(tar_gz_path).context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder
            .append(&header, *bytes)
            .context(format!("Failed to add {} to tar", name))?;
    }

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;
    Ok(())
}

/// tar.gz から指定した名前のエントリだけを読み込む
pub fn read_bundle_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
    let tar_gz_file = File::open(tar_gz_path).context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut found = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found.insert(name, buffer);
        }
    }
    Ok(found)
}

fn take_entry(entries: &mut HashMap<String, Vec<u8>>, name: &str) -> Result<Vec<u8>> {
    entries
        .remove(name)
        .ok_or_else(|| anyhow::anyhow!("{} not found in tar.gz archive", name))
}

/// メタデータと共にモデルをTar.gz形式で保存し、実際の保存先を返す
pub fn save_model_with_metadata(output_path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(output_path);
    let json_str = metadata.to_json_string()?;
    write_bundle(
        &tar_gz_path,
        &[(METADATA_ENTRY, json_str.as_bytes()), (MODEL_ENTRY, model_binary)],
    )?;
    Ok(tar_gz_path)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_bundle_entries(tar_gz_path, &[METADATA_ENTRY])?;
    let json = take_entry(&mut entries, METADATA_ENTRY)?;
    ModelMetadata::from_json_string(&String::from_utf8(json)?)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_bundle_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let json = take_entry(&mut entries, METADATA_ENTRY)?;
    let binary = take_entry(&mut entries, MODEL_ENTRY)?;
    Ok((ModelMetadata::from_json_string(&String::from_utf8(json)?)?, binary))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラス ({}): {}", metadata.num_classes(), metadata.class_labels.join(", "));
    println!("モデル入力サイズ: {}x{}x3", metadata.image_size, metadata.image_size);
    println!(
        "バックボーン幅倍率: {}, ヘッド: {} -> {}",
        metadata.model_config.width_multiplier,
        metadata.model_config.hidden_units,
        metadata.model_config.num_classes
    );
    println!("学習エポック数: {}", metadata.num_epochs);
    println!("最良検証精度: {:.2}%", metadata.best_val_accuracy * 100.0);
    println!("形式バージョン: {}", metadata.format_version);
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(vec!["a".into(), "b".into()], ModelConfig::new(2), 3, 0.5)
    }

    #[test]
    fn test_bundle_path_extension() {
        assert_eq!(bundle_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(bundle_path(Path::new("out/model.tar.gz")), PathBuf::from("out/model.tar.gz"));
    }

    #[test]
    fn test_save_and_load_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_model_with_metadata(&dir.path().join("nested/model"), &metadata(), &[1, 2, 3]).unwrap();
        assert!(path.ends_with("model.tar.gz"));

        let (meta, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(meta.class_labels, vec!["a", "b"]);
        assert_eq!(binary, vec![1, 2, 3]);
        assert_eq!(load_metadata(&path).unwrap().num_epochs, 3);
    }

    #[test]
    fn test_missing_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.tar.gz");
        write_bundle(&path, &[(METADATA_ENTRY, b"{}")]).unwrap();
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(err.to_string().contains(MODEL_ENTRY));
    }
}
