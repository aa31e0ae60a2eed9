//! モデルメタデータの定義
//!
//! tar.gz バンドル内の `metadata.json` と、エクスポート時に書き出す
//! `class_info.json` の2種類を扱います。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ml::ml_model::ModelConfig;

/// バンドル形式のバージョン
pub const FORMAT_VERSION: u32 = 1;

/// class_info.json のファイル名
pub const CLASS_INFO_FILE: &str = "class_info.json";

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（ID 順）
    /// 例: ["early_blight_leaf", "healthy_leaf", "late_blight_leaf", "septoria_leaf"]
    pub class_labels: Vec<String>,

    /// モデル構造の設定（重み復元時にこの設定でモデルを組み立てる）
    pub model_config: ModelConfig,

    /// モデル入力サイズ（正方形、通常96）
    pub image_size: usize,

    /// 実行した総エポック数（両フェーズの合計）
    pub num_epochs: usize,

    /// 最良の検証精度 (0-1)
    #[serde(default)]
    pub best_val_accuracy: f64,

    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_labels: Vec<String>, model_config: ModelConfig, num_epochs: usize, best_val_accuracy: f64) -> Self {
        let image_size = model_config.image_size;
        Self {
            class_labels,
            model_config,
            image_size,
            num_epochs,
            best_val_accuracy,
            format_version: FORMAT_VERSION,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self = serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.class_labels.len() != metadata.model_config.num_classes {
            anyhow::bail!(
                "メタデータが不正です: クラスラベル {} 個に対してモデルの出力は {} クラス",
                metadata.class_labels.len(),
                metadata.model_config.num_classes
            );
        }
        Ok(metadata)
    }
}

/// デプロイ先向けのクラス情報（class_info.json）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassInfo {
    pub classes: Vec<String>,
    /// [高さ, 幅, チャネル]
    pub input_shape: [usize; 3],
    pub version: String,
    /// "%Y-%m-%d %H:%M:%S"
    pub date_trained: String,
}

impl ClassInfo {
    pub fn new(classes: Vec<String>, image_size: usize, version: &str) -> Self {
        Self {
            classes,
            input_shape: [image_size, image_size, 3],
            version: version.to_string(),
            date_trained: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn from_metadata(metadata: &ModelMetadata, version: &str) -> Self {
        Self::new(metadata.class_labels.clone(), metadata.image_size, version)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).context(format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse class info")
    }
}
