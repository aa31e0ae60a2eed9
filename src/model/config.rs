//! パイプライン設定管理モジュール
//!
//! ディレクトリ構成・前処理・データ拡張・学習・エクスポートの設定を
//! JSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 各ステージの入出力ディレクトリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// 元画像 `raw_dataset/<class>/*.jpg`
    pub raw_dir: PathBuf,
    /// 前処理済み配列 `processed_dataset/<class>/*.npy`
    pub processed_dir: PathBuf,
    /// 拡張済み画像
    pub augmented_dir: PathBuf,
    /// 分割済みデータ `data/{train,validation}/<class>/`
    pub data_dir: PathBuf,
    /// 学習履歴などの作業ファイル
    pub artifact_dir: PathBuf,
    /// エクスポート先のルート（esp32/ cloud/ web/ が作られる）
    pub export_root: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("raw_dataset"),
            processed_dir: PathBuf::from("processed_dataset"),
            augmented_dir: PathBuf::from("augmented_dataset"),
            data_dir: PathBuf::from("data"),
            artifact_dir: PathBuf::from("artifacts"),
            export_root: PathBuf::from("."),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// 期待するクラス名
    pub expected_classes: Vec<String>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            expected_classes: vec![
                "healthy_leaf".to_string(),
                "early_blight_leaf".to_string(),
                "late_blight_leaf".to_string(),
                "septoria_leaf".to_string(),
            ],
        }
    }
}

/// 前処理結果の保存形式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// float32 の HWC 配列
    #[default]
    Npy,
    /// 8bit PNG
    Png,
}

/// 前処理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessSettings {
    /// 出力解像度（正方形）
    pub image_size: u32,
    /// CLAHE のクリップ上限
    pub clip_limit: f32,
    /// CLAHE のタイル分割数（縦横同数）
    pub tile_grid: u32,
    pub output_format: OutputFormat,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            image_size: 96,
            clip_limit: 3.0,
            tile_grid: 8,
            output_format: OutputFormat::Npy,
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentSettings {
    /// 1枚あたりの生成枚数 N
    pub samples_per_image: usize,
    /// 最大回転量（1回転に対する割合）
    pub max_rotation: f32,
    /// 最大平行移動量（画像サイズに対する割合）
    pub max_translation: f32,
    /// 最大ズーム量（倍率の変化幅）
    pub max_zoom: f32,
    pub horizontal_flip: bool,
    /// 画素値標準偏差の下限（0-255スケール）
    pub min_std_dev: f32,
    /// 最大チャネル平均 / チャネル平均の平均 の上限
    pub max_channel_ratio: f32,
    /// 試行回数の上限は attempt_factor × N
    pub attempt_factor: usize,
    pub image_size: u32,
    pub seed: u64,
}

impl Default for AugmentSettings {
    fn default() -> Self {
        Self {
            samples_per_image: 3,
            max_rotation: 0.15,
            max_translation: 0.1,
            max_zoom: 0.1,
            horizontal_flip: true,
            min_std_dev: 25.0,
            max_channel_ratio: 1.5,
            attempt_factor: 3,
            image_size: 96,
            seed: 42,
        }
    }
}

/// train / validation 分割設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSettings {
    pub validation_fraction: f32,
    pub seed: u64,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// バックボーンのチャネル幅倍率
    pub width_multiplier: f32,
    /// ヘッドの中間層ユニット数
    pub hidden_units: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// ImageNet 事前学習済みバックボーン重み
    /// （torchvision 形式の `.pth` / `.pt`、または burn の `.mpk`）
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
    /// 重み未設定でもランダム初期化で学習を続ける
    #[serde(default)]
    pub allow_random_init: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            width_multiplier: 0.35,
            hidden_units: 16,
            dropout: 0.3,
            backbone_weights: None,
            allow_random_init: false,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// フェーズ1（ヘッドのみ）のエポック数
    pub head_epochs: usize,
    /// フェーズ1の学習率
    pub head_learning_rate: f64,
    /// フェーズ2（微調整）の最大エポック数
    pub fine_tune_epochs: usize,
    /// フェーズ2の学習率
    pub fine_tune_learning_rate: f64,
    /// フェーズ2で学習させるバックボーン末尾の層数 K
    pub fine_tune_layers: usize,
    /// 早期終了の猶予エポック数
    pub patience: usize,
    /// 学習時の左右反転
    pub random_flip: bool,
    /// 学習時の最大回転量（1回転に対する割合）
    pub random_rotation: f32,
    /// ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_workers: 0,
            head_epochs: 10,
            head_learning_rate: 1e-3,
            fine_tune_epochs: 10,
            fine_tune_learning_rate: 1e-5,
            fine_tune_layers: 20,
            patience: 3,
            random_flip: true,
            random_rotation: 0.2,
            seed: 42,
        }
    }
}

/// キャリブレーション画像のクラスあたり上限
pub const MAX_CALIBRATION_PER_CLASS: usize = 20;

/// エクスポート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// class_info.json に記録する形式バージョン
    pub version: String,
    /// 量子化キャリブレーションに使うクラスあたりの最大枚数
    pub calibration_per_class: usize,
    /// Web 形式の重みシャードの最大バイト数
    pub web_shard_bytes: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            calibration_per_class: 20,
            web_shard_bytes: 4 * 1024 * 1024,
        }
    }
}

/// パイプライン設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub preprocess: PreprocessSettings,
    #[serde(default)]
    pub augment: AugmentSettings,
    #[serde(default)]
    pub split: SplitSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub export: ExportSettings,
}

impl PipelineConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("pipeline.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        let config: PipelineConfig =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定を解決する
    ///
    /// 明示的に指定されたパスは読み込みと検証に失敗したらエラーを返します。
    /// 指定が無い場合のみデフォルトパスへフォールバックします。
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => {
                let config = Self::load(path)?;
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                Ok(config)
            }
            None => Ok(Self::load_or_default()),
        }
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}",
                        path.display(),
                        e
                    );
                    tracing::warn!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(&Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// デフォルトパスに設定を保存する
    pub fn save_default(&self) -> anyhow::Result<()> {
        let path = Self::default_path();
        self.save(&path)?;
        tracing::info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// 値の範囲を検証する
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));

        if self.preprocess.image_size == 0 || self.augment.image_size == 0 {
            return invalid("image_size must be positive");
        }
        if self.preprocess.tile_grid == 0 {
            return invalid("tile_grid must be positive");
        }
        if !(0.0..1.0).contains(&self.split.validation_fraction) {
            return invalid("validation_fraction must be in [0, 1)");
        }
        if self.augment.attempt_factor == 0 {
            return invalid("attempt_factor must be positive");
        }
        if self.training.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.dataset.expected_classes.is_empty() {
            return invalid("expected_classes must not be empty");
        }
        if self.export.calibration_per_class == 0 || self.export.calibration_per_class > MAX_CALIBRATION_PER_CLASS {
            return invalid("calibration_per_class must be in 1..=20");
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== パイプライン設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("元画像: {}", self.paths.raw_dir.display());
        println!("前処理済み: {}", self.paths.processed_dir.display());
        println!("拡張済み: {}", self.paths.augmented_dir.display());
        println!("分割済み: {}", self.paths.data_dir.display());
        println!("期待クラス: {}", self.dataset.expected_classes.join(", "));
        println!("\n--- 前処理 ---");
        println!(
            "解像度: {}x{}, CLAHE clip={} grid={}x{}",
            self.preprocess.image_size,
            self.preprocess.image_size,
            self.preprocess.clip_limit,
            self.preprocess.tile_grid,
            self.preprocess.tile_grid
        );
        println!("\n--- データ拡張 ---");
        println!("生成枚数: {}", self.augment.samples_per_image);
        println!(
            "品質閾値: std >= {}, チャネル比 <= {}",
            self.augment.min_std_dev, self.augment.max_channel_ratio
        );
        println!("\n--- トレーニング設定 ---");
        println!("バッチサイズ: {}", self.training.batch_size);
        println!(
            "フェーズ1: {} エポック, 学習率 {}",
            self.training.head_epochs, self.training.head_learning_rate
        );
        println!(
            "フェーズ2: 最大 {} エポック, 学習率 {}, 末尾 {} 層, patience {}",
            self.training.fine_tune_epochs,
            self.training.fine_tune_learning_rate,
            self.training.fine_tune_layers,
            self.training.patience
        );
        println!("シード: {}", self.training.seed);
        println!("========================\n");
    }
}
