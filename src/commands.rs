//! CLI の各ステージの実行
//!
//! ディレクトリなどの上書きは呼び出し側で `PipelineConfig` に反映済みの前提です。
//! バックエンドは `device_type` に応じて選択します。

use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use std::path::Path;
use std::sync::Arc;

use crate::dataset::{
    augment_dataset, organize_dataset, preprocess_dataset, verify_dataset, ClassVocabulary, VerifyReport,
};
use crate::error::PipelineError;
use crate::export::{calibration_sample, default_exporters, export_all, ExportContext, ExportReport};
use crate::ml::inference::{model_from_bytes, model_to_bytes, InferenceEngine};
use crate::ml::ml_model::Classifier;
use crate::ml::training::train_model;
use crate::ml::CpuBackend;
use crate::model::{load_model_with_metadata, save_model_with_metadata, DeviceType, ModelMetadata, PipelineConfig};
use crate::server::{self, InferenceService};

#[cfg(feature = "gpu")]
use crate::ml::GpuBackend;

/// 学習済みバンドルの既定ファイル名（artifact_dir 内）
pub const TRAINED_BUNDLE: &str = "model.tar.gz";

/// `device_type` に応じたバックエンドで関数を呼び出す
macro_rules! on_backend {
    ($device_type:expr, $run:ident ( $($arg:expr),* )) => {
        match $device_type {
            DeviceType::Cpu => $run::<CpuBackend>($($arg),*),
            #[cfg(feature = "gpu")]
            DeviceType::Wgpu => $run::<GpuBackend>($($arg),*),
            #[cfg(not(feature = "gpu"))]
            DeviceType::Wgpu => {
                tracing::warn!("gpu フィーチャー無しでビルドされているため CPU で実行します");
                $run::<CpuBackend>($($arg),*)
            }
        }
    };
}

/// データセット構成を検証して結果を表示する
pub fn verify(config: &PipelineConfig) -> Result<VerifyReport> {
    let root = &config.paths.raw_dir;
    let expected = &config.dataset.expected_classes;
    let report = verify_dataset(root, expected)?;
    if !report.ready() {
        VerifyReport::print_required_layout(root, expected);
    }
    Ok(report)
}

/// 前処理（CLAHE + リサイズ + 正規化）
pub fn preprocess(config: &PipelineConfig) -> Result<()> {
    let report = verify(config)?;
    if report.total_images == 0 {
        return Err(PipelineError::EmptyDataset(config.paths.raw_dir.clone()).into());
    }
    let summary = preprocess_dataset(&config.paths.raw_dir, &config.paths.processed_dir, &config.preprocess)?;
    tracing::info!(
        "前処理完了: {} 枚書き出し, {} 枚スキップ -> {}",
        summary.written,
        summary.skipped,
        config.paths.processed_dir.display()
    );
    Ok(())
}

/// データ拡張
pub fn augment(config: &PipelineConfig) -> Result<()> {
    let summary = augment_dataset(&config.paths.raw_dir, &config.paths.augmented_dir, &config.augment)?;
    tracing::info!(
        "拡張完了: 元画像 {} 枚から {} 枚生成 (スキップ {}, 目標未達 {})",
        summary.sources,
        summary.variants,
        summary.skipped,
        summary.under_quota
    );
    Ok(())
}

/// train / validation への分割
pub fn prepare(config: &PipelineConfig) -> Result<()> {
    let report = verify(config)?;
    if !report.missing.is_empty() {
        anyhow::bail!("クラスフォルダが不足しています: {}", report.missing.join(", "));
    }
    organize_dataset(
        &config.paths.raw_dir,
        &config.paths.data_dir,
        &config.split,
        &config.preprocess,
    )?;
    Ok(())
}

/// 学習し、バンドルを保存してから全形式をエクスポートする
pub fn train(config: &PipelineConfig, export: bool) -> Result<()> {
    on_backend!(config.device_type, train_on(config, export))
}

fn train_on<B: Backend>(config: &PipelineConfig, export: bool) -> Result<()> {
    let device = B::Device::default();
    tracing::info!("使用デバイス: {} ({:?})", config.device_type, device);

    let outcome = train_model::<Autodiff<B>>(config, &device)?;
    let metadata = ModelMetadata::new(
        outcome.classes.names(),
        outcome.model_config.clone(),
        outcome.history.len(),
        outcome.best_val_accuracy,
    );

    let bytes = model_to_bytes(outcome.model.clone())?;
    let bundle = save_model_with_metadata(&config.paths.artifact_dir.join(TRAINED_BUNDLE), &metadata, &bytes)?;
    tracing::info!("学習済みモデルを保存しました: {}", bundle.display());

    if !export {
        return Ok(());
    }
    let report = export_model(config, &outcome.model, &metadata, &outcome.classes, &device)?;
    ensure_exported(&report)
}

/// 保存済みバンドルから全形式を再エクスポートする
pub fn export(config: &PipelineConfig, bundle: &Path) -> Result<()> {
    on_backend!(config.device_type, export_on(config, bundle))
}

fn export_on<B: Backend>(config: &PipelineConfig, bundle: &Path) -> Result<()> {
    let device = B::Device::default();
    let (metadata, bytes) =
        load_model_with_metadata(bundle).context(format!("Failed to load model bundle: {:?}", bundle))?;
    let model = model_from_bytes::<B>(&metadata, bytes, &device)?;
    let vocabulary = ClassVocabulary::from_names(&metadata.class_labels);

    let report = export_model(config, &model, &metadata, &vocabulary, &device)?;
    ensure_exported(&report)
}

fn export_model<B: Backend>(
    config: &PipelineConfig,
    model: &Classifier<B>,
    metadata: &ModelMetadata,
    vocabulary: &ClassVocabulary,
    device: &B::Device,
) -> Result<ExportReport> {
    let calibration = calibration_sample(&config.paths.data_dir, vocabulary, config.export.calibration_per_class)?;
    let ctx = ExportContext {
        model,
        metadata,
        settings: &config.export,
        export_root: &config.paths.export_root,
        calibration: &calibration,
        device,
    };
    let report = export_all(&default_exporters::<B>(), &ctx);
    report.print_summary();
    Ok(report)
}

fn ensure_exported(report: &ExportReport) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }
    let failed: Vec<&str> = report.failed.iter().map(|(format, _)| format.as_str()).collect();
    anyhow::bail!("{} 形式のエクスポートに失敗しました: {}", failed.len(), failed.join(", "))
}

/// 推論サーバーを起動する
pub fn serve(config: &PipelineConfig, bundle: &Path, host: &str, port: u16) -> Result<()> {
    on_backend!(config.device_type, serve_on(bundle, host, port))
}

fn serve_on<B: Backend>(bundle: &Path, host: &str, port: u16) -> Result<()> {
    let device = B::Device::default();
    let engine = InferenceEngine::<B>::load(bundle, &device)?;
    let service = Arc::new(InferenceService::new(engine));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(server::serve(service, host, port))
}
