//! 学習済みモデルのエクスポート
//!
//! 形式ごとのエクスポーターを登録しておき、順に実行します。
//! ある形式が失敗しても残りの形式は続行し、結果は [`ExportReport`] にまとめます。

pub mod cloud;
pub mod embedded;
pub mod tensors;
pub mod web;

use anyhow::Result;
use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};

use crate::dataset::organize::TRAIN_DIR;
use crate::dataset::vocabulary::ClassVocabulary;
use crate::ml::ml_model::Classifier;
use crate::ml::training::LeafDataset;
use crate::model::{ExportSettings, ModelMetadata};

pub use cloud::{ClassInfoExporter, CloudExporter};
pub use embedded::EmbeddedExporter;
pub use web::WebExporter;

/// エクスポートに必要な入力一式
pub struct ExportContext<'a, B: Backend> {
    pub model: &'a Classifier<B>,
    pub metadata: &'a ModelMetadata,
    pub settings: &'a ExportSettings,
    /// `esp32/`, `cloud/`, `web/` を作るディレクトリ
    pub export_root: &'a Path,
    /// 量子化キャリブレーション用の代表画像
    pub calibration: &'a [PathBuf],
    pub device: &'a B::Device,
}

/// 1つの出力形式
pub trait ModelExporter<B: Backend> {
    fn format(&self) -> &'static str;
    /// 書き出したファイルの一覧を返す
    fn export(&self, ctx: &ExportContext<'_, B>) -> Result<Vec<PathBuf>>;
}

/// 既定のエクスポーター（組み込み・クラウド・Web・class_info.json）
pub fn default_exporters<B: Backend>() -> Vec<Box<dyn ModelExporter<B>>> {
    vec![
        Box::new(EmbeddedExporter),
        Box::new(CloudExporter),
        Box::new(WebExporter),
        Box::new(ClassInfoExporter),
    ]
}

/// エクスポート結果
#[derive(Debug, Default)]
pub struct ExportReport {
    pub succeeded: Vec<(String, Vec<PathBuf>)>,
    pub failed: Vec<(String, String)>,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn print_summary(&self) {
        println!("\n=== エクスポート結果 ===");
        for (format, paths) in &self.succeeded {
            println!("[OK]   {}", format);
            for path in paths {
                println!("         {}", path.display());
            }
        }
        for (format, error) in &self.failed {
            println!("[FAIL] {}: {}", format, error);
        }
        println!("========================");
    }
}

/// 全エクスポーターを実行する
pub fn export_all<B: Backend>(exporters: &[Box<dyn ModelExporter<B>>], ctx: &ExportContext<'_, B>) -> ExportReport {
    let mut report = ExportReport::default();
    for exporter in exporters {
        let format = exporter.format().to_string();
        tracing::info!("[{}] エクスポート中...", format);
        match exporter.export(ctx) {
            Ok(paths) => report.succeeded.push((format, paths)),
            Err(e) => {
                tracing::error!("[{}] エクスポート失敗: {:#}", format, e);
                report.failed.push((format, format!("{:#}", e)));
            }
        }
    }
    report
}

/// 学習データからクラスごとに最大 `per_class` 枚の代表画像を選ぶ
///
/// train ディレクトリが無い場合は空を返します。
pub fn calibration_sample(data_dir: &Path, vocabulary: &ClassVocabulary, per_class: usize) -> Result<Vec<PathBuf>> {
    let train_dir = data_dir.join(TRAIN_DIR);
    if !train_dir.is_dir() {
        tracing::warn!("{} が見つかりません", train_dir.display());
        return Ok(Vec::new());
    }
    let dataset = LeafDataset::from_split(&train_dir, vocabulary)?;
    Ok(dataset
        .sample_per_class(per_class)
        .into_iter()
        .map(|item| item.path)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::{leaf_image, write_image};
    use crate::export::embedded::read_embedded;
    use crate::ml::inference::InferenceEngine;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::{ClassInfo, CLASS_INFO_FILE};
    use burn::backend::NdArray;

    struct Failing;

    impl<B: Backend> ModelExporter<B> for Failing {
        fn format(&self) -> &'static str {
            "failing"
        }

        fn export(&self, _ctx: &ExportContext<'_, B>) -> Result<Vec<PathBuf>> {
            anyhow::bail!("disk full")
        }
    }

    fn fixture(root: &Path) -> (Classifier<NdArray>, ModelMetadata, Vec<PathBuf>) {
        let device = Default::default();
        let config = ModelConfig::new(2).with_image_size(32);
        let model = config.init::<NdArray>(&device);
        let metadata = ModelMetadata::new(vec!["a".into(), "b".into()], config, 2, 0.5);

        let mut calibration = Vec::new();
        for (class, seed) in [("a", 1), ("b", 2)] {
            write_image(root, class, "x.png", &leaf_image(32, 32, seed));
            calibration.push(root.join(class).join("x.png"));
        }
        (model, metadata, calibration)
    }

    #[test]
    fn test_all_formats_share_classes_and_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (model, metadata, calibration) = fixture(&dir.path().join("images"));
        let export_root = dir.path().join("out");
        let settings = ExportSettings::default();
        let device = Default::default();
        let ctx = ExportContext {
            model: &model,
            metadata: &metadata,
            settings: &settings,
            export_root: &export_root,
            calibration: &calibration,
            device: &device,
        };

        let report = export_all(&default_exporters::<NdArray>(), &ctx);
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.succeeded.len(), 4);

        let info = ClassInfo::load(&export_root.join("cloud/model").join(CLASS_INFO_FILE)).unwrap();
        assert_eq!(info.classes, vec!["a", "b"]);
        assert_eq!(info.input_shape, [32, 32, 3]);

        let bytes = std::fs::read(export_root.join("esp32/model/tomato_model.tqm")).unwrap();
        let (manifest, payload) = read_embedded(&bytes).unwrap();
        assert_eq!(manifest.classes, info.classes);
        assert_eq!(manifest.input.shape, vec![1, 32, 32, 3]);
        assert_eq!(manifest.calibration_images, 2);
        let last = manifest.layers.iter().filter_map(|l| l.bias.as_ref()).last().unwrap();
        assert_eq!(last.offset + last.length, payload.len());
        assert!(export_root.join("esp32/model/tomato_model_data.h").exists());
        let adds: Vec<_> = manifest.layers.iter().filter(|l| l.op == "add").collect();
        assert_eq!(adds.len(), 10);
        assert!(adds.iter().all(|l| l.inputs.len() == 2));
        let project = manifest.layers.iter().find(|l| l.name == "block_16_project").unwrap();
        assert_eq!(project.activation, "none");

        let web: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(export_root.join("web/model/model.json")).unwrap()).unwrap();
        assert_eq!(web["userDefinedMetadata"]["classes"], serde_json::json!(["a", "b"]));
        let shard_bytes: u64 = web["weightsManifest"][0]["paths"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| std::fs::metadata(export_root.join("web/model").join(p.as_str().unwrap())).unwrap().len())
            .sum();
        let expected: u64 = web["weightsManifest"][0]["weights"]
            .as_array()
            .unwrap()
            .iter()
            .map(|w| {
                w["shape"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|d| d.as_u64().unwrap())
                    .product::<u64>()
                    * 4
            })
            .sum();
        assert_eq!(shard_bytes, expected);

        let engine = InferenceEngine::<NdArray>::load(export_root.join("cloud/model/model.tar.gz"), &device).unwrap();
        assert_eq!(engine.config().class_labels, info.classes);
        assert_eq!(engine.config().image_size, 32);
    }

    #[test]
    fn test_failure_does_not_stop_other_formats() {
        let dir = tempfile::tempdir().unwrap();
        let (model, metadata, calibration) = fixture(&dir.path().join("images"));
        let export_root = dir.path().join("out");
        let settings = ExportSettings::default();
        let device = Default::default();
        let ctx = ExportContext {
            model: &model,
            metadata: &metadata,
            settings: &settings,
            export_root: &export_root,
            calibration: &calibration,
            device: &device,
        };

        let exporters: Vec<Box<dyn ModelExporter<NdArray>>> = vec![Box::new(Failing), Box::new(ClassInfoExporter)];
        let report = export_all(&exporters, &ctx);
        assert!(!report.is_success());
        assert_eq!(report.failed[0].0, "failing");
        assert!(report.failed[0].1.contains("disk full"));
        assert_eq!(report.succeeded.len(), 1);
        assert!(export_root.join("cloud/model/class_info.json").exists());
    }

    #[test]
    fn test_calibration_sample_is_capped_per_class() {
        let dir = tempfile::tempdir().unwrap();
        let train = dir.path().join(TRAIN_DIR);
        for i in 0..5 {
            write_image(&train, "a", &format!("{}.png", i), &leaf_image(8, 8, i));
        }
        write_image(&train, "b", "0.png", &leaf_image(8, 8, 7));
        let vocab = ClassVocabulary::from_names(&["a", "b"]);
        let sample = calibration_sample(dir.path(), &vocab, 3).unwrap();
        assert_eq!(sample.len(), 4);
        assert!(calibration_sample(&dir.path().join("missing"), &vocab, 3).unwrap().is_empty());
    }
}
