//! モデル推論機能

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::ml::ml_model::{fit_to_size, image_to_chw, Classifier};
use crate::ml::training::argmax_rows;
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};

/// 1枚の画像に対する推論結果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    #[serde(rename = "class")]
    pub class: String,
    pub confidence: f32,
    pub all_probabilities: BTreeMap<String, f32>,
}

/// モデルの重みをフル精度のバイナリにする
pub fn model_to_bytes<B: Backend>(model: Classifier<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// メタデータとバイナリからモデルを復元する
pub fn model_from_bytes<B: Backend>(metadata: &ModelMetadata, bytes: Vec<u8>, device: &B::Device) -> Result<Classifier<B>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(bytes, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    Ok(metadata.model_config.init::<B>(device).load_record(record))
}

/// 推論エンジン
///
/// モデルとクラス一覧はプロセス起動時に1度だけ読み込みます。
pub struct InferenceEngine<B: Backend> {
    model: Classifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルバンドル (tar.gz) を読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())
            .context(format!("Failed to load model bundle: {:?}", model_path.as_ref()))?;
        let model = model_from_bytes::<B>(&metadata, model_binary, device)?;
        tracing::info!(
            "モデルを読み込みました: {} クラス, 入力 {}x{}",
            metadata.num_classes(),
            metadata.image_size,
            metadata.image_size
        );
        Ok(Self::from_parts(model, InferenceConfig::from_metadata(&metadata), device.clone()))
    }

    pub fn from_parts(model: Classifier<B>, config: InferenceConfig, device: B::Device) -> Self {
        Self { model, config, device }
    }

    /// RGB 画像を分類（入力サイズへのリサイズと [0, 1] への正規化のみ行う）
    pub fn classify_image(&self, img: RgbImage) -> Result<Prediction> {
        let size = self.config.image_size;
        let data = image_to_chw(&fit_to_size(img, size));
        let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([1, 3, size, size]);

        let probabilities = self
            .model
            .probabilities(tensor)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let num_classes = self.config.num_classes();
        if probabilities.len() != num_classes {
            anyhow::bail!(
                "モデル出力 {} 個とクラス数 {} が一致しません",
                probabilities.len(),
                num_classes
            );
        }

        let class_idx = argmax_rows(&probabilities, num_classes)
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))?;
        let class_name = self
            .config
            .class_index_to_label(class_idx)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_idx))?;

        Ok(Prediction {
            class: class_name.to_string(),
            confidence: probabilities[class_idx],
            all_probabilities: self
                .config
                .class_labels
                .iter()
                .cloned()
                .zip(probabilities.iter().copied())
                .collect(),
        })
    }

    /// エンコード済み画像バイト列を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let img = image::load_from_memory(bytes).context("Failed to decode image")?.to_rgb8();
        self.classify_image(img)
    }

    /// 画像ファイルを分類
    pub fn classify_path<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let img = image::open(image_path.as_ref())
            .context(format!("Failed to open image: {:?}", image_path.as_ref()))?
            .to_rgb8();
        self.classify_image(img)
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::leaf_image;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::save_model_with_metadata;
    use burn::backend::NdArray;

    fn bundle(dir: &Path) -> std::path::PathBuf {
        let device = Default::default();
        let config = ModelConfig::new(2).with_image_size(32);
        let model = config.init::<NdArray>(&device);
        let metadata = ModelMetadata::new(vec!["healthy_leaf".into(), "septoria_leaf".into()], config, 1, 0.5);
        save_model_with_metadata(&dir.join("model"), &metadata, &model_to_bytes(model).unwrap()).unwrap()
    }

    #[test]
    fn test_classify_bytes_returns_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let engine = InferenceEngine::<NdArray>::load(bundle(dir.path()), &Default::default()).unwrap();

        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(leaf_image(50, 40, 1))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let prediction = engine.classify_bytes(&png).unwrap();

        let sum: f32 = prediction.all_probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert_eq!(prediction.all_probabilities.len(), 2);
        assert_eq!(prediction.all_probabilities[&prediction.class], prediction.confidence);
        assert!(prediction.all_probabilities.values().all(|&p| p <= prediction.confidence));
    }

    #[test]
    fn test_classify_bytes_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = InferenceEngine::<NdArray>::load(bundle(dir.path()), &Default::default()).unwrap();
        assert!(engine.classify_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn test_prediction_serializes_class_key() {
        let prediction = Prediction {
            class: "healthy_leaf".into(),
            confidence: 0.9,
            all_probabilities: BTreeMap::from([("healthy_leaf".to_string(), 0.9)]),
        };
        let json = serde_json::to_value(&prediction).unwrap();
        assert_eq!(json["class"], "healthy_leaf");
        assert!(json["all_probabilities"].is_object());
    }
}
