//! 機械学習モデルの共通定義
//!
//! 転移学習用の分類器（凍結可能なバックボーン + 小さな分類ヘッド）と
//! 画像読み込みを提供します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, RgbImage};
use std::path::Path;

use crate::ml::backbone::{Backbone, BackboneConfig};

/// 既定の入力画像サイズ
pub const IMAGE_SIZE: usize = 96;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 96)]
    pub image_size: usize,
    /// バックボーンの幅倍率
    #[config(default = 0.35)]
    pub width_multiplier: f32,
    /// ヘッド中間層のユニット数
    #[config(default = 16)]
    pub hidden_units: usize,
    /// ドロップアウト率
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl ModelConfig {
    pub fn backbone(&self) -> BackboneConfig {
        BackboneConfig::new().with_width_multiplier(self.width_multiplier)
    }

    /// モデルを初期化
    ///
    /// 初期状態ではバックボーン全層が凍結されています。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let backbone_config = self.backbone();
        let features = backbone_config.out_channels();
        let backbone = backbone_config.init(device);
        let frozen_layers = backbone.num_layers();

        tracing::debug!(
            "[Model] 入力 {}x{}, バックボーン {} 層 -> {} ch, ヘッド {} -> {} -> {}",
            self.image_size,
            self.image_size,
            frozen_layers,
            features,
            features,
            self.hidden_units,
            self.num_classes
        );

        Classifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(features, self.hidden_units).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            activation: Relu::new(),
            frozen_layers,
        }
    }
}

/// 葉の病害分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2 バックボーン（52 畳み込み層、先頭 `frozen_layers` 層は勾配を流さない）
/// - Global Average Pooling
/// - FC: C -> 16 + ReLU
/// - Dropout
/// - FC: 16 -> num_classes
/// - Softmax（推論時・損失計算時）
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub dropout: Dropout,
    pub fc2: Linear<B>,
    pub activation: Relu,
    /// 凍結するバックボーン先頭の層数
    pub frozen_layers: usize,
}

impl<B: Backend> Classifier<B> {
    /// 先頭 `n` 層を凍結する（バックボーン層数で頭打ち）
    pub fn with_frozen_layers(mut self, n: usize) -> Self {
        self.frozen_layers = n.min(self.backbone.num_layers());
        self
    }

    /// 末尾 `k` 層（Keras の MobileNetV2 で数えた層数）以外をすべて凍結する
    pub fn with_trainable_tail(self, k: usize) -> Self {
        let n = self.backbone.frozen_for_trainable_tail(k);
        self.with_frozen_layers(n)
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]、値域 [0, 1]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward_frozen(images, self.frozen_layers);
        self.head(features)
    }

    /// GAP 以降の分類ヘッド
    pub fn head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();
        let x = self.pool.forward(features).reshape([batch_size, channels]);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// RGB 画像を [0, 1] の CHW 配列に平坦化
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);
    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(img.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }
    data
}

/// 必要なら `size` x `size` にリサイズする
pub fn fit_to_size(img: RgbImage, size: usize) -> RgbImage {
    let size = size as u32;
    if img.dimensions() == (size, size) {
        img
    } else {
        image::imageops::resize(&img, size, size, FilterType::Triangle)
    }
}

/// 画像を読み込んで CHW 配列にする
pub fn load_image_chw(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)?.to_rgb8();
    Ok(image_to_chw(&fit_to_size(img, size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    fn small_config() -> ModelConfig {
        ModelConfig::new(2).with_image_size(32)
    }

    #[test]
    fn test_forward_output_shape() {
        let device = Default::default();
        let model = small_config().init::<NdArray>(&device);
        let x = Tensor::<NdArray, 4>::zeros([3, 3, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [3, 2]);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let device = Default::default();
        let model = small_config().init::<NdArray>(&device);
        let x = Tensor::<NdArray, 4>::random([2, 3, 32, 32], burn::tensor::Distribution::Uniform(0.0, 1.0), &device);
        let probs: Vec<f32> = model.probabilities(x).into_data().to_vec().unwrap();
        for row in probs.chunks(2) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_freeze_bounds() {
        let device = Default::default();
        let model = small_config().init::<NdArray>(&device);
        assert_eq!(model.frozen_layers, 52);
        let model = model.with_trainable_tail(20);
        assert_eq!(model.frozen_layers, 45);
        let model = model.with_trainable_tail(1_000);
        assert_eq!(model.frozen_layers, 0);
        let model = model.with_frozen_layers(100);
        assert_eq!(model.frozen_layers, 52);
    }

    #[test]
    fn test_gradients_stop_at_frozen_prefix() {
        type B = burn::backend::Autodiff<NdArray>;
        let device = Default::default();
        let model = small_config().init::<B>(&device).with_trainable_tail(20);
        let x = Tensor::<B, 4>::ones([1, 3, 32, 32], &device);
        let grads = model.forward(x).sum().backward();

        assert!(model.backbone.stem.conv.weight.grad(&grads).is_none());
        assert!(model.backbone.blocks[14].project.conv.weight.grad(&grads).is_none());
        let block15 = model.backbone.blocks[15].expand.as_ref().unwrap();
        assert!(block15.conv.weight.grad(&grads).is_some());
        assert!(model.backbone.head.conv.weight.grad(&grads).is_some());
        assert!(model.fc2.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_image_to_chw_layout() {
        let img = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 255, 51]) });
        let data = image_to_chw(&img);
        assert_eq!(data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.2]);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = ModelConfig::new(4).with_dropout(0.1);
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_classes, 4);
        assert_eq!(back.image_size, 96);
        assert_eq!(back.dropout, 0.1);
    }
}
