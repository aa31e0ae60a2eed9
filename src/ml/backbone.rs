//! MobileNetV2 特徴抽出器（バックボーン）
//!
//! ステム 3x3/2 → 反転残差ブロック 17 個 → 1x1 畳み込み (1280ch) の構成です。
//! 各ブロックは 1x1 拡張 → 3x3 depthwise → 1x1 射影で、ストライド 1 かつ
//! 入出力チャネルが等しい場合は入力を足し合わせます。
//! チャネル数は幅倍率（既定 0.35）で縮小し、8 の倍数に丸めます。
//!
//! 事前学習済み重みは torchvision の `mobilenet_v2` と同じキー構成
//! (`features.N...`) の PyTorch ファイル、または burn の `.mpk` レコードから読み込みます。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// (拡張率 t, 幅倍率 1.0 での出力チャネル c, 繰り返し n, 最初のストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];
const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// 層の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// 通常の畳み込み（ステム）
    Standard,
    Depthwise,
    Pointwise,
}

/// 1層分の形状情報（エクスポート時にも参照する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub groups: usize,
    /// ReLU6 を通すか（射影層は線形）
    pub relu6: bool,
}

impl LayerSpec {
    pub fn padding(&self) -> usize {
        self.kernel / 2
    }

    fn pointwise(in_channels: usize, out_channels: usize, relu6: bool) -> Self {
        Self {
            kind: LayerKind::Pointwise,
            in_channels,
            out_channels,
            kernel: 1,
            stride: 1,
            groups: 1,
            relu6,
        }
    }

    fn depthwise(channels: usize, stride: usize) -> Self {
        Self {
            kind: LayerKind::Depthwise,
            in_channels: channels,
            out_channels: channels,
            kernel: 3,
            stride,
            groups: channels,
            relu6: true,
        }
    }

    fn init<B: Backend>(&self, device: &B::Device) -> ConvBn<B> {
        ConvBn {
            conv: Conv2dConfig::new([self.in_channels, self.out_channels], [self.kernel, self.kernel])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(self.padding(), self.padding()))
                .with_groups(self.groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.out_channels).init(device),
        }
    }
}

/// 反転残差ブロックの形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    /// 拡張率 1 のブロックには拡張層が無い
    pub expand: Option<LayerSpec>,
    pub depthwise: LayerSpec,
    pub project: LayerSpec,
    pub residual: bool,
}

impl BlockSpec {
    pub fn layers(&self) -> Vec<LayerSpec> {
        self.expand
            .into_iter()
            .chain([self.depthwise, self.project])
            .collect()
    }
}

/// バックボーン全体の形状
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneLayout {
    pub stem: LayerSpec,
    pub blocks: Vec<BlockSpec>,
    pub head: LayerSpec,
}

impl BackboneLayout {
    /// 全ての畳み込み層を順伝播の順に並べる
    pub fn layers(&self) -> Vec<LayerSpec> {
        let mut layers = vec![self.stem];
        for block in &self.blocks {
            layers.extend(block.layers());
        }
        layers.push(self.head);
        layers
    }
}

/// チャネル数を divisor の倍数に丸める（10% 以上小さくならないようにする）
fn make_divisible(value: f32, divisor: usize) -> usize {
    let d = divisor as f32;
    let mut rounded = (((value + d / 2.0) / d).floor() * d).max(d);
    if rounded < 0.9 * value {
        rounded += d;
    }
    rounded as usize
}

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// チャネル幅倍率
    #[config(default = 0.35)]
    pub width_multiplier: f32,
}

impl BackboneConfig {
    /// 各層の形状を列挙
    pub fn layout(&self) -> BackboneLayout {
        let width = |c: usize| make_divisible(c as f32 * self.width_multiplier, 8);

        let mut channels = width(STEM_CHANNELS);
        let stem = LayerSpec {
            kind: LayerKind::Standard,
            in_channels: 3,
            out_channels: channels,
            kernel: 3,
            stride: 2,
            groups: 1,
            relu6: true,
        };

        let mut blocks = Vec::new();
        for (expansion, base_out, repeats, first_stride) in INVERTED_RESIDUAL_SETTINGS {
            let out = width(base_out);
            for i in 0..repeats {
                let stride = if i == 0 { first_stride } else { 1 };
                let hidden = channels * expansion;
                blocks.push(BlockSpec {
                    expand: (expansion != 1).then(|| LayerSpec::pointwise(channels, hidden, true)),
                    depthwise: LayerSpec::depthwise(hidden, stride),
                    project: LayerSpec::pointwise(hidden, out, false),
                    residual: stride == 1 && channels == out,
                });
                channels = out;
            }
        }

        let head_channels = if self.width_multiplier > 1.0 {
            width(HEAD_CHANNELS)
        } else {
            HEAD_CHANNELS
        };
        let head = LayerSpec::pointwise(channels, head_channels, true);

        BackboneLayout { stem, blocks, head }
    }

    /// 最終層の出力チャネル数
    pub fn out_channels(&self) -> usize {
        self.layout().head.out_channels
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let layout = self.layout();
        let blocks = layout
            .blocks
            .iter()
            .map(|block| InvertedResidual {
                expand: block.expand.map(|spec| spec.init(device)),
                depthwise: block.depthwise.init(device),
                project: block.project.init(device),
                stride: block.depthwise.stride,
                in_channels: block.expand.unwrap_or(block.depthwise).in_channels,
                out_channels: block.project.out_channels,
            })
            .collect();

        Backbone {
            stem: layout.stem.init(device),
            blocks,
            head: layout.head.init(device),
        }
    }
}

/// Conv → BatchNorm
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }

    pub fn forward_relu6(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(x).clamp(0.0, 6.0)
    }
}

/// 反転残差ブロック
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub project: ConvBn<B>,
    pub stride: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn residual(&self) -> bool {
        self.stride == 1 && self.in_channels == self.out_channels
    }

    pub fn num_layers(&self) -> usize {
        2 + usize::from(self.expand.is_some())
    }

    /// `applied` はここまでに通過した層数。`frozen` 層目の直後で勾配を切る
    fn forward_frozen(&self, input: Tensor<B, 4>, applied: &mut usize, frozen: usize) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let frozen_input = *applied <= frozen;
        let mut outputs = Vec::with_capacity(3);
        let mut x = input.clone();

        if let Some(expand) = &self.expand {
            x = detach_at(expand.forward_relu6(x), applied, frozen);
            outputs.push(x.clone());
        }
        x = detach_at(self.depthwise.forward_relu6(x), applied, frozen);
        outputs.push(x.clone());
        x = detach_at(self.project.forward(x), applied, frozen);
        outputs.push(x.clone());

        if self.residual() {
            let skip = if frozen_input { input.detach() } else { input };
            x = x + skip;
        }
        (x, outputs)
    }
}

/// 層を1つ通過したことを記録し、凍結境界なら勾配を切る
fn detach_at<B: Backend>(x: Tensor<B, 4>, applied: &mut usize, frozen: usize) -> Tensor<B, 4> {
    *applied += 1;
    if *applied == frozen {
        x.detach()
    } else {
        x
    }
}

/// 各層とブロックの出力（量子化キャリブレーション用）
pub struct BackboneTrace<B: Backend> {
    /// 畳み込み層ごとの出力（活性化後）
    pub layers: Vec<Tensor<B, 4>>,
    /// ブロックごとの出力（残差加算後）
    pub blocks: Vec<Tensor<B, 4>>,
}

/// 特徴抽出器
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub head: ConvBn<B>,
}

impl<B: Backend> Backbone<B> {
    /// 畳み込み層の数
    pub fn num_layers(&self) -> usize {
        2 + self.blocks.iter().map(|b| b.num_layers()).sum::<usize>()
    }

    /// Keras の MobileNetV2 で数えた場合の、各畳み込み層が占める層数
    ///
    /// Conv・BatchNorm・ReLU をそれぞれ1層とし、ストライド 2 の depthwise 前の
    /// ZeroPadding2D と残差加算の Add も直近の畳み込み層に含めます。
    pub fn reference_layer_counts(&self) -> Vec<usize> {
        let mut counts = vec![3];
        for block in &self.blocks {
            if block.expand.is_some() {
                counts.push(3);
            }
            counts.push(if block.stride > 1 { 4 } else { 3 });
            counts.push(if block.residual() { 3 } else { 2 });
        }
        counts.push(3);
        counts
    }

    /// 末尾 `k` 層（Keras 換算）を学習対象にしたときの凍結層数
    pub fn frozen_for_trainable_tail(&self, k: usize) -> usize {
        let counts = self.reference_layer_counts();
        let mut after = 0;
        let mut trainable = 0;
        for count in counts.iter().rev() {
            if after >= k {
                break;
            }
            trainable += 1;
            after += count;
        }
        counts.len() - trainable
    }

    /// 全層を通した特徴マップ [batch, C, H/32, W/32]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_frozen(x, 0)
    }

    /// 先頭 `frozen` 層に勾配を流さない順伝播
    pub fn forward_frozen(&self, x: Tensor<B, 4>, frozen: usize) -> Tensor<B, 4> {
        let mut applied = 0;
        let mut x = detach_at(self.stem.forward_relu6(x), &mut applied, frozen);
        for block in &self.blocks {
            x = block.forward_frozen(x, &mut applied, frozen).0;
        }
        detach_at(self.head.forward_relu6(x), &mut applied, frozen)
    }

    /// 各層・各ブロックの出力をすべて返す
    pub fn forward_collect(&self, x: Tensor<B, 4>) -> BackboneTrace<B> {
        let mut layers = Vec::with_capacity(self.num_layers());
        let mut blocks = Vec::with_capacity(self.blocks.len());
        let mut applied = 0;

        let mut x = self.stem.forward_relu6(x);
        layers.push(x.clone());
        for block in &self.blocks {
            let (out, block_layers) = block.forward_frozen(x, &mut applied, 0);
            layers.extend(block_layers);
            blocks.push(out.clone());
            x = out;
        }
        layers.push(self.head.forward_relu6(x));
        BackboneTrace { layers, blocks }
    }

    /// 事前学習済み重みを読み込む
    ///
    /// 拡張子が `.pt` / `.pth` なら torchvision 形式の PyTorch ファイル、
    /// それ以外は burn の `.mpk` レコードとして扱います。
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let is_pytorch = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("pt") | Some("pth")
        );
        if !is_pytorch {
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            return self
                .load_file(path.to_path_buf(), &recorder, device)
                .map_err(|e| anyhow::anyhow!("バックボーン重みの読み込みエラー {:?}: {:?}", path, e));
        }

        let args = torchvision_key_remaps()
            .into_iter()
            .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
                args.with_key_remap(&pattern, &replacement)
            });
        let record: BackboneRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| anyhow::anyhow!("PyTorch 重みの読み込みエラー {:?}: {:?}", path, e))?;
        Ok(self.load_record(record))
    }
}

/// torchvision `mobilenet_v2` の `features.*` キーをこのモジュール構成に対応付ける
pub fn torchvision_key_remaps() -> Vec<(String, String)> {
    let num_blocks: usize = INVERTED_RESIDUAL_SETTINGS.iter().map(|s| s.2).sum();
    let head = num_blocks + 1;

    let mut remaps = vec![
        (r"^features\.0\.0\.(.+)$".to_string(), "stem.conv.$1".to_string()),
        (r"^features\.0\.1\.(.+)$".to_string(), "stem.norm.$1".to_string()),
        (r"^features\.1\.conv\.0\.0\.(.+)$".to_string(), "blocks.0.depthwise.conv.$1".to_string()),
        (r"^features\.1\.conv\.0\.1\.(.+)$".to_string(), "blocks.0.depthwise.norm.$1".to_string()),
        (r"^features\.1\.conv\.1\.(.+)$".to_string(), "blocks.0.project.conv.$1".to_string()),
        (r"^features\.1\.conv\.2\.(.+)$".to_string(), "blocks.0.project.norm.$1".to_string()),
    ];
    for feature in 2..=num_blocks {
        let block = feature - 1;
        for (source, target) in [
            ("conv\\.0\\.0", "expand.conv"),
            ("conv\\.0\\.1", "expand.norm"),
            ("conv\\.1\\.0", "depthwise.conv"),
            ("conv\\.1\\.1", "depthwise.norm"),
            ("conv\\.2", "project.conv"),
            ("conv\\.3", "project.norm"),
        ] {
            remaps.push((
                format!(r"^features\.{}\.{}\.(.+)$", feature, source),
                format!("blocks.{}.{}.$1", block, target),
            ));
        }
    }
    remaps.push((format!(r"^features\.{}\.0\.(.+)$", head), "head.conv.$1".to_string()));
    remaps.push((format!(r"^features\.{}\.1\.(.+)$", head), "head.norm.$1".to_string()));
    remaps
}
