//! 組み込み向け（ESP32）の int8 量子化モデル
//!
//! ファイル構成 (`tomato_model.tqm`):
//! - マジック `TQM1`（4バイト）
//! - マニフェスト長 u32 リトルエンディアン
//! - マニフェスト JSON
//! - テンソル本体（各テンソルは 4 バイト境界に配置）
//!
//! 重みは per-tensor 対称 int8、バイアスは int32（スケール = 入力スケール × 重みスケール）。
//! 活性化は uint8 で、代表画像を流して得た範囲からスケールを決めます。
//! ReLU6 の出力はゼロ点 0、線形の射影層と残差加算はゼロ点付きで表します。
//! ファームウェアに組み込めるよう同じバイト列を C ヘッダにも書き出します。

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::export::tensors::{extract_tensors, DenseTensor, FoldedBlock, FoldedConv};
use crate::export::{ExportContext, ModelExporter};
use crate::ml::backbone::LayerKind;
use crate::ml::ml_model::{load_image_chw, Classifier};

pub const MAGIC: &[u8; 4] = b"TQM1";
pub const MODEL_FILE: &str = "tomato_model.tqm";
pub const HEADER_FILE: &str = "tomato_model_data.h";

/// キャリブレーション時のバッチサイズ
const CALIBRATION_BATCH: usize = 16;

/// 入力は 0-255 の生画素
const INPUT_SCALE: f32 = 1.0 / 255.0;
/// softmax 出力は [0, 1) を 256 段階で表す
const OUTPUT_SCALE: f32 = 1.0 / 256.0;

/// 量子化パラメータ（real = scale × (q - zero_point)）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// [0, max] を uint8 に割り当てる
    pub fn unsigned(max: f32) -> Self {
        Self {
            scale: max.max(1e-6) / 255.0,
            zero_point: 0,
        }
    }

    /// [min, max]（0 を含むよう拡張）を uint8 に割り当てる
    pub fn asymmetric(min: f32, max: f32) -> Self {
        let (min, max) = (min.min(0.0), max.max(0.0));
        let scale = (max - min).max(1e-6) / 255.0;
        Self {
            scale,
            zero_point: (-min / scale).round().clamp(0.0, 255.0) as i32,
        }
    }
}

/// 対称 int8 のスケール（最大絶対値 / 127）
pub fn symmetric_scale(values: &[f32]) -> f32 {
    let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max_abs == 0.0 {
        1.0
    } else {
        max_abs / 127.0
    }
}

pub fn quantize_int8(values: &[f32], scale: f32) -> Vec<i8> {
    values
        .iter()
        .map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8)
        .collect()
}

pub fn quantize_bias(values: &[f32], scale: f32) -> Vec<i32> {
    values
        .iter()
        .map(|v| (*v as f64 / scale as f64).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
        .collect()
}

/// ペイロード内のテンソル位置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorRef {
    pub offset: usize,
    pub length: usize,
    pub shape: Vec<usize>,
    pub dtype: String,
    pub scale: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoSpec {
    pub shape: Vec<usize>,
    pub dtype: String,
    pub quant: QuantParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerEntry {
    pub name: String,
    pub op: String,
    /// 直前の層以外を入力に取る場合の入力層名（残差加算）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<usize>,
    pub activation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<TensorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<TensorRef>,
    pub output: QuantParams,
}

impl LayerEntry {
    /// 重みを持たない層
    fn plain(name: &str, op: &str, output: QuantParams) -> Self {
        Self {
            name: name.to_string(),
            op: op.to_string(),
            inputs: Vec::new(),
            kernel: None,
            stride: None,
            padding: None,
            activation: "none".to_string(),
            weights: None,
            bias: None,
            output,
        }
    }
}

/// `tomato_model.tqm` のマニフェスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedManifest {
    pub version: String,
    pub classes: Vec<String>,
    /// 重みのレイアウト（畳み込みは OHWI、全結合は [out, in]）
    pub weight_layout: String,
    pub input: IoSpec,
    pub output: IoSpec,
    pub calibration_images: usize,
    pub layers: Vec<LayerEntry>,
}

/// 代表画像から求めた活性化の範囲 (min, max)
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRanges {
    /// 各畳み込み層の出力
    pub layers: Vec<(f32, f32)>,
    /// 各ブロックの出力（残差加算後）
    pub blocks: Vec<(f32, f32)>,
    pub hidden_max: f32,
    pub logits: (f32, f32),
    pub images: usize,
}

impl ActivationRanges {
    /// 代表画像が無い場合の既定値
    fn fallback(layers: usize, blocks: usize) -> Self {
        Self {
            layers: vec![(-6.0, 6.0); layers],
            blocks: vec![(-6.0, 6.0); blocks],
            hidden_max: 6.0,
            logits: (-8.0, 8.0),
            images: 0,
        }
    }

    fn empty(layers: usize, blocks: usize, images: usize) -> Self {
        Self {
            layers: vec![(f32::MAX, f32::MIN); layers],
            blocks: vec![(f32::MAX, f32::MIN); blocks],
            hidden_max: 0.0,
            logits: (f32::MAX, f32::MIN),
            images,
        }
    }
}

fn tensor_max<B: Backend, const D: usize>(t: Tensor<B, D>) -> f32 {
    t.max().into_scalar().elem::<f32>()
}

fn tensor_min<B: Backend, const D: usize>(t: Tensor<B, D>) -> f32 {
    t.min().into_scalar().elem::<f32>()
}

fn widen<B: Backend>(range: &mut (f32, f32), t: Tensor<B, 4>) {
    range.0 = range.0.min(tensor_min(t.clone()));
    range.1 = range.1.max(tensor_max(t));
}

/// 代表画像を流して各層の出力範囲を集計する
pub fn calibrate<B: Backend>(
    model: &Classifier<B>,
    images: &[Vec<f32>],
    image_size: usize,
    device: &B::Device,
) -> ActivationRanges {
    let layers = model.backbone.num_layers();
    let blocks = model.backbone.blocks.len();
    if images.is_empty() {
        tracing::warn!("キャリブレーション画像がありません。既定の活性化範囲で量子化します");
        return ActivationRanges::fallback(layers, blocks);
    }

    let mut ranges = ActivationRanges::empty(layers, blocks, images.len());

    for chunk in images.chunks(CALIBRATION_BATCH) {
        let flat: Vec<f32> = chunk.iter().flatten().copied().collect();
        let x = Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([chunk.len(), 3, image_size, image_size]);

        let trace = model.backbone.forward_collect(x);
        for (range, out) in ranges.layers.iter_mut().zip(&trace.layers) {
            widen(range, out.clone());
        }
        for (range, out) in ranges.blocks.iter_mut().zip(&trace.blocks) {
            widen(range, out.clone());
        }
        let Some(features) = trace.layers.into_iter().last() else {
            continue;
        };
        let [batch, channels, _, _] = features.dims();
        let pooled = model.pool.forward(features).reshape([batch, channels]);
        let hidden = model.activation.forward(model.fc1.forward(pooled));
        ranges.hidden_max = ranges.hidden_max.max(tensor_max(hidden.clone()));
        let logits = model.fc2.forward(hidden);
        ranges.logits.0 = ranges.logits.0.min(tensor_min(logits.clone()));
        ranges.logits.1 = ranges.logits.1.max(tensor_max(logits));
    }
    ranges
}

/// テンソル本体を 4 バイト境界で追記していくバッファ
#[derive(Default)]
struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    fn align(&mut self) {
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(0);
        }
    }

    fn push_int8(&mut self, values: &[i8], shape: Vec<usize>, scale: f32) -> TensorRef {
        self.align();
        let offset = self.bytes.len();
        self.bytes.extend(values.iter().map(|v| *v as u8));
        TensorRef {
            offset,
            length: values.len(),
            shape,
            dtype: "int8".to_string(),
            scale,
        }
    }

    fn push_int32(&mut self, values: &[i32], scale: f32) -> TensorRef {
        self.align();
        let offset = self.bytes.len();
        for v in values {
            self.bytes.extend_from_slice(&v.to_le_bytes());
        }
        TensorRef {
            offset,
            length: values.len() * 4,
            shape: vec![values.len()],
            dtype: "int32".to_string(),
            scale,
        }
    }

    /// 重みとバイアスを量子化して追記する
    fn push_layer(&mut self, weight: &DenseTensor, bias: &[f32], input_scale: f32) -> (TensorRef, TensorRef) {
        let w_scale = symmetric_scale(&weight.values);
        let weights = self.push_int8(&quantize_int8(&weight.values, w_scale), weight.shape.clone(), w_scale);
        let b_scale = input_scale * w_scale;
        let bias = self.push_int32(&quantize_bias(bias, b_scale), b_scale);
        (weights, bias)
    }
}

/// 層を順に積み上げていく途中状態
struct GraphBuilder<'a> {
    payload: Payload,
    layers: Vec<LayerEntry>,
    ranges: &'a ActivationRanges,
    /// 次に使う `ranges.layers` の位置
    next_conv: usize,
    input_scale: f32,
}

impl GraphBuilder<'_> {
    fn last_name(&self) -> String {
        self.layers.last().map(|l| l.name.clone()).unwrap_or_else(|| "input".to_string())
    }

    fn push_conv(&mut self, name: String, conv: &FoldedConv) {
        let (min, max) = self.ranges.layers.get(self.next_conv).copied().unwrap_or((-6.0, 6.0));
        self.next_conv += 1;
        let output = if conv.spec.relu6 {
            QuantParams::unsigned(max.min(6.0))
        } else {
            QuantParams::asymmetric(min, max)
        };
        let (weights, bias) = self
            .payload
            .push_layer(&conv.weight.oihw_to_ohwi(), &conv.bias, self.input_scale);
        let op = match conv.spec.kind {
            LayerKind::Depthwise => "depthwise_conv2d",
            LayerKind::Standard | LayerKind::Pointwise => "conv2d",
        };
        self.layers.push(LayerEntry {
            kernel: Some(conv.spec.kernel),
            stride: Some(conv.spec.stride),
            padding: Some(conv.spec.padding()),
            activation: if conv.spec.relu6 { "relu6" } else { "none" }.to_string(),
            weights: Some(weights),
            bias: Some(bias),
            ..LayerEntry::plain(&name, op, output)
        });
        self.input_scale = output.scale;
    }

    fn push_block(&mut self, index: usize, block: &FoldedBlock) {
        let block_input = self.last_name();
        if let Some(expand) = &block.expand {
            self.push_conv(format!("block_{}_expand", index), expand);
        }
        self.push_conv(format!("block_{}_depthwise", index), &block.depthwise);
        self.push_conv(format!("block_{}_project", index), &block.project);

        if block.residual {
            let (min, max) = self.ranges.blocks.get(index).copied().unwrap_or((-6.0, 6.0));
            let output = QuantParams::asymmetric(min, max);
            let project = self.last_name();
            self.layers.push(LayerEntry {
                inputs: vec![block_input, project],
                ..LayerEntry::plain(&format!("block_{}_add", index), "add", output)
            });
            self.input_scale = output.scale;
        }
    }
}

/// 量子化済みモデルのバイト列を組み立てる
pub fn build_embedded<B: Backend>(
    model: &Classifier<B>,
    ctx: &ExportContext<'_, B>,
    ranges: &ActivationRanges,
) -> Result<(EmbeddedManifest, Vec<u8>)> {
    let tensors = extract_tensors(model, &ctx.metadata.model_config)?;
    let size = ctx.metadata.image_size;
    let mut graph = GraphBuilder {
        payload: Payload::default(),
        layers: Vec::with_capacity(tensors.convs().len() + tensors.blocks.len() + 4),
        ranges,
        next_conv: 0,
        input_scale: INPUT_SCALE,
    };

    graph.push_conv("stem".to_string(), &tensors.stem);
    for (i, block) in tensors.blocks.iter().enumerate() {
        graph.push_block(i, block);
    }
    graph.push_conv("head".to_string(), &tensors.head);

    // 平均プーリングは入力と同じ量子化パラメータ
    let pooled = QuantParams {
        scale: graph.input_scale,
        zero_point: 0,
    };
    let GraphBuilder {
        mut payload,
        mut layers,
        ..
    } = graph;
    layers.push(LayerEntry::plain("global_average_pool", "average_pool", pooled));

    let hidden_out = QuantParams::unsigned(ranges.hidden_max);
    let (weights, bias) = payload.push_layer(&tensors.hidden.weight.transpose2(), &tensors.hidden.bias, pooled.scale);
    layers.push(LayerEntry {
        activation: "relu".to_string(),
        weights: Some(weights),
        bias: Some(bias),
        ..LayerEntry::plain("dense_hidden", "fully_connected", hidden_out)
    });

    let logits_out = QuantParams::asymmetric(ranges.logits.0, ranges.logits.1);
    let (weights, bias) = payload.push_layer(&tensors.output.weight.transpose2(), &tensors.output.bias, hidden_out.scale);
    layers.push(LayerEntry {
        weights: Some(weights),
        bias: Some(bias),
        ..LayerEntry::plain("dense_output", "fully_connected", logits_out)
    });

    let output_quant = QuantParams {
        scale: OUTPUT_SCALE,
        zero_point: 0,
    };
    layers.push(LayerEntry::plain("softmax", "softmax", output_quant));

    let num_classes = ctx.metadata.num_classes();
    let manifest = EmbeddedManifest {
        version: ctx.settings.version.clone(),
        classes: ctx.metadata.class_labels.clone(),
        weight_layout: "OHWI".to_string(),
        input: IoSpec {
            shape: vec![1, size, size, 3],
            dtype: "uint8".to_string(),
            quant: QuantParams {
                scale: INPUT_SCALE,
                zero_point: 0,
            },
        },
        output: IoSpec {
            shape: vec![1, num_classes],
            dtype: "uint8".to_string(),
            quant: output_quant,
        },
        calibration_images: ranges.images,
        layers,
    };

    let json = serde_json::to_vec(&manifest)?;
    let mut bytes = Vec::with_capacity(8 + json.len() + payload.bytes.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&(json.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&json);
    bytes.extend_from_slice(&payload.bytes);
    Ok((manifest, bytes))
}

/// `tomato_model.tqm` のバイト列からマニフェストとペイロードを取り出す
pub fn read_embedded(bytes: &[u8]) -> Result<(EmbeddedManifest, &[u8])> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        anyhow::bail!("TQM1 形式ではありません");
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let end = 8 + len;
    if bytes.len() < end {
        anyhow::bail!("マニフェストが途中で切れています");
    }
    let manifest = serde_json::from_slice(&bytes[8..end]).context("Failed to parse embedded manifest")?;
    Ok((manifest, &bytes[end..]))
}

/// C ヘッダ形式に変換する
pub fn to_c_header(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 6 + 256);
    out.push_str("// tomato_detector export\n");
    out.push_str("#ifndef TOMATO_MODEL_DATA_H\n#define TOMATO_MODEL_DATA_H\n\n");
    out.push_str("const unsigned char g_model[] __attribute__((aligned(16))) = {\n");
    for line in bytes.chunks(12) {
        out.push_str("  ");
        for b in line {
            let _ = write!(out, "0x{:02x}, ", b);
        }
        out.push('\n');
    }
    out.push_str("};\n");
    let _ = writeln!(out, "const unsigned int g_model_len = {};", bytes.len());
    out.push_str("\n#endif  // TOMATO_MODEL_DATA_H\n");
    out
}

/// 組み込み向けエクスポーター
pub struct EmbeddedExporter;

impl<B: Backend> ModelExporter<B> for EmbeddedExporter {
    fn format(&self) -> &'static str {
        "embedded"
    }

    fn export(&self, ctx: &ExportContext<'_, B>) -> Result<Vec<PathBuf>> {
        let size = ctx.metadata.image_size;
        let images: Vec<Vec<f32>> = ctx
            .calibration
            .iter()
            .filter_map(|path| match load_image_chw(path, size) {
                Ok(data) => Some(data),
                Err(e) => {
                    tracing::warn!("キャリブレーション画像をスキップ {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        tracing::info!("[embedded] {} 枚でキャリブレーション中...", images.len());

        let ranges = calibrate(ctx.model, &images, size, ctx.device);
        let (manifest, bytes) = build_embedded(ctx.model, ctx, &ranges)?;

        let out_dir = ctx.export_root.join("esp32").join("model");
        std::fs::create_dir_all(&out_dir).context(format!("Failed to create {:?}", out_dir))?;
        let model_path = out_dir.join(MODEL_FILE);
        std::fs::write(&model_path, &bytes).context(format!("Failed to write {:?}", model_path))?;
        let header_path = out_dir.join(HEADER_FILE);
        std::fs::write(&header_path, to_c_header(&bytes)).context(format!("Failed to write {:?}", header_path))?;

        tracing::info!(
            "[embedded] {} 層, {:.1} KB",
            manifest.layers.len(),
            bytes.len() as f64 / 1024.0
        );
        Ok(vec![model_path, header_path])
    }
}
