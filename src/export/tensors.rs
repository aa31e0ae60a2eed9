//! エクスポート用の重み抽出
//!
//! burn のモジュールから重みを CPU 側の配列として取り出し、
//! BatchNorm を直前の畳み込みに畳み込みます。

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

use crate::ml::backbone::{ConvBn, LayerSpec};
use crate::ml::ml_model::{Classifier, ModelConfig};

/// 形状付きの f32 配列（行優先）
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl DenseTensor {
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("テンソルの取得エラー: {:?}", e))?;
        Ok(Self { shape, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// [O, I, KH, KW] を [O, KH, KW, I] に並べ替える
    pub fn oihw_to_ohwi(&self) -> Self {
        let [o, i, kh, kw] = dims4(&self.shape);
        let mut out = vec![0.0; self.values.len()];
        for a in 0..o {
            for b in 0..i {
                for y in 0..kh {
                    for x in 0..kw {
                        out[((a * kh + y) * kw + x) * i + b] = self.values[((a * i + b) * kh + y) * kw + x];
                    }
                }
            }
        }
        Self {
            shape: vec![o, kh, kw, i],
            values: out,
        }
    }

    /// [O, I, KH, KW] を [KH, KW, I, O] に並べ替える
    pub fn oihw_to_hwio(&self) -> Self {
        let [o, i, kh, kw] = dims4(&self.shape);
        let mut out = vec![0.0; self.values.len()];
        for a in 0..o {
            for b in 0..i {
                for y in 0..kh {
                    for x in 0..kw {
                        out[((y * kw + x) * i + b) * o + a] = self.values[((a * i + b) * kh + y) * kw + x];
                    }
                }
            }
        }
        Self {
            shape: vec![kh, kw, i, o],
            values: out,
        }
    }

    /// 2次元配列の転置
    pub fn transpose2(&self) -> Self {
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut out = vec![0.0; self.values.len()];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = self.values[r * cols + c];
            }
        }
        Self {
            shape: vec![cols, rows],
            values: out,
        }
    }
}

fn dims4(shape: &[usize]) -> [usize; 4] {
    [shape[0], shape[1], shape[2], shape[3]]
}

/// BatchNorm を畳み込み済みの畳み込み層
#[derive(Debug, Clone)]
pub struct FoldedConv {
    pub spec: LayerSpec,
    /// [out, in / groups, k, k]
    pub weight: DenseTensor,
    pub bias: Vec<f32>,
}

/// BatchNorm 畳み込み済みの反転残差ブロック
#[derive(Debug, Clone)]
pub struct FoldedBlock {
    pub expand: Option<FoldedConv>,
    pub depthwise: FoldedConv,
    pub project: FoldedConv,
    /// 入力を出力に足す
    pub residual: bool,
}

impl FoldedBlock {
    pub fn convs(&self) -> impl Iterator<Item = &FoldedConv> {
        self.expand.iter().chain([&self.depthwise, &self.project])
    }
}

/// 全結合層（重みは burn と同じ [in, out]）
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weight: DenseTensor,
    pub bias: Vec<f32>,
}

/// モデル全体の重み
#[derive(Debug, Clone)]
pub struct ModelTensors {
    pub stem: FoldedConv,
    pub blocks: Vec<FoldedBlock>,
    pub head: FoldedConv,
    pub hidden: DenseLayer,
    pub output: DenseLayer,
}

impl ModelTensors {
    /// 全ての畳み込み層（順伝播の順）
    pub fn convs(&self) -> Vec<&FoldedConv> {
        let mut convs = vec![&self.stem];
        for block in &self.blocks {
            convs.extend(block.convs());
        }
        convs.push(&self.head);
        convs
    }

    pub fn num_params(&self) -> usize {
        self.convs().iter().map(|c| c.weight.len() + c.bias.len()).sum::<usize>()
            + self.hidden.weight.len()
            + self.hidden.bias.len()
            + self.output.weight.len()
            + self.output.bias.len()
    }
}

/// y = gamma * (conv(x) - mean) / sqrt(var + eps) + beta を conv'(x) + b' にまとめる
pub fn fold_batch_norm<B: Backend>(layer: &ConvBn<B>, spec: LayerSpec) -> Result<FoldedConv> {
    let weight = DenseTensor::from_tensor(layer.conv.weight.val())?;
    let gamma = DenseTensor::from_tensor(layer.norm.gamma.val())?.values;
    let beta = DenseTensor::from_tensor(layer.norm.beta.val())?.values;
    let mean = DenseTensor::from_tensor(layer.norm.running_mean.value())?.values;
    let var = DenseTensor::from_tensor(layer.norm.running_var.value())?.values;
    let eps = layer.norm.epsilon as f32;

    let out_channels = weight.shape[0];
    let per_out = weight.len() / out_channels.max(1);
    let mut values = weight.values;
    let mut bias = Vec::with_capacity(out_channels);
    for c in 0..out_channels {
        let factor = gamma[c] / (var[c] + eps).sqrt();
        for v in &mut values[c * per_out..(c + 1) * per_out] {
            *v *= factor;
        }
        bias.push(beta[c] - mean[c] * factor);
    }

    Ok(FoldedConv {
        spec,
        weight: DenseTensor {
            shape: weight.shape,
            values,
        },
        bias,
    })
}

fn dense<B: Backend>(linear: &burn::nn::Linear<B>) -> Result<DenseLayer> {
    let weight = DenseTensor::from_tensor(linear.weight.val())?;
    let bias = match &linear.bias {
        Some(bias) => DenseTensor::from_tensor(bias.val())?.values,
        None => vec![0.0; weight.shape[1]],
    };
    Ok(DenseLayer { weight, bias })
}

/// 分類器から全ての重みを取り出す
pub fn extract_tensors<B: Backend>(model: &Classifier<B>, config: &ModelConfig) -> Result<ModelTensors> {
    let layout = config.backbone().layout();
    let backbone = &model.backbone;
    if layout.blocks.len() != backbone.blocks.len() || layout.layers().len() != backbone.num_layers() {
        anyhow::bail!(
            "モデル設定の層数 {} と実際の層数 {} が一致しません",
            layout.layers().len(),
            backbone.num_layers()
        );
    }

    let blocks = layout
        .blocks
        .iter()
        .zip(&backbone.blocks)
        .map(|(spec, block)| {
            let expand = match (spec.expand, &block.expand) {
                (Some(spec), Some(layer)) => Some(fold_batch_norm(layer, spec)?),
                (None, None) => None,
                _ => anyhow::bail!("拡張層の有無がモデル設定と一致しません"),
            };
            Ok(FoldedBlock {
                expand,
                depthwise: fold_batch_norm(&block.depthwise, spec.depthwise)?,
                project: fold_batch_norm(&block.project, spec.project)?,
                residual: spec.residual,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelTensors {
        stem: fold_batch_norm(&backbone.stem, layout.stem)?,
        blocks,
        head: fold_batch_norm(&backbone.head, layout.head)?,
        hidden: dense(&model.fc1)?,
        output: dense(&model.fc2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::module::Param;

    #[test]
    fn test_layout_permutations() {
        // O=2, I=1, KH=1, KW=2
        let t = DenseTensor {
            shape: vec![2, 1, 1, 2],
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let hwio = t.oihw_to_hwio();
        assert_eq!(hwio.shape, vec![1, 2, 1, 2]);
        assert_eq!(hwio.values, vec![1.0, 3.0, 2.0, 4.0]);

        let ohwi = t.oihw_to_ohwi();
        assert_eq!(ohwi.shape, vec![2, 1, 2, 1]);
        assert_eq!(ohwi.values, vec![1.0, 2.0, 3.0, 4.0]);

        let m = DenseTensor {
            shape: vec![2, 3],
            values: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        assert_eq!(m.transpose2().values, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_folded_conv_matches_conv_bn() {
        let device = Default::default();
        let config = ModelConfig::new(2).with_image_size(32);
        let mut model = config.init::<NdArray>(&device);

        // 非自明な BatchNorm 統計を設定
        let first = &mut model.backbone.stem;
        let channels = first.norm.gamma.dims()[0];
        first.norm.gamma = Param::from_tensor(Tensor::<NdArray, 1>::ones([channels], &device).mul_scalar(1.5));
        first.norm.beta = Param::from_tensor(Tensor::<NdArray, 1>::ones([channels], &device).mul_scalar(0.25));

        let tensors = extract_tensors(&model, &config).unwrap();
        assert_eq!(tensors.convs().len(), 52);
        assert_eq!(tensors.blocks.iter().filter(|b| b.residual).count(), 10);
        let folded = &tensors.stem;

        // 1x1 の入力位置だけを使って中心出力を比較する
        let x = Tensor::<NdArray, 4>::ones([1, 3, 3, 3], &device);
        let layer = &model.backbone.stem;
        let reference: Vec<f32> = layer
            .norm
            .forward(layer.conv.forward(x))
            .into_data()
            .to_vec()
            .unwrap();
        // 3x3/2, padding 1 の出力は 2x2。出力 (0,0) は入力の 2x2 部分だけを見る
        let per_out = 3 * 3 * 3;
        for c in 0..folded.bias.len() {
            let w = &folded.weight.values[c * per_out..(c + 1) * per_out];
            let mut acc = folded.bias[c];
            for ic in 0..3 {
                for ky in 1..3 {
                    for kx in 1..3 {
                        acc += w[(ic * 3 + ky) * 3 + kx];
                    }
                }
            }
            assert!((acc - reference[c * 4]).abs() < 1e-4, "channel {}", c);
        }
    }
}
