//! ブラウザ向け（TF.js layers 形式）エクスポート
//!
//! `web/model/model.json` にトポロジーと重みマニフェストを書き、
//! float32 の重みを `group1-shard{i}of{n}.bin` に分割して保存します。
//! BatchNorm は畳み込みに畳み込み済みのため、各畳み込みはバイアス付きで出力します。
//! 残差加算があるため、トポロジーは functional 形式（`inbound_nodes` で接続）です。

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::export::tensors::{extract_tensors, DenseTensor, FoldedBlock, FoldedConv, ModelTensors};
use crate::export::{ExportContext, ModelExporter};
use crate::ml::backbone::LayerKind;
use crate::model::ModelMetadata;

pub const MODEL_JSON: &str = "model.json";
const INPUT_LAYER: &str = "input";
const OUTPUT_LAYER: &str = "dense_output";

/// 重みマニフェストの1エントリ
struct NamedWeight {
    name: String,
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl NamedWeight {
    fn new(name: String, tensor: DenseTensor) -> Self {
        Self {
            name,
            shape: tensor.shape,
            values: tensor.values,
        }
    }

    fn vector(name: String, values: &[f32]) -> Self {
        Self {
            name,
            shape: vec![values.len()],
            values: values.to_vec(),
        }
    }
}

/// Keras functional 形式のレイヤ列
struct LayerGraph {
    layers: Vec<Value>,
    weights: Vec<NamedWeight>,
    /// 直前に追加したレイヤ名
    last: String,
}

impl LayerGraph {
    /// `inputs` が空なら直前のレイヤにつなぐ
    fn add(&mut self, class_name: &str, name: &str, mut config: Value, inputs: &[String]) {
        config["name"] = json!(name);
        let inbound: Vec<Value> = if inputs.is_empty() {
            vec![json!([self.last, 0, 0, {}])]
        } else {
            inputs.iter().map(|input| json!([input, 0, 0, {}])).collect()
        };
        self.layers.push(json!({
            "class_name": class_name,
            "name": name,
            "config": config,
            "inbound_nodes": [inbound]
        }));
        self.last = name.to_string();
    }

    /// BN 畳み込み済みの畳み込み層（ReLU6 付きなら ReLU レイヤを続ける）
    fn add_conv(&mut self, name: &str, conv: &FoldedConv) {
        let spec = conv.spec;
        let padding = if spec.stride > 1 {
            let p = spec.padding();
            self.add("ZeroPadding2D", &format!("{}_pad", name), json!({"padding": [[p, p], [p, p]]}), &[]);
            "valid"
        } else {
            "same"
        };

        let hwio = conv.weight.oihw_to_hwio();
        match spec.kind {
            LayerKind::Depthwise => {
                self.add(
                    "DepthwiseConv2D",
                    name,
                    json!({
                        "kernel_size": [spec.kernel, spec.kernel],
                        "strides": [spec.stride, spec.stride], "padding": padding,
                        "depth_multiplier": 1, "use_bias": true, "activation": "linear"
                    }),
                    &[],
                );
                // [k, k, 1, C] と [k, k, C, 1] は同じ並び
                let shape = vec![spec.kernel, spec.kernel, spec.out_channels, 1];
                self.weights.push(NamedWeight::new(
                    format!("{}/depthwise_kernel", name),
                    DenseTensor { shape, values: hwio.values },
                ));
            }
            LayerKind::Standard | LayerKind::Pointwise => {
                self.add(
                    "Conv2D",
                    name,
                    json!({
                        "filters": spec.out_channels, "kernel_size": [spec.kernel, spec.kernel],
                        "strides": [spec.stride, spec.stride], "padding": padding,
                        "use_bias": true, "activation": "linear"
                    }),
                    &[],
                );
                self.weights.push(NamedWeight::new(format!("{}/kernel", name), hwio));
            }
        }
        self.weights.push(NamedWeight::vector(format!("{}/bias", name), &conv.bias));
        if spec.relu6 {
            self.add("ReLU", &format!("{}_relu6", name), json!({"max_value": 6.0}), &[]);
        }
    }

    fn add_block(&mut self, index: usize, block: &FoldedBlock) {
        let block_input = self.last.clone();
        if let Some(expand) = &block.expand {
            self.add_conv(&format!("block_{}_expand", index), expand);
        }
        self.add_conv(&format!("block_{}_depthwise", index), &block.depthwise);
        self.add_conv(&format!("block_{}_project", index), &block.project);
        if block.residual {
            let inputs = [block_input, self.last.clone()];
            self.add("Add", &format!("block_{}_add", index), json!({}), &inputs);
        }
    }
}

/// Keras 形式のレイヤ定義と、対応する重みを並べる
fn build_layers(tensors: &ModelTensors, metadata: &ModelMetadata) -> (Vec<Value>, Vec<NamedWeight>) {
    let size = metadata.image_size;
    let mut graph = LayerGraph {
        layers: vec![json!({
            "class_name": "InputLayer",
            "name": INPUT_LAYER,
            "config": {"batch_input_shape": [null, size, size, 3], "dtype": "float32", "name": INPUT_LAYER},
            "inbound_nodes": []
        })],
        weights: Vec::new(),
        last: INPUT_LAYER.to_string(),
    };

    graph.add_conv("stem", &tensors.stem);
    for (i, block) in tensors.blocks.iter().enumerate() {
        graph.add_block(i, block);
    }
    graph.add_conv("head", &tensors.head);

    let hidden_units = tensors.hidden.bias.len();
    graph.add("GlobalAveragePooling2D", "global_average_pool", json!({}), &[]);
    graph.add(
        "Dense",
        "dense_hidden",
        json!({"units": hidden_units, "activation": "relu", "use_bias": true}),
        &[],
    );
    graph.weights.push(NamedWeight::new("dense_hidden/kernel".to_string(), tensors.hidden.weight.clone()));
    graph.weights.push(NamedWeight::vector("dense_hidden/bias".to_string(), &tensors.hidden.bias));
    graph.add("Dropout", "dropout", json!({"rate": metadata.model_config.dropout}), &[]);
    graph.add(
        "Dense",
        OUTPUT_LAYER,
        json!({"units": metadata.num_classes(), "activation": "softmax", "use_bias": true}),
        &[],
    );
    graph.weights.push(NamedWeight::new("dense_output/kernel".to_string(), tensors.output.weight.clone()));
    graph.weights.push(NamedWeight::vector("dense_output/bias".to_string(), &tensors.output.bias));

    (graph.layers, graph.weights)
}

/// バイト列を最大 `shard_bytes` ごとに分割する
pub fn shard(bytes: &[u8], shard_bytes: usize) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return vec![bytes];
    }
    bytes.chunks(shard_bytes.max(4)).collect()
}

pub fn shard_name(index: usize, count: usize) -> String {
    format!("group1-shard{}of{}.bin", index + 1, count)
}

/// Web 向けエクスポーター
pub struct WebExporter;

impl<B: Backend> ModelExporter<B> for WebExporter {
    fn format(&self) -> &'static str {
        "web"
    }

    fn export(&self, ctx: &ExportContext<'_, B>) -> Result<Vec<PathBuf>> {
        let tensors = extract_tensors(ctx.model, &ctx.metadata.model_config)?;
        let (layers, weights) = build_layers(&tensors, ctx.metadata);

        let mut bytes = Vec::with_capacity(tensors.num_params() * 4);
        for w in &weights {
            for v in &w.values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }

        let shards = shard(&bytes, ctx.settings.web_shard_bytes);
        let paths: Vec<String> = (0..shards.len()).map(|i| shard_name(i, shards.len())).collect();

        let out_dir = ctx.export_root.join("web").join("model");
        std::fs::create_dir_all(&out_dir).context(format!("Failed to create {:?}", out_dir))?;

        let mut written = Vec::with_capacity(shards.len() + 1);
        for (name, data) in paths.iter().zip(&shards) {
            let path = out_dir.join(name);
            std::fs::write(&path, data).context(format!("Failed to write {:?}", path))?;
            written.push(path);
        }

        let manifest = json!({
            "format": "layers-model",
            "generatedBy": concat!("tomato_detector ", env!("CARGO_PKG_VERSION")),
            "convertedBy": null,
            "modelTopology": {
                "class_name": "Model",
                "config": {
                    "name": "tomato_classifier",
                    "layers": layers,
                    "input_layers": [[INPUT_LAYER, 0, 0]],
                    "output_layers": [[OUTPUT_LAYER, 0, 0]]
                }
            },
            "weightsManifest": [{
                "paths": paths,
                "weights": weights
                    .iter()
                    .map(|w| json!({"name": w.name, "shape": w.shape, "dtype": "float32"}))
                    .collect::<Vec<_>>()
            }],
            "userDefinedMetadata": {
                "classes": ctx.metadata.class_labels,
                "input_shape": [ctx.metadata.image_size, ctx.metadata.image_size, 3],
                "version": ctx.settings.version
            }
        });
        let json_path = out_dir.join(MODEL_JSON);
        std::fs::write(&json_path, serde_json::to_string_pretty(&manifest)?)
            .context(format!("Failed to write {:?}", json_path))?;
        written.insert(0, json_path);

        tracing::info!(
            "[web] {} パラメータ, {} シャード",
            tensors.num_params(),
            shards.len()
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_sizes() {
        let bytes = vec![0u8; 10];
        let shards = shard(&bytes, 4);
        assert_eq!(shards.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(shard(&[], 4).len(), 1);
    }

    #[test]
    fn test_shard_name() {
        assert_eq!(shard_name(0, 3), "group1-shard1of3.bin");
        assert_eq!(shard_name(2, 3), "group1-shard3of3.bin");
    }

    #[test]
    fn test_layers_wire_residual_adds() {
        use crate::ml::ml_model::ModelConfig;
        use burn::backend::NdArray;

        let device = Default::default();
        let config = ModelConfig::new(3).with_image_size(32);
        let model = config.init::<NdArray>(&device);
        let metadata = ModelMetadata::new(vec!["a".into(), "b".into(), "c".into()], config.clone(), 1, 0.0);
        let tensors = extract_tensors(&model, &config).unwrap();
        let (layers, weights) = build_layers(&tensors, &metadata);

        let adds: Vec<&Value> = layers.iter().filter(|l| l["class_name"] == "Add").collect();
        assert_eq!(adds.len(), 10);
        // block_2 は block_1 の出力と自身の射影を足す
        let add = layers.iter().find(|l| l["name"] == "block_2_add").unwrap();
        assert_eq!(add["inbound_nodes"][0][0][0], "block_1_project");
        assert_eq!(add["inbound_nodes"][0][1][0], "block_2_project");

        let names: Vec<&str> = layers.iter().filter_map(|l| l["name"].as_str()).collect();
        for layer in &layers[1..] {
            for inbound in layer["inbound_nodes"][0].as_array().unwrap() {
                let source = inbound[0].as_str().unwrap();
                assert!(names.contains(&source), "unknown inbound {}", source);
            }
        }
        assert_eq!(layers.last().unwrap()["name"], OUTPUT_LAYER);
        assert_eq!(weights.len(), 52 * 2 + 4);
        assert!(layers.iter().all(|l| l["config"]["name"] == l["name"]));
    }
}
