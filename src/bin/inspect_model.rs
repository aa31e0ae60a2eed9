//! 学習済みモデル・組み込み用モデルの中身を確認するためのバイナリ
//!
//! 使い方: inspect_model <model.tar.gz | tomato_model.tqm> [画像...]
//!
//! バンドルに画像を続けて渡すと、CPU で分類した結果も表示します。

use tomato_detector_lib::export::embedded::read_embedded;
use tomato_detector_lib::ml::{CpuBackend, InferenceEngine};
use tomato_detector_lib::model::{load_metadata, print_metadata_info, InferenceConfig};
use std::path::{Path, PathBuf};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let model_path = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from("artifacts/model.tar.gz")
    };

    let is_embedded = model_path.extension().map(|e| e == "tqm").unwrap_or(false);
    let images: Vec<PathBuf> = args.iter().skip(2).map(PathBuf::from).collect();
    let ok = if is_embedded {
        inspect_embedded(&model_path)
    } else {
        inspect_bundle(&model_path) && classify_images(&model_path, &images)
    };
    if !ok {
        std::process::exit(1);
    }
}

fn inspect_bundle(model_path: &Path) -> bool {
    match load_metadata(model_path) {
        Ok(metadata) => {
            println!("✓ モデルメタデータ読み込み成功: {}", model_path.display());
            print_metadata_info(&metadata);
            InferenceConfig::from_metadata(&metadata).print_info();
            true
        }
        Err(e) => {
            eprintln!("✗ エラー: {:#}", e);
            false
        }
    }
}

fn classify_images(model_path: &Path, images: &[PathBuf]) -> bool {
    if images.is_empty() {
        return true;
    }
    let engine = match InferenceEngine::<CpuBackend>::load(model_path, &Default::default()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("✗ モデル読み込みエラー: {:#}", e);
            return false;
        }
    };

    println!("\n=== 分類結果 ===");
    let mut ok = true;
    for image in images {
        match engine.classify_path(image) {
            Ok(prediction) => {
                println!("{}: {} ({:.1}%)", image.display(), prediction.class, prediction.confidence * 100.0);
            }
            Err(e) => {
                eprintln!("✗ {}: {:#}", image.display(), e);
                ok = false;
            }
        }
    }
    ok
}

fn inspect_embedded(model_path: &Path) -> bool {
    let bytes = match std::fs::read(model_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("✗ 読み込みエラー: {}", e);
            return false;
        }
    };

    match read_embedded(&bytes) {
        Ok((manifest, payload)) => {
            println!("✓ 組み込み用モデル: {}", model_path.display());
            println!("  バージョン: {}", manifest.version);
            println!("  クラス: {}", manifest.classes.join(", "));
            println!("  入力: {:?} {} (scale={}, zp={})", manifest.input.shape, manifest.input.dtype,
                manifest.input.quant.scale, manifest.input.quant.zero_point);
            println!("  出力: {:?} {}", manifest.output.shape, manifest.output.dtype);
            println!("  キャリブレーション画像: {} 枚", manifest.calibration_images);
            println!("  重みレイアウト: {}", manifest.weight_layout);
            println!("  レイヤー数: {}", manifest.layers.len());
            for layer in &manifest.layers {
                println!("    {:<12} {:<16} act={}", layer.name, layer.op, layer.activation);
            }
            println!("  ペイロード: {} バイト", payload.len());
            true
        }
        Err(e) => {
            eprintln!("✗ エラー: {:#}", e);
            false
        }
    }
}
