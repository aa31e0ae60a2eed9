//! 画像の前処理
//!
//! デコード → Lab 変換 → 輝度のみ CLAHE → RGB へ戻す → リサイズ → [0, 1] 正規化。
//! チャネル順はデコード時点で RGB に統一し、以降は入れ替えません。

use anyhow::{Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array3;
use ndarray_npy::WriteNpyExt;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::dataset::{clahe, list_class_dirs, list_images, output_stems};
use crate::error::PipelineError;
use crate::model::config::{OutputFormat, PreprocessSettings};

/// 前処理済み画像
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    /// コントラスト補正・リサイズ後の 8bit 画像
    pub image: RgbImage,
    /// [0, 1] に正規化した HWC 配列
    pub pixels: Array3<f32>,
}

impl PreprocessedImage {
    fn from_rgb(image: RgbImage) -> Self {
        let (w, h) = image.dimensions();
        let pixels = Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
            image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Self { image, pixels }
    }
}

/// 前処理器
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    settings: PreprocessSettings,
}

impl ImagePreprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    /// デコード済みの RGB 画像を前処理する
    pub fn process_image(&self, image: &RgbImage) -> PreprocessedImage {
        let enhanced = clahe::enhance_luminance(image, self.settings.clip_limit, self.settings.tile_grid);
        let size = self.settings.image_size;
        let resized = image::imageops::resize(&enhanced, size, size, FilterType::Lanczos3);
        PreprocessedImage::from_rgb(resized)
    }

    /// ファイルを前処理する
    ///
    /// デコードできない場合は `Ok(None)` を返し、呼び出し側でスキップします。
    pub fn process_path(&self, path: &Path) -> Result<Option<PreprocessedImage>> {
        match open_rgb(path) {
            Ok(img) => Ok(Some(self.process_image(&img))),
            Err(e) => {
                tracing::warn!("画像を読み込めません。スキップします: {}", e);
                Ok(None)
            }
        }
    }
}

/// RGB 8bit として画像を開く
pub fn open_rgb(path: &Path) -> std::result::Result<RgbImage, PipelineError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::UnreadableImage(path.to_path_buf(), e.to_string()))
}

/// 前処理結果を書き出す
///
/// 戻り値は書き出したファイルのパス。
pub fn write_preprocessed(
    processed: &PreprocessedImage,
    out_dir: &Path,
    stem: &str,
    format: OutputFormat,
) -> Result<PathBuf> {
    match format {
        OutputFormat::Npy => {
            let path = out_dir.join(format!("{}.npy", stem));
            let mut file = File::create(&path).context(format!("Failed to create {:?}", path))?;
            processed
                .pixels
                .write_npy(&mut file)
                .map_err(|e| anyhow::anyhow!("npy の書き込みに失敗しました {:?}: {}", path, e))?;
            Ok(path)
        }
        OutputFormat::Png => {
            let path = out_dir.join(format!("{}.png", stem));
            processed
                .image
                .save(&path)
                .context(format!("Failed to save {:?}", path))?;
            Ok(path)
        }
    }
}

/// 前処理の集計
#[derive(Debug, Clone, Default)]
pub struct PreprocessSummary {
    pub written: usize,
    pub skipped: usize,
}

/// データセット全体を前処理する
///
/// 入力 `<input>/<class>/*` ごとに `<output>/<class>/<stem>.{npy,png}` を1つ書き出します。
pub fn preprocess_dataset(input: &Path, output: &Path, settings: &PreprocessSettings) -> Result<PreprocessSummary> {
    if !input.is_dir() {
        return Err(PipelineError::MissingDirectory(input.to_path_buf()).into());
    }

    let preprocessor = ImagePreprocessor::new(settings.clone());
    let mut summary = PreprocessSummary::default();

    for (class_name, class_dir) in list_class_dirs(input)? {
        let out_dir = output.join(&class_name);
        std::fs::create_dir_all(&out_dir).context(format!("Failed to create {:?}", out_dir))?;

        let images = list_images(&class_dir)?;
        tracing::info!("{} を処理中... ({} 枚)", class_name, images.len());

        let stems = output_stems(&images);
        for (path, stem) in images.iter().zip(&stems) {
            match preprocessor.process_path(path)? {
                Some(processed) => {
                    write_preprocessed(&processed, &out_dir, stem, settings.output_format)?;
                    summary.written += 1;
                }
                None => summary.skipped += 1,
            }
        }
    }

    tracing::info!(
        "前処理完了: {} 枚書き出し, {} 枚スキップ",
        summary.written,
        summary.skipped
    );
    Ok(summary)
}
