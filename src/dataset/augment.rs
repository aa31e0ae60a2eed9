//! データ拡張
//!
//! 回転・平行移動・ズーム・左右反転をランダムに合成して画像を生成し、
//! コントラストと色バランスの2条件を満たしたものだけを採用します。
//! 試行は N 枚採用するか、試行回数が attempt_factor × N に達した時点で終了します。

use anyhow::{Context, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_with, Interpolation, Projection};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

use crate::dataset::preprocess::open_rgb;
use crate::dataset::{list_class_dirs, list_images, output_stems};
use crate::error::PipelineError;
use crate::model::config::AugmentSettings;

/// 品質判定の結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityVerdict {
    Accepted,
    /// 標準偏差が下限未満
    LowContrast(f32),
    /// 特定チャネルが支配的
    ColorImbalance(f32),
}

impl QualityVerdict {
    pub fn check(img: &RgbImage, settings: &AugmentSettings) -> Self {
        let stats = ImageStats::of(img);
        if stats.std_dev < settings.min_std_dev {
            QualityVerdict::LowContrast(stats.std_dev)
        } else if stats.channel_ratio > settings.max_channel_ratio {
            QualityVerdict::ColorImbalance(stats.channel_ratio)
        } else {
            QualityVerdict::Accepted
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, QualityVerdict::Accepted)
    }
}

/// 画素統計
#[derive(Debug, Clone, Copy)]
pub struct ImageStats {
    /// 全画素・全チャネルの標準偏差（0-255）
    pub std_dev: f32,
    /// 最大チャネル平均 / チャネル平均の平均
    pub channel_ratio: f32,
}

impl ImageStats {
    pub fn of(img: &RgbImage) -> Self {
        let raw = img.as_raw();
        if raw.is_empty() {
            return Self { std_dev: 0.0, channel_ratio: 0.0 };
        }

        let n = raw.len() as f64;
        let mean = raw.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = raw.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

        let mut sums = [0f64; 3];
        for p in img.pixels() {
            for c in 0..3 {
                sums[c] += p[c] as f64;
            }
        }
        let pixels = (img.width() * img.height()) as f64;
        let means = sums.map(|s| s / pixels);
        let max_mean = means.iter().cloned().fold(f64::MIN, f64::max);
        let mean_of_means = means.iter().sum::<f64>() / 3.0;

        Self {
            std_dev: var.sqrt() as f32,
            channel_ratio: (max_mean / (mean_of_means + 1e-5)) as f32,
        }
    }
}

/// ランダムな幾何変換を1回適用する
///
/// 画像中心を基準に回転・ズームし、平行移動したあと、確率 1/2 で左右反転します。
/// はみ出した領域は境界で鏡像反転した画素で埋めます。
pub fn random_transform<R: Rng>(img: &RgbImage, settings: &AugmentSettings, rng: &mut R) -> RgbImage {
    let (w, h) = (img.width() as f32, img.height() as f32);
    let (cx, cy) = (w / 2.0, h / 2.0);

    let max_angle = settings.max_rotation * std::f32::consts::TAU;
    let angle = sample_symmetric(rng, max_angle);
    let zoom = 1.0 + sample_symmetric(rng, settings.max_zoom);
    let tx = sample_symmetric(rng, settings.max_translation) * w;
    let ty = sample_symmetric(rng, settings.max_translation) * h;

    let projection = Projection::translate(cx + tx, cy + ty)
        * Projection::rotate(angle)
        * Projection::scale(zoom, zoom)
        * Projection::translate(-cx, -cy);

    // 出力座標 -> 入力座標
    let inverse = projection.invert();
    let warped = warp_with(
        img,
        move |x, y| {
            let (sx, sy) = inverse * (x, y);
            (reflect(sx, w), reflect(sy, h))
        },
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
    );

    if settings.horizontal_flip && rng.gen_bool(0.5) {
        image::imageops::flip_horizontal(&warped)
    } else {
        warped
    }
}

/// 座標を [0, len - 1) に鏡像反転で折り返す
fn reflect(v: f32, len: f32) -> f32 {
    let last = len - 1.0;
    if last <= 0.0 {
        return 0.0;
    }
    let period = 2.0 * last;
    let m = v.rem_euclid(period);
    let folded = if m > last { period - m } else { m };
    // 双線形補間が右端の隣接画素を参照できるよう端をわずかに内側へ
    folded.min(last - 1e-3)
}

fn sample_symmetric<R: Rng>(rng: &mut R, max: f32) -> f32 {
    if max <= 0.0 {
        0.0
    } else {
        rng.gen_range(-max..=max)
    }
}

/// 1枚の元画像に対する拡張結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AugmentOutcome {
    pub accepted: usize,
    pub attempts: usize,
    pub rejected_contrast: usize,
    pub rejected_color: usize,
}

/// 採用された拡張画像を遅延生成するイテレータ
///
/// 1回の `next` で採用候補が出るまで試行を進めます。判定結果に関係なく
/// 1回の試行で予算を1消費し、予算切れか定数到達で `None` を返します。
pub struct Augmentations<'a, R: Rng> {
    source: &'a RgbImage,
    settings: &'a AugmentSettings,
    rng: &'a mut R,
    quota: usize,
    budget: usize,
    outcome: AugmentOutcome,
}

impl<'a, R: Rng> Augmentations<'a, R> {
    pub fn new(source: &'a RgbImage, settings: &'a AugmentSettings, rng: &'a mut R) -> Self {
        let quota = settings.samples_per_image;
        Self {
            source,
            settings,
            rng,
            quota,
            budget: quota * settings.attempt_factor,
            outcome: AugmentOutcome::default(),
        }
    }

    pub fn outcome(&self) -> AugmentOutcome {
        self.outcome
    }

    pub fn quota(&self) -> usize {
        self.quota
    }
}

impl<R: Rng> Iterator for Augmentations<'_, R> {
    type Item = RgbImage;

    fn next(&mut self) -> Option<RgbImage> {
        while self.outcome.accepted < self.quota && self.outcome.attempts < self.budget {
            self.outcome.attempts += 1;
            let candidate = random_transform(self.source, self.settings, &mut *self.rng);

            match QualityVerdict::check(&candidate, self.settings) {
                QualityVerdict::Accepted => {
                    self.outcome.accepted += 1;
                    return Some(candidate);
                }
                QualityVerdict::LowContrast(std_dev) => {
                    tracing::debug!("低コントラストのため棄却 (std={:.1})", std_dev);
                    self.outcome.rejected_contrast += 1;
                }
                QualityVerdict::ColorImbalance(ratio) => {
                    tracing::debug!("色バランス不良のため棄却 (ratio={:.2})", ratio);
                    self.outcome.rejected_color += 1;
                }
            }
        }
        None
    }
}

/// データセット全体の拡張結果
#[derive(Debug, Clone, Default)]
pub struct AugmentSummary {
    pub sources: usize,
    pub variants: usize,
    pub skipped: usize,
    /// 生成枚数が N に届かなかった元画像の数
    pub under_quota: usize,
}

/// データセット全体を拡張する
///
/// `<output>/<class>/<stem>_original.jpg` と `<stem>_aug_<k>.jpg` を書き出します。
pub fn augment_dataset(input: &Path, output: &Path, settings: &AugmentSettings) -> Result<AugmentSummary> {
    if !input.is_dir() {
        return Err(PipelineError::MissingDirectory(input.to_path_buf()).into());
    }

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut summary = AugmentSummary::default();
    let size = settings.image_size;

    for (class_name, class_dir) in list_class_dirs(input)? {
        let out_dir = output.join(&class_name);
        std::fs::create_dir_all(&out_dir).context(format!("Failed to create {:?}", out_dir))?;
        tracing::info!("{} を処理中...", class_name);

        let images = list_images(&class_dir)?;
        let stems = output_stems(&images);
        for (path, stem) in images.iter().zip(&stems) {
            let source = match open_rgb(path) {
                Ok(img) => image::imageops::resize(&img, size, size, FilterType::Lanczos3),
                Err(e) => {
                    tracing::warn!("{}", e);
                    summary.skipped += 1;
                    continue;
                }
            };

            source
                .save(out_dir.join(format!("{}_original.jpg", stem)))
                .context(format!("Failed to save original of {:?}", path))?;

            let mut variants = Augmentations::new(&source, settings, &mut rng);
            let mut k = 0;
            for variant in variants.by_ref() {
                k += 1;
                variant
                    .save(out_dir.join(format!("{}_aug_{}.jpg", stem, k)))
                    .context(format!("Failed to save augmentation of {:?}", path))?;
            }

            let outcome = variants.outcome();
            summary.sources += 1;
            summary.variants += outcome.accepted;
            if outcome.accepted < variants.quota() {
                summary.under_quota += 1;
                tracing::warn!(
                    "{}: {} 回の試行で {}/{} 枚しか生成できませんでした (低コントラスト {}, 色偏り {})",
                    path.display(),
                    outcome.attempts,
                    outcome.accepted,
                    variants.quota(),
                    outcome.rejected_contrast,
                    outcome.rejected_color
                );
            } else {
                tracing::info!("{}: {} 枚生成しました", path.display(), outcome.accepted);
            }
        }
    }

    tracing::info!(
        "拡張完了: 元画像 {} 枚, 生成 {} 枚, 不足 {} 枚, スキップ {} 枚",
        summary.sources,
        summary.variants,
        summary.under_quota,
        summary.skipped
    );
    Ok(summary)
}
