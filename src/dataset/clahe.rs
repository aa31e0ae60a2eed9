//! コントラスト制限付き適応ヒストグラム平坦化（CLAHE）
//!
//! 輝度チャネルのみを平坦化して色相の変化を避けます。
//! RGB → CIE Lab → L を 8bit 化して CLAHE → Lab → RGB の順に処理します。
//!
//! `opencv` フィーチャー有効時は OpenCV の `createCLAHE` を使い、失敗した場合のみ
//! 組み込み実装に切り替えます。組み込み実装も OpenCV と同じく、画像サイズが
//! タイル数で割り切れない場合は右端・下端を鏡像 (reflect-101) で拡張し、
//! 全タイルを同じ大きさにしてからヒストグラムを取ります。

use image::{GrayImage, Rgb, RgbImage};
use imageproc::stats::histogram;
use palette::{FromColor, Lab, Srgb};

const HIST_SIZE: usize = 256;

/// reflect-101 で [0, len) に折り返す（`abcd|cb` の形）
fn reflect_101(i: usize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len {
        m
    } else {
        period - m
    }
}

/// タイル数で割り切れる大きさまで右端・下端を鏡像で拡張する
fn pad_to_tiles(channel: &[u8], w: usize, h: usize, padded_w: usize, padded_h: usize) -> GrayImage {
    GrayImage::from_fn(padded_w as u32, padded_h as u32, |x, y| {
        let sx = reflect_101(x as usize, w);
        let sy = reflect_101(y as usize, h);
        image::Luma([channel[sy * w + sx]])
    })
}

/// 8bit 単チャネル画像に CLAHE を適用する
///
/// - `clip_limit`: タイル内の平均ビン高さに対するクリップ倍率
/// - `grid`: 縦横のタイル分割数
pub fn equalize(channel: &[u8], width: u32, height: u32, clip_limit: f32, grid: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return channel.to_vec();
    }

    let grid_x = (grid as usize).clamp(1, w);
    let grid_y = (grid as usize).clamp(1, h);
    let tile_w = w.div_ceil(grid_x);
    let tile_h = h.div_ceil(grid_y);
    let padded = pad_to_tiles(channel, w, h, tile_w * grid_x, tile_h * grid_y);
    let area = tile_w * tile_h;

    // タイルごとの変換テーブル
    let mut luts = vec![[0u8; HIST_SIZE]; grid_x * grid_y];
    for ty in 0..grid_y {
        for tx in 0..grid_x {
            let tile = image::imageops::crop_imm(
                &padded,
                (tx * tile_w) as u32,
                (ty * tile_h) as u32,
                tile_w as u32,
                tile_h as u32,
            )
            .to_image();
            let mut hist = histogram(&tile).channels[0];
            clip_histogram(&mut hist, clip_limit, area);

            let scale = (HIST_SIZE - 1) as f32 / area as f32;
            let mut sum = 0u32;
            for (v, out) in luts[ty * grid_x + tx].iter_mut().enumerate() {
                sum += hist[v];
                *out = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let columns = interpolation_weights(w, tile_w, grid_x);
    let rows = interpolation_weights(h, tile_h, grid_y);

    // 近傍4タイルの変換結果を双線形補間
    let mut out = vec![0u8; w * h];
    for (y, &(ty1, ty2, ya)) in rows.iter().enumerate() {
        for (x, &(tx1, tx2, xa)) in columns.iter().enumerate() {
            let v = channel[y * w + x] as usize;
            let top = luts[ty1 * grid_x + tx1][v] as f32 * (1.0 - xa) + luts[ty1 * grid_x + tx2][v] as f32 * xa;
            let bottom = luts[ty2 * grid_x + tx1][v] as f32 * (1.0 - xa) + luts[ty2 * grid_x + tx2][v] as f32 * xa;
            out[y * w + x] = (top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// 各座標について (手前のタイル, 奥のタイル, 奥側の重み) を求める
fn interpolation_weights(len: usize, tile: usize, tiles: usize) -> Vec<(usize, usize, f32)> {
    (0..len)
        .map(|i| {
            let f = (i as f32 + 0.5) / tile as f32 - 0.5;
            if f <= 0.0 {
                return (0, 0, 0.0);
            }
            let t1 = f.floor() as usize;
            if t1 + 1 >= tiles {
                return (tiles - 1, tiles - 1, 0.0);
            }
            (t1, t1 + 1, f - t1 as f32)
        })
        .collect()
}

/// クリップ上限を超えた分を全ビンに再分配する
fn clip_histogram(hist: &mut [u32; HIST_SIZE], clip_limit: f32, area: usize) {
    if clip_limit <= 0.0 {
        return;
    }
    let limit = ((clip_limit * area as f32 / HIST_SIZE as f32) as u32).max(1);

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let batch = excess / HIST_SIZE as u32;
    let residual = (excess % HIST_SIZE as u32) as usize;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (HIST_SIZE / residual).max(1);
        for bin in hist.iter_mut().step_by(step).take(residual) {
            *bin += 1;
        }
    }
}

/// RGB画像の輝度（Lab の L）にのみ CLAHE を適用する
pub fn enhance_luminance(img: &RgbImage, clip_limit: f32, grid: u32) -> RgbImage {
    #[cfg(feature = "opencv")]
    match opencv_clahe::enhance_luminance(img, clip_limit, grid) {
        Ok(out) => return out,
        Err(e) => tracing::warn!("OpenCV の CLAHE に失敗したため組み込み実装を使います: {}", e),
    }

    enhance_luminance_builtin(img, clip_limit, grid)
}

fn enhance_luminance_builtin(img: &RgbImage, clip_limit: f32, grid: u32) -> RgbImage {
    let (width, height) = img.dimensions();

    let labs: Vec<Lab> = img
        .pixels()
        .map(|p| {
            let srgb = Srgb::new(p[0], p[1], p[2]).into_format::<f32>();
            Lab::from_color(srgb)
        })
        .collect();

    // L (0-100) を 8bit スケールへ
    let lightness: Vec<u8> = labs
        .iter()
        .map(|lab| (lab.l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8)
        .collect();

    let equalized = equalize(&lightness, width, height, clip_limit, grid);

    let mut out = RgbImage::new(width, height);
    for (i, pixel) in out.pixels_mut().enumerate() {
        let lab = Lab::new(equalized[i] as f32 * 100.0 / 255.0, labs[i].a, labs[i].b);
        let rgb = Srgb::from_color(lab);
        *pixel = Rgb([to_u8(rgb.red), to_u8(rgb.green), to_u8(rgb.blue)]);
    }
    out
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(feature = "opencv")]
mod opencv_clahe {
    use anyhow::Result;
    use image::RgbImage;
    use opencv::{
        core::{Mat, Size, Vector, CV_8UC3},
        imgproc,
        prelude::*,
    };

    pub fn enhance_luminance(img: &RgbImage, clip_limit: f32, grid: u32) -> Result<RgbImage> {
        let (width, height) = img.dimensions();
        let mut data = img.as_raw().clone();
        let rgb = unsafe {
            Mat::new_rows_cols_with_data_unsafe(
                height as i32,
                width as i32,
                CV_8UC3,
                data.as_mut_ptr() as *mut _,
                opencv::core::Mat_AUTO_STEP,
            )?
        };

        let mut lab = Mat::default();
        imgproc::cvt_color(
            &rgb,
            &mut lab,
            imgproc::COLOR_RGB2Lab,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        let mut channels = Vector::<Mat>::new();
        opencv::core::split(&lab, &mut channels)?;

        let mut clahe = imgproc::create_clahe(clip_limit as f64, Size::new(grid as i32, grid as i32))?;
        let mut lightness = Mat::default();
        clahe.apply(&channels.get(0)?, &mut lightness)?;
        channels.set(0, lightness)?;

        let mut merged = Mat::default();
        opencv::core::merge(&channels, &mut merged)?;
        let mut out = Mat::default();
        imgproc::cvt_color(
            &merged,
            &mut out,
            imgproc::COLOR_Lab2RGB,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;

        let bytes = out.data_bytes()?.to_vec();
        RgbImage::from_vec(width, height, bytes).ok_or_else(|| anyhow::anyhow!("CLAHE 結果のサイズが一致しません"))
    }
}
