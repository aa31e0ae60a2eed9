//! データセット処理
//!
//! `<root>/<class_name>/*.{jpg,jpeg,png}` 形式のディレクトリツリーを扱います。

pub mod augment;
pub mod clahe;
pub mod organize;
pub mod preprocess;
pub mod verify;
pub mod vocabulary;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use augment::{augment_dataset, AugmentOutcome, AugmentSummary, Augmentations, QualityVerdict};
pub use organize::{organize_dataset, OrganizeSummary};
pub use preprocess::{preprocess_dataset, ImagePreprocessor, PreprocessSummary, PreprocessedImage};
pub use verify::{verify_dataset, VerifyReport};
pub use vocabulary::{ClassEntry, ClassVocabulary};

/// 学習・前処理の対象とする拡張子
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 画像ファイルかどうか（拡張子の大文字小文字は区別しない）
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// ディレクトリ直下の画像ファイルをファイル名順で列挙
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).context(format!("Failed to read directory: {:?}", dir))? {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// ルート直下のクラスディレクトリを名前順で列挙
pub fn list_class_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root).context(format!("Failed to read directory: {:?}", root))? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {:?}", path))?
            .to_string();
        classes.push((name, path));
    }
    classes.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(classes)
}

/// ファイル名の拡張子を除いた部分
fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string())
}

/// 出力ファイル名に使う stem を入力ごとに決める
///
/// `a.jpg` と `a.png` のように拡張子違いで stem が重なる場合は、
/// 上書きを避けるため `a_jpg` / `a_png` のように拡張子を残します。
pub(crate) fn output_stems(paths: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = paths.iter().map(|p| file_stem(p)).collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *counts.entry(stem.as_str()).or_default() += 1;
    }

    paths
        .iter()
        .zip(&stems)
        .map(|(path, stem)| {
            if counts[stem.as_str()] < 2 {
                return stem.clone();
            }
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            tracing::warn!(
                "ファイル名が重複しています: {} (拡張子を残して {}_{} として書き出します)",
                path.display(),
                stem,
                ext
            );
            format!("{}_{}", stem, ext)
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_support::*;

    #[test]
    fn test_list_images_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let img = leaf_image(8, 8, 0);
        write_image(dir.path(), "healthy_leaf", "b.png", &img);
        write_image(dir.path(), "healthy_leaf", "a.JPG", &img);
        std::fs::write(dir.path().join("healthy_leaf/notes.txt"), "x").unwrap();

        let images = list_images(&dir.path().join("healthy_leaf")).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.png"]);
    }

    #[test]
    fn test_list_class_dirs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for class in ["septoria_leaf", "early_blight_leaf", "healthy_leaf"] {
            std::fs::create_dir_all(dir.path().join(class)).unwrap();
        }
        std::fs::write(dir.path().join("README"), "x").unwrap();

        let classes: Vec<_> = list_class_dirs(dir.path())
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(classes, vec!["early_blight_leaf", "healthy_leaf", "septoria_leaf"]);
    }

    #[test]
    fn test_output_stems_keep_extension_on_collision() {
        let paths = vec![
            PathBuf::from("raw/healthy_leaf/a.jpg"),
            PathBuf::from("raw/healthy_leaf/a.png"),
            PathBuf::from("raw/healthy_leaf/b.jpeg"),
        ];
        assert_eq!(output_stems(&paths), vec!["a_jpg", "a_png", "b"]);
    }
}
