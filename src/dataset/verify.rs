//! データセット構成の検証
//!
//! 期待するクラスフォルダが揃っていて画像が入っているかを確認します。
//! ファイルの書き込みは一切行いません。

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use crate::dataset::{list_class_dirs, list_images};
use crate::error::PipelineError;

/// 検証結果
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// クラスごとの画像枚数（存在するフォルダすべて）
    pub counts: BTreeMap<String, usize>,
    /// 期待されているが存在しないクラス
    pub missing: Vec<String>,
    /// 存在するが画像が0枚のクラス
    pub empty: Vec<String>,
    pub total_images: usize,
}

impl VerifyReport {
    /// 後続ステージを実行できる状態か
    pub fn ready(&self) -> bool {
        self.missing.is_empty() && self.total_images > 0
    }

    /// 必要なフォルダ構成を表示
    pub fn print_required_layout(root: &Path, expected_classes: &[String]) {
        println!("以下のフォルダ構成を作成してください:");
        println!("{}/", root.display());
        for (i, class) in expected_classes.iter().enumerate() {
            let branch = if i + 1 == expected_classes.len() { "└──" } else { "├──" };
            println!("{} {}/", branch, class);
        }
    }
}

/// データセットのルートを検証する
///
/// ルートが存在しない場合は `PipelineError::MissingDirectory` を返します（致命的）。
/// クラスの欠落や空フォルダは警告として1件ずつ出力し、結果に記録します。
pub fn verify_dataset(root: &Path, expected_classes: &[String]) -> Result<VerifyReport> {
    if !root.is_dir() {
        tracing::error!("ディレクトリ '{}' が存在しません", root.display());
        return Err(PipelineError::MissingDirectory(root.to_path_buf()).into());
    }

    let mut report = VerifyReport::default();

    for (name, path) in list_class_dirs(root)? {
        let count = list_images(&path)?.len();
        tracing::info!("{}/ に {} 枚の画像があります", name, count);
        report.total_images += count;
        report.counts.insert(name, count);
    }

    for class in expected_classes {
        match report.counts.get(class) {
            None => {
                tracing::warn!("クラスフォルダがありません: {}", class);
                report.missing.push(class.clone());
            }
            Some(0) => {
                tracing::warn!("クラスフォルダに画像がありません: {}", class);
                report.empty.push(class.clone());
            }
            Some(_) => {}
        }
    }

    if report.total_images == 0 {
        tracing::warn!("画像が1枚も見つかりません: {}", root.display());
    } else {
        tracing::info!("合計 {} 枚の画像が見つかりました", report.total_images);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::{leaf_image, write_image};

    fn classes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_dataset(&dir.path().join("raw_dataset"), &classes(&["a"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingDirectory(_))
        ));
    }

    #[test]
    fn test_reports_missing_and_empty_classes() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "healthy_leaf", "1.png", &leaf_image(8, 8, 0));
        write_image(dir.path(), "healthy_leaf", "2.png", &leaf_image(8, 8, 1));
        std::fs::create_dir_all(dir.path().join("late_blight_leaf")).unwrap();

        let report = verify_dataset(
            dir.path(),
            &classes(&["healthy_leaf", "late_blight_leaf", "septoria_leaf"]),
        )
        .unwrap();

        assert_eq!(report.counts["healthy_leaf"], 2);
        assert_eq!(report.missing, classes(&["septoria_leaf"]));
        assert_eq!(report.empty, classes(&["late_blight_leaf"]));
        assert_eq!(report.total_images, 2);
        assert!(!report.ready());
    }

    #[test]
    fn test_ready_when_all_classes_present() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a", "1.png", &leaf_image(8, 8, 0));
        write_image(dir.path(), "b", "1.jpg", &leaf_image(8, 8, 1));

        let report = verify_dataset(dir.path(), &classes(&["a", "b"])).unwrap();
        assert!(report.ready());
    }

    #[test]
    fn test_empty_tree_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let report = verify_dataset(dir.path(), &[]).unwrap();
        assert!(!report.ready());
    }
}
