//! パイプライン共通のエラー定義
//!
//! 呼び出し側やテストで判別が必要な致命的エラーのみを列挙します。
//! それ以外は `anyhow::Context` で文脈を付けて伝播させます。

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// 入力ディレクトリが存在しない
    #[error("Directory not found: {0}")]
    MissingDirectory(PathBuf),

    /// 画像が1枚も見つからない
    #[error("No images found under {0}")]
    EmptyDataset(PathBuf),

    /// train / validation のクラス集合が一致しない
    #[error(
        "Class mismatch between splits: only in train = {only_in_train:?}, only in validation = {only_in_validation:?}"
    )]
    ClassMismatch {
        only_in_train: Vec<String>,
        only_in_validation: Vec<String>,
    },

    /// classes.json とデータセットのクラスが一致しない
    #[error("Class vocabulary mismatch: expected {expected:?}, found {found:?}")]
    VocabularyMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// 画像をデコードできない
    #[error("Unreadable image '{0}': {1}")]
    UnreadableImage(PathBuf, String),

    /// 事前学習済みバックボーン重みが指定されていない
    #[error("Backbone weights are not configured; set model.backbone_weights or allow random initialisation explicitly")]
    MissingBackboneWeights,

    /// 設定値が不正
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mismatch_message_lists_both_sides() {
        let err = PipelineError::ClassMismatch {
            only_in_train: vec!["septoria_leaf".to_string()],
            only_in_validation: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("septoria_leaf"));
        assert!(msg.contains("only in validation = []"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = PipelineError::MissingDirectory(PathBuf::from("raw_dataset")).into();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingDirectory(_))
        ));
    }
}
