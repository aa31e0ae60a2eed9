//! クラス語彙（ラベルID ⇔ クラス名）
//!
//! データセット分割時に `classes.json` として一度だけ書き出し、
//! 学習・エクスポート・推論の各ステージはこのファイルを読み込んで
//! クラス順序を共有します。ディレクトリの列挙順には依存しません。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::dataset::list_class_dirs;
use crate::error::PipelineError;

/// 語彙ファイル名
pub const VOCABULARY_FILE: &str = "classes.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    /// ラベルID（モデル出力のインデックス）
    pub id: usize,
    pub name: String,
}

/// 順序付きクラス語彙
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassVocabulary {
    pub classes: Vec<ClassEntry>,
}

impl ClassVocabulary {
    /// 与えられた順序でIDを振る
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            classes: names
                .iter()
                .enumerate()
                .map(|(id, name)| ClassEntry {
                    id,
                    name: name.as_ref().to_string(),
                })
                .collect(),
        }
    }

    /// ディレクトリ直下のクラスフォルダ名（名前順）から語彙を作る
    pub fn from_directory(root: &Path) -> Result<Self> {
        let names: Vec<String> = list_class_dirs(root)?.into_iter().map(|(n, _)| n).collect();
        if names.is_empty() {
            return Err(PipelineError::EmptyDataset(root.to_path_buf()).into());
        }
        Ok(Self::from_names(&names))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// ID順のクラス名
    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.classes.get(id).map(|c| c.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.id)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize class vocabulary")?;
        std::fs::write(path, json).context(format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).context(format!("Failed to read {:?}", path))?;
        let vocab: Self = serde_json::from_str(&json).context("Failed to deserialize class vocabulary")?;
        for (expected, entry) in vocab.classes.iter().enumerate() {
            if entry.id != expected {
                return Err(PipelineError::InvalidConfig(format!(
                    "{:?}: class '{}' has id {} but position {}",
                    path, entry.name, entry.id, expected
                ))
                .into());
            }
        }
        Ok(vocab)
    }

    /// `data_dir/classes.json` を読み込む。無い場合は train のフォルダ名から作って警告する
    pub fn load_for_data_dir(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(VOCABULARY_FILE);
        if path.exists() {
            return Self::load(&path);
        }
        tracing::warn!(
            "{} が見つかりません。train のフォルダ名から語彙を作成します",
            path.display()
        );
        Self::from_directory(&data_dir.join("train"))
    }

    /// train / validation のクラス集合が一致し、かつ語彙と一致することを検証
    pub fn validate_splits(&self, train_dir: &Path, validation_dir: &Path) -> Result<()> {
        let train: BTreeSet<String> = list_class_dirs(train_dir)?.into_iter().map(|(n, _)| n).collect();
        let validation: BTreeSet<String> =
            list_class_dirs(validation_dir)?.into_iter().map(|(n, _)| n).collect();

        if train != validation {
            return Err(PipelineError::ClassMismatch {
                only_in_train: train.difference(&validation).cloned().collect(),
                only_in_validation: validation.difference(&train).cloned().collect(),
            }
            .into());
        }

        let expected: BTreeSet<String> = self.names().into_iter().collect();
        if expected != train {
            return Err(PipelineError::VocabularyMismatch {
                expected: self.names(),
                found: train.into_iter().collect(),
            }
            .into());
        }
        Ok(())
    }
}
