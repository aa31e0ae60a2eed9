//! train / validation への分割
//!
//! クラスごとに固定シードでシャッフルして分割し、全ファイルに前処理を適用して
//! `<output>/{train,validation}/<class>/<元のファイル名>` に書き出します。
//! 最後にクラス語彙 `<output>/classes.json` を書き出します。

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::dataset::preprocess::ImagePreprocessor;
use crate::dataset::vocabulary::{ClassVocabulary, VOCABULARY_FILE};
use crate::dataset::{list_class_dirs, list_images};
use crate::error::PipelineError;
use crate::model::config::{PreprocessSettings, SplitSettings};

pub const TRAIN_DIR: &str = "train";
pub const VALIDATION_DIR: &str = "validation";

/// クラスごとの分割結果
#[derive(Debug, Clone)]
pub struct ClassSplit {
    pub name: String,
    pub train: Vec<PathBuf>,
    pub validation: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct OrganizeSummary {
    pub classes: Vec<ClassSplit>,
    pub written: usize,
    pub skipped: usize,
}

/// ファイル一覧を train / validation に分ける
///
/// 検証側の枚数は ceil(n × fraction)。2枚未満のクラスは分割せず、同じファイルを両方に入れます。
pub fn split_files(files: &[PathBuf], validation_fraction: f32, seed: u64) -> (Vec<PathBuf>, Vec<PathBuf>) {
    if files.len() < 2 {
        return (files.to_vec(), files.to_vec());
    }

    let mut shuffled = files.to_vec();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let n = shuffled.len();
    let n_validation = ((n as f32 * validation_fraction).ceil() as usize).clamp(1, n - 1);
    let train = shuffled.split_off(n_validation);
    (train, shuffled)
}

/// データセットを分割して前処理済み画像を書き出す
pub fn organize_dataset(
    source: &Path,
    output: &Path,
    split: &SplitSettings,
    preprocess: &PreprocessSettings,
) -> Result<OrganizeSummary> {
    if !source.is_dir() {
        return Err(PipelineError::MissingDirectory(source.to_path_buf()).into());
    }

    let class_dirs = list_class_dirs(source)?;
    let mut classes = Vec::with_capacity(class_dirs.len());
    let mut total_files = 0;
    for (name, dir) in &class_dirs {
        let files = list_images(dir)?;
        total_files += files.len();
        let (train, validation) = split_files(&files, split.validation_fraction, split.seed);
        if files.len() < 2 {
            tracing::warn!(
                "{} の画像が少なすぎます ({} 枚)。同じ画像を train と validation の両方に使います",
                name,
                files.len()
            );
        }
        classes.push(ClassSplit {
            name: name.clone(),
            train,
            validation,
        });
    }
    tracing::info!("{} クラスで {} 枚の画像が見つかりました", classes.len(), total_files);

    if total_files == 0 {
        return Err(PipelineError::EmptyDataset(source.to_path_buf()).into());
    }

    let preprocessor = ImagePreprocessor::new(preprocess.clone());
    let mut summary = OrganizeSummary::default();

    for class in &classes {
        tracing::info!(
            "{}: train {} 枚, validation {} 枚",
            class.name,
            class.train.len(),
            class.validation.len()
        );
        for (subset, files) in [(TRAIN_DIR, &class.train), (VALIDATION_DIR, &class.validation)] {
            let out_dir = output.join(subset).join(&class.name);
            std::fs::create_dir_all(&out_dir).context(format!("Failed to create {:?}", out_dir))?;

            for path in files {
                let Some(processed) = preprocessor.process_path(path)? else {
                    summary.skipped += 1;
                    continue;
                };
                let file_name = path
                    .file_name()
                    .ok_or_else(|| anyhow::anyhow!("Invalid file name: {:?}", path))?;
                let out_path = out_dir.join(file_name);
                processed
                    .image
                    .save(&out_path)
                    .context(format!("Failed to save {:?}", out_path))?;
                summary.written += 1;
            }
        }
    }

    let names: Vec<String> = classes.iter().map(|c| c.name.clone()).collect();
    let vocabulary = ClassVocabulary::from_names(&names);
    vocabulary.save(&output.join(VOCABULARY_FILE))?;
    tracing::info!("クラス語彙を保存しました: {}", names.join(", "));

    summary.classes = classes;
    tracing::info!(
        "分割完了: {} 枚書き出し, {} 枚スキップ",
        summary.written,
        summary.skipped
    );
    Ok(summary)
}
