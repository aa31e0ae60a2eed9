//! モデル学習（2段階の転移学習）
//!
//! フェーズ1でバックボーンを凍結したままヘッドを学習し、フェーズ2で
//! バックボーン末尾 K 層を解凍して小さな学習率で微調整します。
//! フェーズ2は検証精度で早期終了し、最良エポックの重みを復元します。

use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dataset::augment::random_transform;
use crate::dataset::organize::{TRAIN_DIR, VALIDATION_DIR};
use crate::dataset::preprocess::open_rgb;
use crate::dataset::vocabulary::ClassVocabulary;
use crate::dataset::list_images;
use crate::error::PipelineError;
use crate::ml::ml_model::{fit_to_size, image_to_chw, Classifier, ModelConfig};
use crate::model::config::{AugmentSettings, PipelineConfig};

/// 学習履歴の CSV ファイル名
pub const HISTORY_FILE: &str = "training_history.csv";

/// 総画像数がこれ未満なら警告する
const SMALL_DATASET_THRESHOLD: usize = 10;

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct LeafItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 学習データセット
pub struct LeafDataset {
    items: Vec<LeafItem>,
    class_counts: Vec<usize>,
}

impl LeafDataset {
    /// `<dir>/<class>/*` を語彙の順序でラベル付けして読み込む
    pub fn from_split(dir: &Path, vocabulary: &ClassVocabulary) -> Result<Self> {
        let mut items = Vec::new();
        let mut class_counts = Vec::with_capacity(vocabulary.len());

        for entry in &vocabulary.classes {
            let class_dir = dir.join(&entry.name);
            let files = if class_dir.is_dir() { list_images(&class_dir)? } else { Vec::new() };
            tracing::info!("  [{}] {}: {} 枚", entry.id, entry.name, files.len());
            class_counts.push(files.len());
            items.extend(files.into_iter().map(|path| LeafItem { path, label: entry.id }));
        }

        Ok(Self { items, class_counts })
    }

    pub fn class_counts(&self) -> &[usize] {
        &self.class_counts
    }

    /// 先頭から最大 `per_class` 枚ずつ取り出す（キャリブレーション用）
    pub fn sample_per_class(&self, per_class: usize) -> Vec<LeafItem> {
        let mut taken = vec![0usize; self.class_counts.len()];
        self.items
            .iter()
            .filter(|item| {
                let slot = &mut taken[item.label];
                *slot += 1;
                *slot <= per_class
            })
            .cloned()
            .collect()
    }
}

impl Dataset<LeafItem> for LeafDataset {
    fn get(&self, index: usize) -> Option<LeafItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// 精度計算用に CPU 側にも保持する正解ラベル
    pub labels: Vec<usize>,
}

/// 学習時のデータ拡張（乱数はシードから生成し、クローン間で共有する）
#[derive(Clone)]
struct BatchAugmentation {
    settings: AugmentSettings,
    rng: Arc<Mutex<StdRng>>,
}

/// バッチャー
///
/// `augment` が設定されている場合は学習用として、読み込んだ画像に
/// ランダムな左右反転と回転を加えます。
#[derive(Clone)]
pub struct LeafBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augment: Option<BatchAugmentation>,
}

impl<B: Backend> LeafBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augment: None,
        }
    }

    /// `seed` が同じならワーカー数 0 の学習で同じ拡張列になる
    pub fn with_augmentation(mut self, settings: AugmentSettings, seed: u64) -> Self {
        self.augment = Some(BatchAugmentation {
            settings,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        });
        self
    }

    fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = fit_to_size(open_rgb(path)?, self.image_size);
        let img = match &self.augment {
            Some(augment) => {
                let mut rng = augment.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                random_transform(&img, &augment.settings, &mut *rng)
            }
            None => img,
        };
        Ok(image_to_chw(&img))
    }
}

impl<B: Backend> Batcher<B, LeafItem, LeafBatch<B>> for LeafBatcher<B> {
    fn batch(&self, items: Vec<LeafItem>, _device: &B::Device) -> LeafBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            match self.load(&item.path) {
                Ok(pixels) => all_pixels.extend_from_slice(&pixels),
                Err(e) => {
                    tracing::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    // 読めない画像はゼロで埋める
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            labels.push(item.label);
        }

        let targets_vec: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        LeafBatch { images, targets, labels }
    }
}

/// 1エポック分の記録（CSV の1行）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EpochRecord {
    pub phase: String,
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習結果
pub struct TrainingOutcome<B: Backend> {
    pub model: Classifier<B>,
    pub model_config: ModelConfig,
    pub classes: ClassVocabulary,
    pub history: Vec<EpochRecord>,
    pub best_val_accuracy: f64,
}

/// 1フェーズ分の学習計画
#[derive(Debug, Clone)]
struct PhasePlan {
    name: &'static str,
    epochs: usize,
    learning_rate: f64,
    /// 凍結するバックボーン先頭の層数
    frozen_layers: usize,
    /// 早期終了の猶予（None なら全エポック実行）
    patience: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct EpochStats {
    loss: f64,
    accuracy: f64,
}

/// ロジット（行優先 [n, classes]）の各行の argmax
pub fn argmax_rows(values: &[f32], num_classes: usize) -> Vec<usize> {
    if num_classes == 0 {
        return Vec::new();
    }
    values
        .chunks(num_classes)
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, labels: &[usize]) -> usize {
    let [_, num_classes] = logits.dims();
    let Ok(values) = logits.into_data().to_vec::<f32>() else {
        return 0;
    };
    argmax_rows(&values, num_classes)
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}

fn train_epoch<B, O>(
    mut model: Classifier<B>,
    optimizer: &mut O,
    loader: &Arc<dyn DataLoader<B, LeafBatch<B>>>,
    learning_rate: f64,
) -> (Classifier<B>, EpochStats)
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    let mut loss_sum = 0.0;
    let mut batches = 0usize;
    let mut correct = 0usize;
    let mut total = 0usize;

    for batch in loader.iter() {
        let output = model.forward_classification(batch.images, batch.targets);
        loss_sum += output.loss.clone().into_scalar().elem::<f64>();
        correct += count_correct(output.output.clone(), &batch.labels);
        total += batch.labels.len();
        batches += 1;

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(learning_rate, model, grads);
    }

    (model, summarize(loss_sum, batches, correct, total))
}

fn evaluate<B: Backend>(model: &Classifier<B>, loader: &Arc<dyn DataLoader<B, LeafBatch<B>>>) -> EpochStats {
    let mut loss_sum = 0.0;
    let mut batches = 0usize;
    let mut correct = 0usize;
    let mut total = 0usize;

    for batch in loader.iter() {
        let output = model.forward_classification(batch.images, batch.targets);
        loss_sum += output.loss.into_scalar().elem::<f64>();
        correct += count_correct(output.output, &batch.labels);
        total += batch.labels.len();
        batches += 1;
    }

    summarize(loss_sum, batches, correct, total)
}

fn summarize(loss_sum: f64, batches: usize, correct: usize, total: usize) -> EpochStats {
    EpochStats {
        loss: if batches == 0 { 0.0 } else { loss_sum / batches as f64 },
        accuracy: if total == 0 { 0.0 } else { correct as f64 / total as f64 },
    }
}

/// 1フェーズ分の学習を行い、(モデル, 最良検証精度) を返す
///
/// 早期終了が有効な場合は最良エポックのモデルを返します。
fn run_phase<B: AutodiffBackend>(
    model: Classifier<B>,
    plan: &PhasePlan,
    train_loader: &Arc<dyn DataLoader<B, LeafBatch<B>>>,
    valid_loader: &Arc<dyn DataLoader<B::InnerBackend, LeafBatch<B::InnerBackend>>>,
    history: &mut Vec<EpochRecord>,
) -> (Classifier<B>, f64) {
    tracing::info!(
        "=== {}: 最大 {} エポック, 学習率 {}, 凍結 {} 層 ===",
        plan.name,
        plan.epochs,
        plan.learning_rate,
        plan.frozen_layers
    );

    let mut model = model.with_frozen_layers(plan.frozen_layers);
    let mut optimizer = AdamConfig::new().init::<B, Classifier<B>>();
    let mut best: Option<(Classifier<B>, f64)> = None;
    let mut last_accuracy = 0.0;
    let mut stale_epochs = 0;

    for epoch in 1..=plan.epochs {
        let (trained, train_stats) = train_epoch(model, &mut optimizer, train_loader, plan.learning_rate);
        model = trained;
        let val_stats = evaluate(&model.valid(), valid_loader);
        last_accuracy = val_stats.accuracy;

        tracing::info!(
            "[{}] Epoch {}/{}: loss={:.4} acc={:.2}% | val_loss={:.4} val_acc={:.2}%",
            plan.name,
            epoch,
            plan.epochs,
            train_stats.loss,
            train_stats.accuracy * 100.0,
            val_stats.loss,
            val_stats.accuracy * 100.0
        );
        history.push(EpochRecord {
            phase: plan.name.to_string(),
            epoch,
            learning_rate: plan.learning_rate,
            train_loss: train_stats.loss,
            train_accuracy: train_stats.accuracy,
            val_loss: val_stats.loss,
            val_accuracy: val_stats.accuracy,
        });

        let Some(patience) = plan.patience else {
            continue;
        };
        let improved = best.as_ref().map_or(true, |(_, acc)| val_stats.accuracy > *acc);
        if improved {
            best = Some((model.clone(), val_stats.accuracy));
            stale_epochs = 0;
        } else {
            stale_epochs += 1;
            if stale_epochs >= patience {
                tracing::info!("[{}] {} エポック改善がないため早期終了します", plan.name, patience);
                break;
            }
        }
    }

    match best {
        Some((best_model, accuracy)) => {
            tracing::info!("[{}] 最良の重みを復元しました (val_acc={:.2}%)", plan.name, accuracy * 100.0);
            (best_model, accuracy)
        }
        None => (model, last_accuracy),
    }
}

/// 学習履歴を CSV に書き出す
pub fn write_history(path: &Path, history: &[EpochRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path).context(format!("Failed to create {:?}", path))?;
    for record in history {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// モデル学習を実行
///
/// `paths.data_dir` 以下の `train/` と `validation/` を使います。
/// 学習済みモデルは推論用バックエンドに変換して返します。
pub fn train_model<B: AutodiffBackend>(config: &PipelineConfig, device: &B::Device) -> Result<TrainingOutcome<B::InnerBackend>> {
    let data_dir = &config.paths.data_dir;
    let train_dir = data_dir.join(TRAIN_DIR);
    let validation_dir = data_dir.join(VALIDATION_DIR);
    let training = &config.training;

    let vocabulary = ClassVocabulary::load_for_data_dir(data_dir)?;
    vocabulary.validate_splits(&train_dir, &validation_dir)?;
    tracing::info!("クラス ({}): {}", vocabulary.len(), vocabulary.names().join(", "));

    tracing::info!("学習データ:");
    let dataset_train = LeafDataset::from_split(&train_dir, &vocabulary)?;
    tracing::info!("検証データ:");
    let dataset_val = LeafDataset::from_split(&validation_dir, &vocabulary)?;

    let total = dataset_train.len() + dataset_val.len();
    if total == 0 {
        anyhow::bail!("学習データが見つかりません: {}", data_dir.display());
    }
    if total < SMALL_DATASET_THRESHOLD {
        tracing::warn!("画像が {} 枚しかありません。学習結果は信頼できない可能性があります", total);
    }
    tracing::info!("学習データ: {} 枚, 検証データ: {} 枚", dataset_train.len(), dataset_val.len());

    let model_config = ModelConfig::new(vocabulary.len())
        .with_image_size(config.preprocess.image_size as usize)
        .with_width_multiplier(config.model.width_multiplier)
        .with_hidden_units(config.model.hidden_units)
        .with_dropout(config.model.dropout);

    let mut model = model_config.init::<B>(device);
    match &config.model.backbone_weights {
        Some(path) => {
            model.backbone = model.backbone.load_pretrained(path, device)?;
            tracing::info!("事前学習済みバックボーンを読み込みました: {}", path.display());
        }
        None if config.model.allow_random_init => {
            tracing::warn!("バックボーン重みが未設定のため、ランダム初期化から学習します");
        }
        None => return Err(PipelineError::MissingBackboneWeights.into()),
    }
    let num_layers = model.backbone.num_layers();
    let fine_tune_frozen = model.backbone.frozen_for_trainable_tail(training.fine_tune_layers);

    let train_augment = AugmentSettings {
        max_rotation: training.random_rotation,
        horizontal_flip: training.random_flip,
        max_translation: 0.0,
        max_zoom: 0.0,
        ..config.augment.clone()
    };
    let batcher_train = LeafBatcher::<B>::new(device.clone(), model_config.image_size).with_augmentation(train_augment, training.seed);
    let batcher_val = LeafBatcher::<B::InnerBackend>::new(device.clone(), model_config.image_size);

    let batch_size = training.batch_size.max(1);
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(batch_size)
        .shuffle(training.seed)
        .num_workers(training.num_workers)
        .build(dataset_train);
    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(batch_size)
        .num_workers(training.num_workers)
        .build(dataset_val);

    let mut history = Vec::new();

    let head_phase = PhasePlan {
        name: "head",
        epochs: training.head_epochs,
        learning_rate: training.head_learning_rate,
        frozen_layers: num_layers,
        patience: None,
    };
    let (model, head_accuracy) = run_phase(model, &head_phase, &dataloader_train, &dataloader_val, &mut history);

    let fine_tune_phase = PhasePlan {
        name: "fine_tune",
        epochs: training.fine_tune_epochs,
        learning_rate: training.fine_tune_learning_rate,
        frozen_layers: fine_tune_frozen,
        patience: Some(training.patience.max(1)),
    };
    let (model, best_val_accuracy) = if fine_tune_phase.epochs == 0 {
        (model, head_accuracy)
    } else {
        run_phase(model, &fine_tune_phase, &dataloader_train, &dataloader_val, &mut history)
    };

    let history_path = config.paths.artifact_dir.join(HISTORY_FILE);
    write_history(&history_path, &history)?;
    tracing::info!("学習履歴を保存しました: {}", history_path.display());
    tracing::info!("学習完了: 最良検証精度 {:.2}%", best_val_accuracy * 100.0);

    Ok(TrainingOutcome {
        model: model.valid(),
        model_config,
        classes: vocabulary,
        history,
        best_val_accuracy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::{flat_image, leaf_image, write_image};
    use crate::ml::inference::InferenceEngine;
    use crate::model::InferenceConfig;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn small_tree(root: &Path) {
        for (split, count) in [(TRAIN_DIR, 4), (VALIDATION_DIR, 2)] {
            let dir = root.join(split);
            for i in 0..count {
                write_image(&dir, "healthy_leaf", &format!("h{}.png", i), &leaf_image(32, 32, i));
                write_image(&dir, "early_blight_leaf", &format!("e{}.png", i), &flat_image(32, 32, [120, 90, 40]));
            }
        }
        ClassVocabulary::from_names(&["early_blight_leaf", "healthy_leaf"])
            .save(&root.join(crate::dataset::vocabulary::VOCABULARY_FILE))
            .unwrap();
    }

    #[test]
    fn test_argmax_rows() {
        assert_eq!(argmax_rows(&[0.1, 0.9, 0.8, 0.2, 0.3, 0.3], 2), vec![1, 0, 0]);
        assert!(argmax_rows(&[], 0).is_empty());
    }

    #[test]
    fn test_dataset_labels_follow_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        small_tree(dir.path());
        let vocab = ClassVocabulary::load_for_data_dir(dir.path()).unwrap();
        let dataset = LeafDataset::from_split(&dir.path().join(TRAIN_DIR), &vocab).unwrap();
        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.class_counts(), &[4, 4]);
        let first = dataset.get(0).unwrap();
        assert_eq!(first.label, 0);
        assert!(first.path.to_string_lossy().contains("early_blight_leaf"));
        assert_eq!(dataset.sample_per_class(1).len(), 2);
    }

    #[test]
    fn test_batcher_zero_fills_unreadable_images() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"not an image").unwrap();

        let device: <NdArray as Backend>::Device = Default::default();
        let batcher = LeafBatcher::<NdArray>::new(device.clone(), 8);
        let batch = batcher.batch(vec![LeafItem { path: bad, label: 1 }], &device);
        assert_eq!(batch.images.dims(), [1, 3, 8, 8]);
        assert_eq!(batch.labels, vec![1]);
        let sum: f32 = batch.images.sum().into_scalar();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_train_model_runs_both_phases() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        small_tree(&data);

        let mut config = PipelineConfig::default();
        config.paths.data_dir = data;
        config.paths.artifact_dir = dir.path().join("artifacts");
        config.preprocess.image_size = 32;
        config.training.batch_size = 4;
        config.training.head_epochs = 1;
        config.training.fine_tune_epochs = 2;
        config.training.patience = 1;
        config.model.allow_random_init = true;

        let device = Default::default();
        let outcome = train_model::<TestBackend>(&config, &device).unwrap();
        assert_eq!(outcome.classes.names(), vec!["early_blight_leaf", "healthy_leaf"]);
        assert_eq!(outcome.model_config.num_classes, 2);
        assert!(outcome.history.iter().any(|r| r.phase == "head"));
        assert!(outcome.history.iter().any(|r| r.phase == "fine_tune"));
        assert!((0.0..=1.0).contains(&outcome.best_val_accuracy));
        // Keras 換算で末尾 20 層 = block_15, block_16, Conv_1 の 7 畳み込み層
        assert_eq!(outcome.model.frozen_layers, 52 - 7);

        let csv = std::fs::read_to_string(dir.path().join("artifacts").join(HISTORY_FILE)).unwrap();
        assert!(csv.starts_with("phase,epoch,learning_rate"));
        assert_eq!(csv.lines().count(), outcome.history.len() + 1);
    }

    #[test]
    fn test_mismatched_splits_abort_training() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        small_tree(&data);
        write_image(&data.join(TRAIN_DIR), "septoria_leaf", "s0.png", &leaf_image(32, 32, 3));

        let mut config = PipelineConfig::default();
        config.paths.data_dir = data;
        let device = Default::default();
        let err = train_model::<TestBackend>(&config, &device).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<crate::error::PipelineError>(),
            Some(crate::error::PipelineError::ClassMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_backbone_weights_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        small_tree(&data);

        let mut config = PipelineConfig::default();
        config.paths.data_dir = data;
        config.paths.artifact_dir = dir.path().join("artifacts");
        config.preprocess.image_size = 32;

        let device = Default::default();
        let err = train_model::<TestBackend>(&config, &device).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingBackboneWeights)
        ));
        assert!(!dir.path().join("artifacts").join(HISTORY_FILE).exists());
    }

    #[test]
    fn test_training_augmentation_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<LeafItem> = (0..4)
            .map(|i| {
                write_image(dir.path(), "healthy_leaf", &format!("h{}.png", i), &leaf_image(32, 32, i));
                LeafItem {
                    path: dir.path().join("healthy_leaf").join(format!("h{}.png", i)),
                    label: 0,
                }
            })
            .collect();
        let settings = AugmentSettings {
            max_rotation: 0.2,
            horizontal_flip: true,
            max_translation: 0.0,
            max_zoom: 0.0,
            ..AugmentSettings::default()
        };

        let device: <NdArray as Backend>::Device = Default::default();
        let pixels = |seed: u64| -> Vec<Vec<f32>> {
            let batcher = LeafBatcher::<NdArray>::new(device.clone(), 32).with_augmentation(settings.clone(), seed);
            (0..3)
                .map(|_| batcher.batch(items.clone(), &device).images.into_data().to_vec().unwrap())
                .collect()
        };

        let first = pixels(42);
        assert_eq!(first, pixels(42));
        assert_ne!(first, pixels(7));
        // 同じバッチャー内ではエポックごとに異なる拡張になる
        assert_ne!(first[0], first[1]);
    }

    #[test]
    fn test_trained_model_classifies_unseen_solid_colours() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let shades: [(&str, &[u8]); 2] = [(TRAIN_DIR, &[255, 235, 215, 195]), (VALIDATION_DIR, &[245, 205])];
        for (split, values) in shades {
            for (i, &v) in values.iter().enumerate() {
                let split_dir = data.join(split);
                write_image(&split_dir, "green_leaf", &format!("g{}.png", i), &flat_image(32, 32, [10, v, 20]));
                write_image(&split_dir, "red_leaf", &format!("r{}.png", i), &flat_image(32, 32, [v, 15, 10]));
            }
        }
        ClassVocabulary::from_names(&["green_leaf", "red_leaf"])
            .save(&data.join(crate::dataset::vocabulary::VOCABULARY_FILE))
            .unwrap();

        let mut config = PipelineConfig::default();
        config.paths.data_dir = data;
        config.paths.artifact_dir = dir.path().join("artifacts");
        config.preprocess.image_size = 32;
        config.model.allow_random_init = true;
        // 全画像を1バッチにして BatchNorm の移動統計をバッチ統計へ収束させる
        config.training.batch_size = 8;
        config.training.head_epochs = 40;
        config.training.head_learning_rate = 1e-2;
        config.training.fine_tune_epochs = 0;
        config.training.random_flip = false;
        config.training.random_rotation = 0.0;

        let device = Default::default();
        let outcome = train_model::<TestBackend>(&config, &device).unwrap();
        let inference_config = InferenceConfig {
            class_labels: outcome.classes.names(),
            image_size: outcome.model_config.image_size,
        };
        let engine = InferenceEngine::<NdArray>::from_parts(outcome.model, inference_config, device);

        let red = engine.classify_image(flat_image(48, 48, [225, 12, 18])).unwrap();
        assert_eq!(red.class, "red_leaf");
        let green = engine.classify_image(flat_image(48, 48, [14, 225, 12])).unwrap();
        assert_eq!(green.class, "green_leaf");

        let unseen = dir.path().join("unseen");
        write_image(&unseen, "x", "green.png", &flat_image(40, 40, [5, 185, 25]));
        assert_eq!(engine.classify_path(unseen.join("x/green.png")).unwrap().class, "green_leaf");
    }
}
