pub mod backbone;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use backbone::{Backbone, BackboneConfig, ConvBn, LayerSpec};
pub use inference::{InferenceEngine, Prediction};
pub use ml_model::{image_to_chw, load_image_chw, Classifier, ModelConfig, IMAGE_SIZE};
pub use training::{train_model, EpochRecord, LeafBatch, LeafBatcher, LeafDataset, LeafItem, TrainingOutcome};

/// CPU バックエンド
pub type CpuBackend = burn::backend::NdArray;

/// GPU バックエンド
#[cfg(feature = "gpu")]
pub type GpuBackend = burn::backend::Wgpu;
