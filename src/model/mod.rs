pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::{ClassInfo, ModelMetadata, CLASS_INFO_FILE};
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_with_metadata, print_metadata_info};
pub use inference_config::InferenceConfig;
pub use config::{PipelineConfig, DeviceType, ModelSettings, TrainingSettings, ExportSettings};
