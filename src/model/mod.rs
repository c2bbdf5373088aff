pub mod config;
pub mod inference_config;
pub mod labels;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, AugmentationSettings, DataSettings, DeviceType, ExportSettings, ModelSettings, Normalization, TrainingSettings};
pub use inference_config::InferenceConfig;
pub use labels::{read_labels, write_labels};
pub use model_metadata::ModelMetadata;
pub use model_storage::{load_metadata, load_model_binary, load_model_with_metadata, print_metadata_info, save_model_with_metadata};
