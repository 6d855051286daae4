pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{DeviceType, ImageSettings, PathSettings, RaterConfig, TrainingSettings};
pub use model_metadata::ModelMetadata;
pub use model_storage::{load_metadata, load_weights, save_model, weights_path};
