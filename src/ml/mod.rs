pub mod dataset;
pub mod embedding;
pub mod evaluation;
pub mod image_loader;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use dataset::{
    create_embedding_dataset, create_pixel_dataset, validate_embedding, AssemblyReport,
    RatingBatch, RatingBatcher, RatingDataset, RatingItem, RecordOutcome, RecordStatus,
    SkipReason,
};
pub use embedding::{
    convert_torchvision_weights, load_mobilenet_v2, save_mobilenet_v2, torchvision_key_remaps,
    FeatureExtractor, MobileNetV2, MobileNetV2Config, MobileNetV2Extractor,
};
pub use evaluation::{
    compare, evaluate, evaluate_with_engine, regression_metrics, ComparisonEntry,
    EvaluateOptions, EvaluationReport, RegressionMetrics,
};
pub use image_loader::{
    load_image_tensor, resolve_image_path, ImageTensor, DEFAULT_CHANNELS, DEFAULT_IMAGE_SIZE,
};
pub use inference::{
    predict, round_rating, InferenceEngine, LoadedModel, PredictOptions, Prediction,
};
pub use ml_model::{
    EmbeddingRegressor, EmbeddingRegressorConfig, RatingCnn, RatingCnnConfig, RatingRegressor,
    EMBEDDING_DIM,
};
pub use training::{
    fit, train, train_model_a, train_model_b, EpochMetrics, TrainOptions, TrainingReport,
};
