//! モデル推論機能

use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{RaterError, Result};
use crate::ml::dataset::{validate_embedding, RatingDataset};
use crate::ml::embedding::{FeatureExtractor, MobileNetV2Extractor};
use crate::ml::image_loader::load_image_tensor;
use crate::ml::ml_model::{
    EmbeddingRegressor, EmbeddingRegressorConfig, RatingCnn, RatingCnnConfig, RatingRegressor,
};
use crate::model::config::RaterConfig;
use crate::model::{load_metadata, load_weights, ModelMetadata};
use crate::types::ModelType;

/// メタデータを読み込み、モデル種別が一致するか確認
fn load_expected_metadata(dir: &Path, expected: ModelType) -> Result<ModelMetadata> {
    let metadata = load_metadata(dir)?;
    if metadata.model_type != expected {
        return Err(RaterError::model_load(
            dir,
            format!(
                "expected Model {} but the directory holds Model {}",
                expected, metadata.model_type
            ),
        ));
    }
    Ok(metadata)
}

/// 読み込み済みの回帰モデル
#[derive(Debug)]
pub enum LoadedModel<B: Backend> {
    A(RatingCnn<B>),
    B(EmbeddingRegressor<B>),
}

impl<B: Backend> LoadedModel<B> {
    /// メタデータに従ってモデルを初期化し、重みを読み込む
    fn from_metadata(dir: &Path, metadata: &ModelMetadata, device: &B::Device) -> Result<Self> {
        match metadata.model_type {
            ModelType::A => {
                let model = RatingCnnConfig::new()
                    .with_image_size(metadata.image_size)
                    .with_channels(metadata.channels)
                    .with_hidden_units(metadata.hidden_units)
                    .init::<B>(device)
                    .map_err(|e| RaterError::model_load(dir, e))?;
                Ok(Self::A(load_weights(dir, model, device)?))
            }
            ModelType::B => {
                let embedding_dim = metadata.embedding_dim.ok_or_else(|| {
                    RaterError::model_load(dir, "Model B metadata has no embedding_dim")
                })?;
                let model = EmbeddingRegressorConfig::new()
                    .with_embedding_dim(embedding_dim)
                    .with_hidden_units(metadata.hidden_units)
                    .init::<B>(device);
                Ok(Self::B(load_weights(dir, model, device)?))
            }
        }
    }

    /// ディレクトリからモデルを読み込む
    ///
    /// 保存されているモデル種別が `expected` と異なる場合は `ModelLoad`。
    pub fn load(dir: &Path, expected: ModelType, device: &B::Device) -> Result<Self> {
        let metadata = load_expected_metadata(dir, expected)?;
        Self::from_metadata(dir, &metadata, device)
    }

    pub fn model_type(&self) -> ModelType {
        match self {
            Self::A(_) => ModelType::A,
            Self::B(_) => ModelType::B,
        }
    }

    pub fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::A(model) => model.forward(inputs),
            Self::B(model) => model.forward(inputs),
        }
    }

    pub fn sample_len(&self) -> usize {
        match self {
            Self::A(model) => model.sample_len(),
            Self::B(model) => model.sample_len(),
        }
    }
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: LoadedModel<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load(model_dir: &Path, expected: ModelType, device: &B::Device) -> Result<Self> {
        let metadata = load_expected_metadata(model_dir, expected)?;

        let model = LoadedModel::from_metadata(model_dir, &metadata, device)?;
        tracing::info!(
            "モデルを読み込みました: {} (Model {})",
            model_dir.display(),
            metadata.model_type
        );

        Ok(Self {
            model,
            metadata,
            device: device.clone(),
        })
    }

    pub fn model_type(&self) -> ModelType {
        self.model.model_type()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 画像1枚からモデル入力を作る
    ///
    /// Model A は画素値そのもの、Model B は特徴抽出器の埋め込み。
    pub fn image_features(
        &self,
        image_path: &Path,
        extractor: Option<&dyn FeatureExtractor>,
    ) -> Result<Vec<f32>> {
        let image = load_image_tensor(
            image_path,
            self.metadata.image_size,
            self.metadata.channels,
        )?;

        match self.model_type() {
            ModelType::A => Ok(image.into_data()),
            ModelType::B => {
                let extractor = extractor.ok_or_else(|| {
                    RaterError::InvalidConfig("Model B requires a feature extractor".into())
                })?;
                let embedding = extractor.infer(&image)?;
                validate_embedding(&embedding, self.model.sample_len()).map_err(|reason| {
                    RaterError::Inference(format!("{}: {}", image_path.display(), reason))
                })?;
                Ok(embedding)
            }
        }
    }

    /// 平坦化済みの入力（`n` サンプル分）に対する予測
    pub fn predict_batch(&self, features: &[f32], n: usize) -> Result<Vec<f32>> {
        let sample_len = self.model.sample_len();
        if features.len() != n * sample_len {
            return Err(RaterError::Inference(format!(
                "expected {} values for {} samples, got {}",
                n * sample_len,
                n,
                features.len()
            )));
        }

        let inputs = Tensor::<B, 1>::from_floats(features, &self.device).reshape([n, sample_len]);
        let output = self.model.forward(inputs);

        output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| RaterError::Inference(format!("推論結果の取得エラー: {:?}", e)))
    }

    /// データセット全体を `batch_size` ずつ予測
    pub fn predict_dataset(&self, dataset: &RatingDataset, batch_size: usize) -> Result<Vec<f32>> {
        let batch_size = batch_size.max(1);
        let mut predictions = Vec::with_capacity(dataset.samples().len());

        for chunk in dataset.samples().chunks(batch_size) {
            let features: Vec<f32> = chunk
                .iter()
                .flat_map(|item| item.features.iter().copied())
                .collect();
            predictions.extend(self.predict_batch(&features, chunk.len())?);
        }

        Ok(predictions)
    }

    /// 単一画像の評価値を予測（小数点以下2桁に丸める）
    pub fn predict_image(
        &self,
        image_path: &Path,
        extractor: Option<&dyn FeatureExtractor>,
    ) -> Result<f32> {
        let features = self.image_features(image_path, extractor)?;
        let prediction = self
            .predict_batch(&features, 1)?
            .first()
            .copied()
            .ok_or_else(|| RaterError::Inference("empty prediction".into()))?;

        Ok(round_rating(prediction))
    }
}

/// 小数点以下2桁に丸める
pub fn round_rating(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// 予測コマンドの入力
#[derive(Debug, Clone)]
pub struct PredictOptions {
    /// "A" または "B"
    pub model_type: String,
    pub image_path: PathBuf,
    pub channels: usize,
    /// モデルのディレクトリ（None の場合は設定ファイルの値）
    pub model_dir: Option<PathBuf>,
}

/// 予測結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub model_type: ModelType,
    pub rating: f32,
}

/// 予測コマンド
///
/// モデル種別 → モデル読み込み → （Model B のみ）特徴抽出器読み込み → 推論 の順で処理する。
pub fn predict<B: Backend>(
    options: &PredictOptions,
    config: &RaterConfig,
    device: &B::Device,
) -> Result<Prediction> {
    let model_type: ModelType = options.model_type.parse()?;
    let model_dir = options
        .model_dir
        .clone()
        .unwrap_or_else(|| config.paths.model_dir(model_type).to_path_buf());

    let engine = InferenceEngine::<B>::load(&model_dir, model_type, device)?;
    if engine.metadata().channels != options.channels {
        return Err(RaterError::InvalidConfig(format!(
            "model was trained with {} channels, got {}",
            engine.metadata().channels,
            options.channels
        )));
    }

    let rating = match model_type {
        ModelType::A => engine.predict_image(&options.image_path, None)?,
        ModelType::B => {
            let extractor = MobileNetV2Extractor::<B>::load(&config.paths.extractor_weights, device)?;
            engine.predict_image(&options.image_path, Some(&extractor))?
        }
    };

    Ok(Prediction { model_type, rating })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::image_loader::ImageTensor;
    use crate::model::save_model;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    struct ConstantExtractor(usize);

    impl FeatureExtractor for ConstantExtractor {
        fn embedding_dim(&self) -> usize {
            self.0
        }

        fn infer(&self, _image: &ImageTensor) -> Result<Vec<f32>> {
            Ok(vec![0.5; self.0])
        }
    }

    fn save_model_a(dir: &Path) {
        let device = Default::default();
        let model = RatingCnnConfig::new()
            .with_image_size(16)
            .init::<TestBackend>(&device)
            .unwrap();
        let metadata = ModelMetadata::new(ModelType::A, vec![16, 16, 3], 16, 3, 64);
        save_model(dir, &metadata, model).unwrap();
    }

    fn save_model_b(dir: &Path, embedding_dim: usize) {
        let device = Default::default();
        let model = EmbeddingRegressorConfig::new()
            .with_embedding_dim(embedding_dim)
            .init::<TestBackend>(&device);
        let mut metadata = ModelMetadata::new(ModelType::B, vec![embedding_dim], 16, 3, 64);
        metadata.embedding_dim = Some(embedding_dim);
        save_model(dir, &metadata, model).unwrap();
    }

    fn write_image(dir: &Path) -> PathBuf {
        let path = dir.join("img.png");
        RgbImage::from_pixel(24, 24, Rgb([10, 200, 90])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_round_rating() {
        assert_eq!(round_rating(7.254_9), 7.25);
        assert_eq!(round_rating(7.255_1), 7.26);
        assert_eq!(round_rating(-0.004), -0.0);
    }

    #[test]
    fn test_load_rejects_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelA");
        save_model_a(&model_dir);

        let device = Default::default();
        let result = LoadedModel::<TestBackend>::load(&model_dir, ModelType::B, &device);
        assert!(matches!(result, Err(RaterError::ModelLoad { .. })));
    }

    #[test]
    fn test_load_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelA");
        save_model_a(&model_dir);
        std::fs::remove_file(crate::model::model_storage::weights_path(&model_dir)).unwrap();

        let device = Default::default();
        let result = InferenceEngine::<TestBackend>::load(&model_dir, ModelType::A, &device);
        assert!(matches!(result, Err(RaterError::ModelLoad { .. })));
    }

    #[test]
    fn test_predict_model_a_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelA");
        save_model_a(&model_dir);
        let image = write_image(dir.path());

        let device = Default::default();
        let engine = InferenceEngine::<TestBackend>::load(&model_dir, ModelType::A, &device).unwrap();
        let first = engine.predict_image(&image, None).unwrap();
        let second = engine.predict_image(&image, None).unwrap();

        assert!(first.is_finite());
        assert_eq!(first, second);
        assert_eq!(first, round_rating(first));
    }

    #[test]
    fn test_predict_model_b_uses_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelB");
        save_model_b(&model_dir, 8);
        let image = write_image(dir.path());

        let device = Default::default();
        let engine = InferenceEngine::<TestBackend>::load(&model_dir, ModelType::B, &device).unwrap();

        assert!(engine.predict_image(&image, Some(&ConstantExtractor(8))).is_ok());
        assert!(matches!(
            engine.predict_image(&image, None),
            Err(RaterError::InvalidConfig(_))
        ));
        assert!(matches!(
            engine.predict_image(&image, Some(&ConstantExtractor(7))),
            Err(RaterError::Inference(_))
        ));
    }

    #[test]
    fn test_predict_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelA");
        save_model_a(&model_dir);

        let device = Default::default();
        let engine = InferenceEngine::<TestBackend>::load(&model_dir, ModelType::A, &device).unwrap();
        let result = engine.predict_image(&dir.path().join("nope.png"), None);
        assert!(matches!(result, Err(RaterError::ImageDecode { .. })));
    }

    #[test]
    fn test_predict_command_unknown_type() {
        let options = PredictOptions {
            model_type: "C".to_string(),
            image_path: PathBuf::from("img.png"),
            channels: 3,
            model_dir: None,
        };
        let device = Default::default();
        let result = predict::<TestBackend>(&options, &RaterConfig::default(), &device);
        assert!(matches!(result, Err(RaterError::UnknownModelType(_))));
    }

    #[test]
    fn test_predict_command_model_a() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelA");
        save_model_a(&model_dir);
        let image = write_image(dir.path());

        let options = PredictOptions {
            model_type: "a".to_string(),
            image_path: image,
            channels: 3,
            model_dir: Some(model_dir),
        };
        let device = Default::default();
        let prediction = predict::<TestBackend>(&options, &RaterConfig::default(), &device).unwrap();
        assert_eq!(prediction.model_type, ModelType::A);
        assert!(prediction.rating.is_finite());
    }

    #[test]
    fn test_predict_dataset_in_batches_matches_single() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("my-modelB");
        save_model_b(&model_dir, 2);

        let device = Default::default();
        let engine = InferenceEngine::<TestBackend>::load(&model_dir, ModelType::B, &device).unwrap();
        let samples = (0..5)
            .map(|i| crate::ml::dataset::RatingItem {
                features: vec![i as f32, 1.0],
                rating: 0.0,
            })
            .collect();
        let dataset = RatingDataset::new(samples, vec![2]).unwrap();

        let batched = engine.predict_dataset(&dataset, 2).unwrap();
        let all_at_once = engine.predict_dataset(&dataset, 5).unwrap();
        assert_eq!(batched.len(), 5);
        for (a, b) in batched.iter().zip(&all_at_once) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
