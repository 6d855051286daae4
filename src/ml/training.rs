//! モデル学習機能
//!
//! データセット構築 → モデル初期化 → 学習ループ → 保存 の流れをまとめます。
//! 学習ループは各エポックの終わりに `EpochMetrics` をコールバックへ渡します。

use std::path::PathBuf;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
    train::RegressionOutput,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::error::{RaterError, Result};
use crate::ml::dataset::{
    create_embedding_dataset, create_pixel_dataset, AssemblyReport, RatingBatch, RatingBatcher,
    RatingDataset,
};
use crate::ml::embedding::{FeatureExtractor, MobileNetV2Extractor};
use crate::ml::ml_model::{EmbeddingRegressorConfig, RatingCnnConfig, RatingRegressor};
use crate::model::config::{ImageSettings, RaterConfig, TrainingSettings};
use crate::model::{save_model, ModelMetadata};
use crate::types::ModelType;

/// 1エポック分の学習結果
#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    /// エポック番号（1始まり）
    pub epoch: usize,
    /// 総エポック数
    pub epochs: usize,
    /// 学習データの平均損失（MSE）
    pub loss: f64,
    /// 学習データの平均絶対誤差
    pub mae: f64,
    /// 検証データの平均損失（検証データがない場合は None）
    pub val_loss: Option<f64>,
    /// 検証データの平均絶対誤差
    pub val_mae: Option<f64>,
}

/// 学習コマンドの入力
#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// "A" または "B"
    pub model_type: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub csv_path: PathBuf,
    pub images_dir: PathBuf,
    pub channels: usize,
    /// 保存先（None の場合は設定ファイルの値）
    pub output_dir: Option<PathBuf>,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub model_type: ModelType,
    pub model_dir: PathBuf,
    pub num_samples: usize,
    pub history: Vec<EpochMetrics>,
    pub assembly: AssemblyReport,
}

/// 損失と絶対誤差の累積
#[derive(Debug, Default)]
struct RunningStats {
    loss_sum: f64,
    abs_error_sum: f64,
    count: usize,
}

impl RunningStats {
    fn add<B: Backend>(&mut self, item: &RegressionOutput<B>) -> Result<()> {
        let loss = item.loss.clone().into_scalar().elem::<f64>();

        let output = item
            .output
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| RaterError::Inference(format!("{:?}", e)))?;
        let targets = item
            .targets
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| RaterError::Inference(format!("{:?}", e)))?;

        let n = targets.len();
        self.loss_sum += loss * n as f64;
        self.abs_error_sum += output
            .iter()
            .zip(&targets)
            .map(|(p, t)| (*p as f64 - *t as f64).abs())
            .sum::<f64>();
        self.count += n;
        Ok(())
    }

    fn loss(&self) -> Option<f64> {
        (self.count > 0).then(|| self.loss_sum / self.count as f64)
    }

    fn mae(&self) -> Option<f64> {
        (self.count > 0).then(|| self.abs_error_sum / self.count as f64)
    }
}

/// 検証データで損失とMAEを計算（勾配なし）
fn validate<B: Backend, M: RatingRegressor<B>>(
    model: &M,
    dataset: &RatingDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<RunningStats> {
    let mut stats = RunningStats::default();
    let indices: Vec<usize> = (0..dataset.len()).collect();

    for chunk in indices.chunks(batch_size) {
        let items = chunk.iter().filter_map(|&i| dataset.get(i)).collect();
        let batch: RatingBatch<B> = RatingBatcher.batch(items, device);
        let item = model.forward_regression(batch.inputs, batch.targets);
        stats.add(&item)?;
    }

    Ok(stats)
}

/// 学習ループ
///
/// 末尾 `validation_split` の割合を検証用に取り分け、残りを毎エポックシャッフルして
/// ミニバッチで学習する。最適化はAdam。
pub fn fit<B, M, F>(
    model: M,
    dataset: RatingDataset,
    settings: &TrainingSettings,
    device: &B::Device,
    mut on_epoch: F,
) -> Result<(M, Vec<EpochMetrics>)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + RatingRegressor<B>,
    M::InnerModule: RatingRegressor<B::InnerBackend>,
    F: FnMut(&EpochMetrics),
{
    settings.validate()?;

    if dataset.sample_len() != model.sample_len() {
        return Err(RaterError::InvalidConfig(format!(
            "dataset samples have {} features but the model expects {}",
            dataset.sample_len(),
            model.sample_len()
        )));
    }

    let (dataset_train, dataset_val) = dataset.split(settings.validation_split);
    tracing::info!("学習データ: {} 件", dataset_train.len());
    tracing::info!("検証データ: {} 件", dataset_val.len());

    let mut model = model;
    let mut optim = AdamConfig::new().init::<B, M>();
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut indices: Vec<usize> = (0..dataset_train.len()).collect();
    let mut history = Vec::with_capacity(settings.num_epochs);

    for epoch in 1..=settings.num_epochs {
        indices.shuffle(&mut rng);
        let mut train_stats = RunningStats::default();

        for chunk in indices.chunks(settings.batch_size) {
            let items = chunk.iter().filter_map(|&i| dataset_train.get(i)).collect();
            let batch: RatingBatch<B> = RatingBatcher.batch(items, device);

            let item = model.forward_regression(batch.inputs, batch.targets);
            train_stats.add(&item)?;

            let grads = GradientsParams::from_grads(item.loss.backward(), &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let valid_stats = if dataset_val.is_empty() {
            RunningStats::default()
        } else {
            let model_valid = model.valid();
            validate::<B::InnerBackend, _>(
                &model_valid,
                &dataset_val,
                settings.batch_size,
                device,
            )?
        };

        let metrics = EpochMetrics {
            epoch,
            epochs: settings.num_epochs,
            loss: train_stats.loss().unwrap_or(f64::NAN),
            mae: train_stats.mae().unwrap_or(f64::NAN),
            val_loss: valid_stats.loss(),
            val_mae: valid_stats.mae(),
        };
        tracing::debug!("{:?}", metrics);
        on_epoch(&metrics);
        history.push(metrics);
    }

    Ok((model, history))
}

/// コマンド引数を設定に反映した学習設定
fn training_settings(options: &TrainOptions, config: &RaterConfig) -> TrainingSettings {
    TrainingSettings {
        num_epochs: options.epochs,
        batch_size: options.batch_size,
        ..config.training.clone()
    }
}

fn image_settings(options: &TrainOptions, config: &RaterConfig) -> Result<ImageSettings> {
    if options.channels != 1 && options.channels != 3 {
        return Err(RaterError::UnsupportedChannels(options.channels));
    }
    Ok(ImageSettings {
        channels: options.channels,
        ..config.image
    })
}

fn output_dir(options: &TrainOptions, config: &RaterConfig, model_type: ModelType) -> PathBuf {
    options
        .output_dir
        .clone()
        .unwrap_or_else(|| config.paths.model_dir(model_type).to_path_buf())
}

/// メタデータを作成してモデルを保存
fn persist<B: Backend, M: burn::module::Module<B>>(
    mut metadata: ModelMetadata,
    model: M,
    settings: &TrainingSettings,
    num_samples: usize,
    history: &[EpochMetrics],
    model_dir: &std::path::Path,
) -> Result<()> {
    metadata.num_epochs = settings.num_epochs;
    metadata.batch_size = settings.batch_size;
    metadata.learning_rate = settings.learning_rate;
    metadata.num_samples = num_samples;
    if let Some(last) = history.last() {
        metadata.final_loss = Some(last.loss);
        metadata.final_mae = Some(last.mae);
        metadata.final_val_loss = last.val_loss;
        metadata.final_val_mae = last.val_mae;
    }

    tracing::info!("モデルを保存します: {}", model_dir.display());
    save_model(model_dir, &metadata, model)
}

/// Model A（CNN）を学習して保存
pub fn train_model_a<B: AutodiffBackend>(
    options: &TrainOptions,
    config: &RaterConfig,
    device: &B::Device,
    on_epoch: impl FnMut(&EpochMetrics),
) -> Result<TrainingReport> {
    let settings = training_settings(options, config);
    settings.validate()?;
    let image = image_settings(options, config)?;

    tracing::info!("Model A のデータセットを読み込みます");
    let dataset = create_pixel_dataset(&options.csv_path, &options.images_dir, &image)?;
    let num_samples = dataset.len();
    let assembly = dataset.report().clone();

    let model_config = RatingCnnConfig::new()
        .with_image_size(image.image_size)
        .with_channels(image.channels);
    let model = model_config.init::<B>(device)?;

    tracing::info!("Model A を学習します");
    let (model, history) = fit(model, dataset, &settings, device, on_epoch)?;

    let model_dir = output_dir(options, config, ModelType::A);
    let metadata = ModelMetadata::new(
        ModelType::A,
        vec![image.image_size, image.image_size, image.channels],
        image.image_size,
        image.channels,
        model_config.hidden_units,
    );
    persist::<B::InnerBackend, _>(
        metadata,
        model.valid(),
        &settings,
        num_samples,
        &history,
        &model_dir,
    )?;

    Ok(TrainingReport {
        model_type: ModelType::A,
        model_dir,
        num_samples,
        history,
        assembly,
    })
}

/// Model B（埋め込み + 全結合）を学習して保存
pub fn train_model_b<B: AutodiffBackend>(
    options: &TrainOptions,
    config: &RaterConfig,
    extractor: &dyn FeatureExtractor,
    device: &B::Device,
    on_epoch: impl FnMut(&EpochMetrics),
) -> Result<TrainingReport> {
    let settings = training_settings(options, config);
    settings.validate()?;
    let image = image_settings(options, config)?;

    tracing::info!("Model B の埋め込みを生成します");
    let dataset =
        create_embedding_dataset(&options.csv_path, &options.images_dir, &image, extractor)?;
    let num_samples = dataset.len();
    let assembly = dataset.report().clone();

    let embedding_dim = extractor.embedding_dim();
    let model_config = EmbeddingRegressorConfig::new().with_embedding_dim(embedding_dim);
    let model = model_config.init::<B>(device);

    tracing::info!("Model B を学習します");
    let (model, history) = fit(model, dataset, &settings, device, on_epoch)?;

    let model_dir = output_dir(options, config, ModelType::B);
    let metadata = ModelMetadata::new(
        ModelType::B,
        vec![embedding_dim],
        image.image_size,
        image.channels,
        model_config.hidden_units,
    );
    persist::<B::InnerBackend, _>(
        metadata,
        model.valid(),
        &settings,
        num_samples,
        &history,
        &model_dir,
    )?;

    Ok(TrainingReport {
        model_type: ModelType::B,
        model_dir,
        num_samples,
        history,
        assembly,
    })
}

/// 学習コマンド
///
/// モデル種別を最初に検証するため、不正な種別では何も読み込まず何も書き込まない。
/// Model B の場合は特徴抽出器をここで1回だけ読み込む。
pub fn train<B: AutodiffBackend>(
    options: &TrainOptions,
    config: &RaterConfig,
    device: &B::Device,
    on_epoch: impl FnMut(&EpochMetrics),
) -> Result<TrainingReport> {
    let model_type: ModelType = options.model_type.parse()?;

    match model_type {
        ModelType::A => train_model_a::<B>(options, config, device, on_epoch),
        ModelType::B => {
            let extractor = MobileNetV2Extractor::<B::InnerBackend>::load(&config.paths.extractor_weights, device)?;
            train_model_b::<B>(options, config, &extractor, device, on_epoch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::RatingItem;
    use crate::ml::image_loader::ImageTensor;
    use crate::ml::inference::LoadedModel;
    use crate::model::load_metadata;
    use burn::tensor::Tensor;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn linear_dataset(n: usize) -> RatingDataset {
        let samples = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                RatingItem {
                    features: vec![x, 1.0 - x],
                    rating: 2.0 * x + 1.0,
                }
            })
            .collect();
        RatingDataset::new(samples, vec![2]).unwrap()
    }

    fn small_settings(epochs: usize) -> TrainingSettings {
        TrainingSettings {
            num_epochs: epochs,
            batch_size: 4,
            learning_rate: 1e-2,
            validation_split: 0.2,
            seed: 42,
        }
    }

    fn write_images(dir: &Path, n: usize) -> PathBuf {
        let mut csv = String::from("filename;rating\n");
        for i in 0..n {
            let name = format!("img{}.png", i);
            let shade = (i * 25) as u8;
            RgbImage::from_pixel(20, 20, Rgb([shade, 255 - shade, 128]))
                .save(dir.join(&name))
                .unwrap();
            csv.push_str(&format!("./{};{}\n", name, i));
        }
        let path = dir.join("labels.csv");
        std::fs::write(&path, csv).unwrap();
        path
    }

    struct MeanColorExtractor;

    impl FeatureExtractor for MeanColorExtractor {
        fn embedding_dim(&self) -> usize {
            crate::ml::EMBEDDING_DIM
        }

        fn infer(&self, image: &ImageTensor) -> Result<Vec<f32>> {
            let mean = image.data().iter().sum::<f32>() / image.data().len() as f32;
            Ok(vec![mean; crate::ml::EMBEDDING_DIM])
        }
    }

    #[test]
    fn test_fit_reports_every_epoch() {
        let device = Default::default();
        let model = EmbeddingRegressorConfig::new()
            .with_embedding_dim(2)
            .init::<TestAutodiffBackend>(&device);

        let mut seen = Vec::new();
        let (_, history) = fit(model, linear_dataset(10), &small_settings(3), &device, |m| {
            seen.push(m.epoch)
        })
        .unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(history.len(), 3);
        for metrics in &history {
            assert_eq!(metrics.epochs, 3);
            assert!(metrics.loss.is_finite());
            assert!(metrics.mae.is_finite());
            assert!(metrics.val_loss.is_some());
            assert!(metrics.val_mae.is_some());
        }
    }

    #[test]
    fn test_fit_reduces_loss() {
        let device = Default::default();
        let model = EmbeddingRegressorConfig::new()
            .with_embedding_dim(2)
            .init::<TestAutodiffBackend>(&device);

        let (_, history) =
            fit(model, linear_dataset(40), &small_settings(60), &device, |_| {}).unwrap();
        let first = history.first().unwrap().loss;
        let last = history.last().unwrap().loss;
        assert!(last < first, "loss did not decrease: {} -> {}", first, last);
    }

    #[test]
    fn test_fit_rejects_shape_mismatch() {
        let device = Default::default();
        let model = EmbeddingRegressorConfig::new()
            .with_embedding_dim(5)
            .init::<TestAutodiffBackend>(&device);

        let result = fit(model, linear_dataset(4), &small_settings(1), &device, |_| {});
        assert!(matches!(result, Err(RaterError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_model_type_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("my-modelC");
        let options = TrainOptions {
            model_type: "C".to_string(),
            epochs: 1,
            batch_size: 2,
            csv_path: dir.path().join("labels.csv"),
            images_dir: dir.path().to_path_buf(),
            channels: 3,
            output_dir: Some(output.clone()),
        };

        let device = Default::default();
        let result = train::<TestAutodiffBackend>(&options, &RaterConfig::default(), &device, |_| {});

        assert!(matches!(result, Err(RaterError::UnknownModelType(_))));
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_unsupported_channels() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_images(dir.path(), 2);
        let options = TrainOptions {
            model_type: "A".to_string(),
            epochs: 1,
            batch_size: 1,
            csv_path: csv,
            images_dir: dir.path().to_path_buf(),
            channels: 4,
            output_dir: Some(dir.path().join("my-modelA")),
        };

        let device = Default::default();
        let result = train::<TestAutodiffBackend>(&options, &RaterConfig::default(), &device, |_| {});
        assert!(matches!(result, Err(RaterError::UnsupportedChannels(4))));
    }

    #[test]
    fn test_train_model_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_images(dir.path(), 6);
        let model_dir = dir.path().join("my-modelA");

        let mut config = RaterConfig::default();
        config.image.image_size = 16;

        let options = TrainOptions {
            model_type: "A".to_string(),
            epochs: 2,
            batch_size: 2,
            csv_path: csv,
            images_dir: dir.path().to_path_buf(),
            channels: 3,
            output_dir: Some(model_dir.clone()),
        };

        let device = Default::default();
        let report = train::<TestAutodiffBackend>(&options, &config, &device, |_| {}).unwrap();
        assert_eq!(report.model_type, ModelType::A);
        assert_eq!(report.num_samples, 6);
        assert_eq!(report.history.len(), 2);

        let metadata = load_metadata(&model_dir).unwrap();
        assert_eq!(metadata.model_type, ModelType::A);
        assert_eq!(metadata.input_shape, vec![16, 16, 3]);
        assert_eq!(metadata.num_epochs, 2);

        // 同じ重み・同じ入力なら同じ出力
        let first = LoadedModel::<TestBackend>::load(&model_dir, ModelType::A, &device).unwrap();
        let second = LoadedModel::<TestBackend>::load(&model_dir, ModelType::A, &device).unwrap();
        let input = Tensor::<TestBackend, 2>::ones([1, 16 * 16 * 3], &device);
        let a = first.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let b = second.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_train_model_b_with_injected_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_images(dir.path(), 5);
        let model_dir = dir.path().join("my-modelB");

        let mut config = RaterConfig::default();
        config.image.image_size = 16;

        let options = TrainOptions {
            model_type: "B".to_string(),
            epochs: 1,
            batch_size: 2,
            csv_path: csv,
            images_dir: dir.path().to_path_buf(),
            channels: 3,
            output_dir: Some(model_dir.clone()),
        };

        let device = Default::default();
        let report = train_model_b::<TestAutodiffBackend>(
            &options,
            &config,
            &MeanColorExtractor,
            &device,
            |_| {},
        )
        .unwrap();
        assert_eq!(report.num_samples, 5);
        assert_eq!(report.assembly.accepted(), 5);

        let metadata = load_metadata(&model_dir).unwrap();
        assert_eq!(metadata.model_type, ModelType::B);
        assert_eq!(metadata.embedding_dim, Some(crate::ml::EMBEDDING_DIM));
        assert_eq!(metadata.num_samples, 5);
    }
}
