//! 保存済みモデルの評価
//!
//! テストCSVの全サンプルに対して順伝播を行い、MSEとMAEを計算します。

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::error::{RaterError, Result};
use crate::ml::dataset::{
    create_embedding_dataset, create_pixel_dataset, AssemblyReport, RatingDataset,
};
use crate::ml::embedding::{FeatureExtractor, MobileNetV2Extractor};
use crate::ml::inference::InferenceEngine;
use crate::model::config::{ImageSettings, RaterConfig};
use crate::types::ModelType;

/// 回帰の評価指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub mae: f64,
}

/// 正解値と予測値からMSEとMAEを計算
pub fn regression_metrics(y_true: &[f32], y_pred: &[f32]) -> Result<RegressionMetrics> {
    if y_true.len() != y_pred.len() {
        return Err(RaterError::MissingInput(format!(
            "{} labels but {} predictions",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(RaterError::MissingInput("no predictions to evaluate".into()));
    }

    let n = y_true.len() as f64;
    let (squared, absolute) = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| *t as f64 - *p as f64)
        .fold((0.0, 0.0), |(sq, abs), diff| (sq + diff * diff, abs + diff.abs()));

    Ok(RegressionMetrics {
        mse: squared / n,
        mae: absolute / n,
    })
}

/// 評価コマンドの入力
#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    /// モデルのディレクトリ（名前に "modelA" / "modelB" を含む）
    pub model_path: PathBuf,
    pub test_csv: PathBuf,
    pub images_dir: PathBuf,
}

/// 評価結果
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub model_type: ModelType,
    pub model_dir: PathBuf,
    pub num_samples: usize,
    pub metrics: RegressionMetrics,
    pub assembly: AssemblyReport,
}

/// データセットが空の場合は評価入力なしとして扱う
fn missing_on_empty(err: RaterError) -> RaterError {
    match err {
        RaterError::EmptyDataset(reason) => RaterError::MissingInput(reason),
        other => other,
    }
}

/// 読み込み済みのエンジンで評価
///
/// Model B の場合は `extractor` が必要。
pub fn evaluate_with_engine<B: Backend>(
    engine: &InferenceEngine<B>,
    options: &EvaluateOptions,
    batch_size: usize,
    extractor: Option<&dyn FeatureExtractor>,
) -> Result<EvaluationReport> {
    let metadata = engine.metadata();
    let image = ImageSettings {
        image_size: metadata.image_size,
        channels: metadata.channels,
    };

    let dataset: RatingDataset = match engine.model_type() {
        ModelType::A => create_pixel_dataset(&options.test_csv, &options.images_dir, &image),
        ModelType::B => {
            let extractor = extractor.ok_or_else(|| {
                RaterError::InvalidConfig("Model B requires a feature extractor".into())
            })?;
            create_embedding_dataset(&options.test_csv, &options.images_dir, &image, extractor)
        }
    }
    .map_err(missing_on_empty)?;

    tracing::info!("評価データ: {} 件", dataset.samples().len());

    let y_true = dataset.ratings();
    let y_pred = engine.predict_dataset(&dataset, batch_size)?;
    let metrics = regression_metrics(&y_true, &y_pred)?;

    Ok(EvaluationReport {
        model_type: engine.model_type(),
        model_dir: options.model_path.clone(),
        num_samples: y_true.len(),
        metrics,
        assembly: dataset.report().clone(),
    })
}

/// 評価コマンド
///
/// モデル種別はディレクトリ名から推定する。
pub fn evaluate<B: Backend>(
    options: &EvaluateOptions,
    config: &RaterConfig,
    device: &B::Device,
) -> Result<EvaluationReport> {
    let model_type = ModelType::from_model_path(&options.model_path.to_string_lossy())?;
    let engine = InferenceEngine::<B>::load(&options.model_path, model_type, device)?;

    match model_type {
        ModelType::A => evaluate_with_engine(&engine, options, config.training.batch_size, None),
        ModelType::B => {
            let extractor = MobileNetV2Extractor::<B>::load(&config.paths.extractor_weights, device)?;
            evaluate_with_engine(
                &engine,
                options,
                config.training.batch_size,
                Some(&extractor),
            )
        }
    }
}

/// 比較結果の1行
#[derive(Debug)]
pub struct ComparisonEntry {
    pub model_type: ModelType,
    pub model_dir: PathBuf,
    pub result: Result<EvaluationReport>,
}

/// Model A と Model B を同じテストデータで評価
///
/// 片方の評価に失敗しても、もう片方の結果は返す。
pub fn compare<B: Backend>(
    test_csv: &Path,
    images_dir: &Path,
    config: &RaterConfig,
    device: &B::Device,
) -> Vec<ComparisonEntry> {
    [ModelType::A, ModelType::B]
        .into_iter()
        .map(|model_type| {
            let model_dir = config.paths.model_dir(model_type).to_path_buf();
            let options = EvaluateOptions {
                model_path: model_dir.clone(),
                test_csv: test_csv.to_path_buf(),
                images_dir: images_dir.to_path_buf(),
            };

            let result = InferenceEngine::<B>::load(&model_dir, model_type, device).and_then(
                |engine| match model_type {
                    ModelType::A => {
                        evaluate_with_engine(&engine, &options, config.training.batch_size, None)
                    }
                    ModelType::B => {
                        let extractor = MobileNetV2Extractor::<B>::load(&config.paths.extractor_weights, device)?;
                        evaluate_with_engine(
                            &engine,
                            &options,
                            config.training.batch_size,
                            Some(&extractor),
                        )
                    }
                },
            );

            if let Err(e) = &result {
                tracing::warn!("Model {} の評価に失敗しました: {}", model_type, e);
            }

            ComparisonEntry {
                model_type,
                model_dir,
                result,
            }
        })
        .collect()
}
