//! データセット構築
//!
//! CSVのレコードごとに画像を読み込み、Model A 用（生画素）または
//! Model B 用（埋め込み）のサンプル列を作ります。
//! 画像単位の失敗はレコードをスキップして `AssemblyReport` に記録し、
//! 全体の構築は続行します。

use std::path::Path;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor},
};

use crate::csv_loader::load_csv;
use crate::error::{RaterError, Result};
use crate::ml::embedding::FeatureExtractor;
use crate::ml::image_loader::{load_image_tensor, resolve_image_path};
use crate::model::config::ImageSettings;
use crate::types::RatingRecord;

/// スキップ理由
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// 画像の読み込み失敗
    ImageLoad(String),
    /// 特徴抽出器の実行失敗
    EmbeddingFailed(String),
    /// 埋め込みの長さが不正
    EmbeddingLength { expected: usize, actual: usize },
    /// 埋め込みに NaN / 無限大が含まれる
    NonFiniteEmbedding { index: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ImageLoad(msg) => write!(f, "画像読み込み失敗: {}", msg),
            SkipReason::EmbeddingFailed(msg) => write!(f, "埋め込み計算失敗: {}", msg),
            SkipReason::EmbeddingLength { expected, actual } => {
                write!(f, "埋め込みの長さが不正: {} (期待: {})", actual, expected)
            }
            SkipReason::NonFiniteEmbedding { index } => {
                write!(f, "埋め込みに非有限値が含まれる (index {})", index)
            }
        }
    }
}

/// レコード単位の処理結果
#[derive(Debug, Clone, PartialEq)]
pub enum RecordStatus {
    Accepted,
    Skipped(SkipReason),
}

/// CSVの1行に対する結果
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    /// CSV内の行番号（0始まり、ヘッダー除く）
    pub index: usize,
    pub filename: String,
    pub status: RecordStatus,
}

/// データセット構築の結果一覧
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssemblyReport {
    pub outcomes: Vec<RecordOutcome>,
}

impl AssemblyReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn accepted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == RecordStatus::Accepted)
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, RecordStatus::Skipped(_)))
    }
}

/// データセットアイテム（特徴と評価値の組）
#[derive(Clone, Debug, PartialEq)]
pub struct RatingItem {
    pub features: Vec<f32>,
    pub rating: f32,
}

/// メモリ上のデータセット
#[derive(Debug, Clone)]
pub struct RatingDataset {
    samples: Vec<RatingItem>,
    sample_shape: Vec<usize>,
    report: AssemblyReport,
}

impl RatingDataset {
    /// サンプル列から作成
    ///
    /// すべてのサンプルの特徴数が `sample_shape` の要素数と一致する必要がある。
    pub fn new(samples: Vec<RatingItem>, sample_shape: Vec<usize>) -> Result<Self> {
        let sample_len: usize = sample_shape.iter().product();
        if let Some(bad) = samples.iter().find(|s| s.features.len() != sample_len) {
            return Err(RaterError::InvalidConfig(format!(
                "sample has {} features, expected {}",
                bad.features.len(),
                sample_len
            )));
        }

        Ok(Self {
            samples,
            sample_shape,
            report: AssemblyReport::default(),
        })
    }

    fn with_report(mut self, report: AssemblyReport) -> Self {
        self.report = report;
        self
    }

    /// 入力 `x` の形状: [N, ...sample_shape]
    pub fn x_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.samples.len()];
        shape.extend_from_slice(&self.sample_shape);
        shape
    }

    /// ラベル `y` の形状: [N]
    pub fn y_shape(&self) -> [usize; 1] {
        [self.samples.len()]
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    pub fn sample_len(&self) -> usize {
        self.sample_shape.iter().product()
    }

    pub fn samples(&self) -> &[RatingItem] {
        &self.samples
    }

    pub fn ratings(&self) -> Vec<f32> {
        self.samples.iter().map(|s| s.rating).collect()
    }

    pub fn report(&self) -> &AssemblyReport {
        &self.report
    }

    /// 学習用と検証用に分割
    ///
    /// 先頭 `floor(N * (1 - validation_ratio))` 件を学習用、残りの末尾を検証用にする
    /// （CSV順を保持）。学習用には最低1件残す。
    pub fn split(self, validation_ratio: f64) -> (Self, Self) {
        let total = self.samples.len();
        let train_len = ((total as f64) * (1.0 - validation_ratio)).floor() as usize;
        let train_len = train_len.max(1).min(total);

        let mut train = self.samples;
        let valid = train.split_off(train_len);

        (
            Self {
                samples: train,
                sample_shape: self.sample_shape.clone(),
                report: self.report,
            },
            Self {
                samples: valid,
                sample_shape: self.sample_shape,
                report: AssemblyReport::default(),
            },
        )
    }
}

impl Dataset<RatingItem> for RatingDataset {
    fn get(&self, index: usize) -> Option<RatingItem> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// CSVを読み込み、空ならエラー
fn load_records(csv_path: &Path) -> Result<Vec<RatingRecord>> {
    let records = load_csv(csv_path)?;
    if records.is_empty() {
        return Err(RaterError::EmptyDataset(format!(
            "CSVにデータがありません: {}",
            csv_path.display()
        )));
    }
    tracing::info!("CSVから {} 件のレコードを読み込みました", records.len());
    Ok(records)
}

/// レコードごとに特徴を計算し、成功したものだけをサンプルにする
fn assemble<F>(
    records: &[RatingRecord],
    images_dir: &Path,
    mut featurize: F,
) -> (Vec<RatingItem>, AssemblyReport)
where
    F: FnMut(&Path) -> std::result::Result<Vec<f32>, SkipReason>,
{
    let mut samples = Vec::with_capacity(records.len());
    let mut report = AssemblyReport::default();

    for (index, record) in records.iter().enumerate() {
        let image_path = resolve_image_path(images_dir, &record.filename);

        let status = match featurize(image_path.as_path()) {
            Ok(features) => {
                samples.push(RatingItem {
                    features,
                    rating: record.rating,
                });
                RecordStatus::Accepted
            }
            Err(reason) => {
                tracing::warn!("スキップ {}: {}", image_path.display(), reason);
                RecordStatus::Skipped(reason)
            }
        };

        report.outcomes.push(RecordOutcome {
            index,
            filename: record.filename.clone(),
            status,
        });
    }

    (samples, report)
}

/// 生画素のデータセットを構築（Model A）
///
/// x: [N, H, W, C]、y: [N]
pub fn create_pixel_dataset(
    csv_path: &Path,
    images_dir: &Path,
    image: &ImageSettings,
) -> Result<RatingDataset> {
    let records = load_records(csv_path)?;

    let (samples, report) = assemble(&records, images_dir, |path| {
        load_image_tensor(path, image.image_size, image.channels)
            .map(|tensor| tensor.into_data())
            .map_err(|e| SkipReason::ImageLoad(e.to_string()))
    });

    if samples.is_empty() {
        return Err(RaterError::EmptyDataset(
            "有効な画像がありません。パスとCSVの形式を確認してください".into(),
        ));
    }

    let dataset = RatingDataset::new(
        samples,
        vec![image.image_size, image.image_size, image.channels],
    )?
    .with_report(report);

    tracing::info!(
        "データセット作成: x={:?}, y={:?} ({} 件スキップ)",
        dataset.x_shape(),
        dataset.y_shape(),
        dataset.report().total() - dataset.report().accepted()
    );

    Ok(dataset)
}

/// 埋め込みを検証する
///
/// 長さが `expected` と一致し、すべて有限値のときのみ受け入れる。
pub fn validate_embedding(embedding: &[f32], expected: usize) -> std::result::Result<(), SkipReason> {
    if embedding.len() != expected {
        return Err(SkipReason::EmbeddingLength {
            expected,
            actual: embedding.len(),
        });
    }
    if let Some(index) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(SkipReason::NonFiniteEmbedding { index });
    }
    Ok(())
}

/// 埋め込みのデータセットを構築（Model B）
///
/// x: [M, 1280]、y: [M]。特徴と評価値は組のまま扱うため、
/// 検証で除外されたレコードがあってもずれない。
pub fn create_embedding_dataset(
    csv_path: &Path,
    images_dir: &Path,
    image: &ImageSettings,
    extractor: &dyn FeatureExtractor,
) -> Result<RatingDataset> {
    let records = load_records(csv_path)?;
    let dim = extractor.embedding_dim();

    let (samples, report) = assemble(&records, images_dir, |path| {
        let tensor = load_image_tensor(path, image.image_size, image.channels)
            .map_err(|e| SkipReason::ImageLoad(e.to_string()))?;
        let embedding = extractor
            .infer(&tensor)
            .map_err(|e| SkipReason::EmbeddingFailed(e.to_string()))?;
        validate_embedding(&embedding, dim)?;

        tracing::debug!(
            "埋め込み {}: {:?}... ({} 値)",
            path.display(),
            &embedding[..embedding.len().min(5)],
            embedding.len()
        );
        Ok(embedding)
    });

    if samples.is_empty() {
        return Err(RaterError::EmptyDataset(
            "有効な埋め込みがありません。画像が読み込めるか確認してください".into(),
        ));
    }

    let dataset = RatingDataset::new(samples, vec![dim])?.with_report(report);

    tracing::info!(
        "データセット作成: x={:?}, y={:?} ({} 件スキップ)",
        dataset.x_shape(),
        dataset.y_shape(),
        dataset.report().total() - dataset.report().accepted()
    );

    Ok(dataset)
}

/// バッチャー
#[derive(Clone, Debug, Default)]
pub struct RatingBatcher;

/// バッチデータ
#[derive(Clone, Debug)]
pub struct RatingBatch<B: Backend> {
    /// 平坦化した入力 [batch_size, sample_len]
    pub inputs: Tensor<B, 2>,
    /// 評価値 [batch_size, 1]
    pub targets: Tensor<B, 2>,
}

impl<B: Backend> Batcher<B, RatingItem, RatingBatch<B>> for RatingBatcher {
    fn batch(&self, items: Vec<RatingItem>, device: &B::Device) -> RatingBatch<B> {
        let batch_size = items.len();
        let sample_len = items.first().map(|i| i.features.len()).unwrap_or(0);

        let mut all_features = Vec::with_capacity(batch_size * sample_len);
        let mut targets = Vec::with_capacity(batch_size);
        for item in items {
            all_features.extend_from_slice(&item.features);
            targets.push(item.rating);
        }

        let inputs = Tensor::<B, 1>::from_floats(all_features.as_slice(), device)
            .reshape([batch_size, sample_len]);
        let targets = Tensor::<B, 1>::from_floats(targets.as_slice(), device)
            .reshape([batch_size, 1]);

        RatingBatch { inputs, targets }
    }
}
