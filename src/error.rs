//! エラー型の定義
//!
//! データセット構築・学習・推論・評価で発生するエラーを1つの列挙型にまとめます。
//! 画像単位の失敗はここには現れず、`ml::dataset::RecordOutcome` として記録されます。

use std::path::PathBuf;
use thiserror::Error;

/// image_rater 全体のエラー
#[derive(Debug, Error)]
pub enum RaterError {
    /// ファイル・ディレクトリの読み書き失敗
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSVの構文エラーや必須カラムの欠落
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// ratingが有限の数値として解釈できない
    #[error("invalid rating {value:?} on line {line}")]
    InvalidRating { line: u64, value: String },

    /// 画像のデコード失敗（存在しない・破損・未対応形式）
    #[error("failed to decode image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 対応していないチャネル数
    #[error("unsupported channel count: {0} (expected 1 or 3)")]
    UnsupportedChannels(usize),

    /// 有効なレコードが1件も残らなかった
    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    /// 不明なモデル種別
    #[error("unknown model type {0:?}: use \"A\" or \"B\"")]
    UnknownModelType(String),

    /// 保存済みモデルの読み込み失敗
    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    /// 評価時に入力テンソルや予測値が得られなかった
    #[error("missing input: {0}")]
    MissingInput(String),

    /// ハイパーパラメータや設定値が不正
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// テンソルからの値の取り出しに失敗
    #[error("inference failed: {0}")]
    Inference(String),

    /// モデルの保存失敗
    #[error("failed to persist model to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

pub type Result<T, E = RaterError> = std::result::Result<T, E>;

impl RaterError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RaterError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        RaterError::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
