//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・学習設定・画像設定・モデル保存先をJSON形式で保存・読み込みします。
//! CLIの引数で指定された値はここで読み込んだ値より優先されます。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RaterError, Result};
use crate::ml::image_loader::{DEFAULT_CHANNELS, DEFAULT_IMAGE_SIZE};
use crate::types::ModelType;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = RaterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(RaterError::InvalidConfig(format!(
                "unknown device {:?} (expected wgpu or cpu)",
                other
            ))),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率（Adam）
    pub learning_rate: f64,
    /// 検証データの割合（末尾から切り出す）
    pub validation_split: f64,
    /// ミニバッチのシャッフル用シード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 8,
            learning_rate: 1e-3,
            validation_split: 0.2,
            seed: 42,
        }
    }
}

impl TrainingSettings {
    /// 学習を始める前に値の範囲を確認
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(RaterError::InvalidConfig("epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(RaterError::InvalidConfig("batch size must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(RaterError::InvalidConfig(format!(
                "validation split must be in [0, 1): {}",
                self.validation_split
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(RaterError::InvalidConfig(format!(
                "learning rate must be positive: {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// 画像読み込み設定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSettings {
    /// リサイズ後の一辺のピクセル数（正方形）
    pub image_size: usize,
    /// チャネル数（3: RGB, 1: グレースケール）
    pub channels: usize,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            image_size: DEFAULT_IMAGE_SIZE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

/// モデル・重みファイルの保存先
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Model A の保存ディレクトリ
    pub model_a_dir: PathBuf,
    /// Model B の保存ディレクトリ
    pub model_b_dir: PathBuf,
    /// MobileNetV2 特徴抽出器の重み（拡張子 .mpk なし）
    pub extractor_weights: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            model_a_dir: PathBuf::from("my-modelA"),
            model_b_dir: PathBuf::from("my-modelB"),
            extractor_weights: PathBuf::from("models/mobilenet_v2.pth"),
        }
    }
}

impl PathSettings {
    /// モデル種別に対応する保存ディレクトリ
    pub fn model_dir(&self, model_type: ModelType) -> &Path {
        match model_type {
            ModelType::A => &self.model_a_dir,
            ModelType::B => &self.model_b_dir,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaterConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 画像設定
    #[serde(default)]
    pub image: ImageSettings,
    /// 保存先
    #[serde(default)]
    pub paths: PathSettings,
}

impl RaterConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("rater.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| RaterError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            RaterError::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("設定ファイルが存在しません。デフォルト設定を使用します: {}", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("設定ファイルの読み込みに失敗しました: {}", e);
                tracing::warn!("デフォルト設定を使用します");
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RaterError::InvalidConfig(e.to_string()))?;
        fs::write(path, content).map_err(|e| RaterError::io(path, e))
    }
}
