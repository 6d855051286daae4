//! モデルメタデータの定義
//!
//! 保存ディレクトリ内の `metadata.json` にモデルの構成と学習条件を記録します。
//! 推論・評価時はこの内容からモデルを再構築します。

use serde::{Deserialize, Serialize};

use crate::error::{RaterError, Result};
use crate::types::ModelType;

/// モデルメタデータ
///
/// ディレクトリ構成：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.mpk: モデルの重み（Burn named MessagePack）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデル種別
    pub model_type: ModelType,

    /// 1サンプルあたりの入力形状
    /// Model A: [H, W, C]、Model B: [1280]
    pub input_shape: Vec<usize>,

    /// 学習時の画像サイズ（正方形の一辺）
    pub image_size: usize,

    /// 学習時のチャネル数
    pub channels: usize,

    /// 埋め込み次元（Model Bのみ）
    #[serde(default)]
    pub embedding_dim: Option<usize>,

    /// 隠れ層のユニット数
    pub hidden_units: usize,

    /// 学習エポック数
    pub num_epochs: usize,

    /// バッチサイズ
    pub batch_size: usize,

    /// 学習率
    pub learning_rate: f64,

    /// 学習に使ったサンプル数（学習 + 検証）
    pub num_samples: usize,

    /// 最終エポックの学習損失（MSE）
    #[serde(default)]
    pub final_loss: Option<f64>,

    /// 最終エポックの学習MAE
    #[serde(default)]
    pub final_mae: Option<f64>,

    /// 最終エポックの検証損失
    #[serde(default)]
    pub final_val_loss: Option<f64>,

    /// 最終エポックの検証MAE
    #[serde(default)]
    pub final_val_mae: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成（学習時刻は現在時刻）
    pub fn new(
        model_type: ModelType,
        input_shape: Vec<usize>,
        image_size: usize,
        channels: usize,
        hidden_units: usize,
    ) -> Self {
        let embedding_dim = match model_type {
            ModelType::A => None,
            ModelType::B => input_shape.first().copied(),
        };

        Self {
            model_type,
            input_shape,
            image_size,
            channels,
            embedding_dim,
            hidden_units,
            num_epochs: 0,
            batch_size: 0,
            learning_rate: 0.0,
            num_samples: 0,
            final_loss: None,
            final_mae: None,
            final_val_loss: None,
            final_val_mae: None,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RaterError::InvalidConfig(format!("failed to serialize metadata: {}", e)))
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 1サンプルあたりの要素数
    pub fn sample_len(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// メタデータをコンソールに表示
    pub fn print_info(&self) {
        println!("\n=== モデルメタデータ ===");
        println!("モデル種別: {}", self.model_type);
        println!("入力形状: {:?}", self.input_shape);
        println!("画像サイズ: {}x{} ({}ch)", self.image_size, self.image_size, self.channels);
        if let Some(dim) = self.embedding_dim {
            println!("埋め込み次元: {}", dim);
        }
        println!("隠れ層ユニット数: {}", self.hidden_units);
        println!("学習エポック数: {}", self.num_epochs);
        println!("バッチサイズ: {}", self.batch_size);
        println!("学習率: {}", self.learning_rate);
        println!("サンプル数: {}", self.num_samples);
        if let (Some(loss), Some(mae)) = (self.final_loss, self.final_mae) {
            println!("最終 loss={:.4} mae={:.4}", loss, mae);
        }
        if let (Some(loss), Some(mae)) = (self.final_val_loss, self.final_val_mae) {
            println!("最終 val_loss={:.4} val_mae={:.4}", loss, mae);
        }
        println!("学習日時: {}", self.trained_at);
        println!("========================");
    }
}
