//! 評価値回帰モデルの定義
//!
//! - Model A: 生画素から学習する小さなCNN（`RatingCnn`）
//! - Model B: MobileNetV2の埋め込みを入力とする全結合ヘッド（`EmbeddingRegressor`）
//!
//! どちらも入力は `[batch, 特徴数]` に平坦化したテンソルで受け取り、
//! `[batch, 1]` の評価値を返す。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::{MseLoss, Reduction},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
    train::RegressionOutput,
};

use crate::error::{RaterError, Result};

/// 埋め込みベクトルの次元（MobileNetV2の最終特徴数）
pub const EMBEDDING_DIM: usize = 1280;

/// 評価値回帰モデルの共通インターフェース
pub trait RatingRegressor<B: Backend> {
    /// 順伝播
    ///
    /// # 引数
    /// - `inputs`: 平坦化した入力 [batch_size, sample_len]
    ///
    /// # 戻り値
    /// - 評価値 [batch_size, 1]
    fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2>;

    /// 1サンプルあたりの入力要素数
    fn sample_len(&self) -> usize;

    /// 順伝播と損失計算（MSE）
    fn forward_regression(
        &self,
        inputs: Tensor<B, 2>,
        targets: Tensor<B, 2>,
    ) -> RegressionOutput<B> {
        let output = self.forward(inputs);
        let loss = MseLoss::new().forward(output.clone(), targets.clone(), Reduction::Mean);

        RegressionOutput::new(loss, output, targets)
    }
}

/// Model A の設定
#[derive(Config, Debug)]
pub struct RatingCnnConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// 入力チャネル数
    #[config(default = 3)]
    pub channels: usize,
    /// 隠れ層のユニット数
    #[config(default = 64)]
    pub hidden_units: usize,
}

impl RatingCnnConfig {
    /// 2段目のプーリング後の特徴マップの一辺
    ///
    /// Conv (3x3, no padding): size -> size - 2
    /// Pool (2x2, stride 2): size -> size / 2（切り捨て）
    pub fn feature_map_size(&self) -> usize {
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        after_conv2 / 2
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<RatingCnn<B>> {
        let feature_map_size = self.feature_map_size();
        if feature_map_size == 0 {
            return Err(RaterError::InvalidConfig(format!(
                "入力サイズが小さすぎます: {} (最小10x10が必要)",
                self.image_size
            )));
        }
        if self.channels == 0 {
            return Err(RaterError::InvalidConfig("channels must be at least 1".into()));
        }

        let flattened = 32 * feature_map_size * feature_map_size;

        tracing::debug!(
            "[Model A] 入力 {}x{}x{} -> 特徴マップ 32x{}x{} -> FC {} -> {} -> 1",
            self.image_size,
            self.image_size,
            self.channels,
            feature_map_size,
            feature_map_size,
            flattened,
            self.hidden_units
        );

        Ok(RatingCnn {
            conv1: Conv2dConfig::new([self.channels, 16], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([16, 32], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(flattened, self.hidden_units).init(device),
            fc2: LinearConfig::new(self.hidden_units, 1).init(device),
            activation: Relu::new(),
            image_size: self.image_size,
            channels: self.channels,
        })
    }
}

/// 評価値回帰用CNN（Model A）
///
/// # アーキテクチャ
/// - Conv 3x3 (16) + ReLU + MaxPool 2x2
/// - Conv 3x3 (32) + ReLU + MaxPool 2x2
/// - Flatten
/// - FC: d -> 64 + ReLU
/// - FC: 64 -> 1（線形）
#[derive(Module, Debug)]
pub struct RatingCnn<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
    image_size: usize,
    channels: usize,
}

impl<B: Backend> RatingCnn<B> {
    /// 画像バッチに対する順伝播
    ///
    /// # 引数
    /// - `images`: [batch_size, H, W, C]（NHWC）
    pub fn forward_images(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        // NHWC -> NCHW
        let x = images.permute([0, 3, 1, 2]);

        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }
}

impl<B: Backend> RatingRegressor<B> for RatingCnn<B> {
    fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, _] = inputs.dims();
        let images = inputs.reshape([batch_size, self.image_size, self.image_size, self.channels]);
        self.forward_images(images)
    }

    fn sample_len(&self) -> usize {
        self.image_size * self.image_size * self.channels
    }
}

/// Model B の設定
#[derive(Config, Debug)]
pub struct EmbeddingRegressorConfig {
    /// 埋め込み次元
    #[config(default = 1280)]
    pub embedding_dim: usize,
    /// 隠れ層のユニット数
    #[config(default = 64)]
    pub hidden_units: usize,
}

impl EmbeddingRegressorConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmbeddingRegressor<B> {
        EmbeddingRegressor {
            fc1: LinearConfig::new(self.embedding_dim, self.hidden_units).init(device),
            fc2: LinearConfig::new(self.hidden_units, 1).init(device),
            activation: Relu::new(),
            embedding_dim: self.embedding_dim,
        }
    }
}

/// 埋め込み入力の全結合回帰ヘッド（Model B）
///
/// FC: 1280 -> 64 + ReLU -> FC: 64 -> 1
#[derive(Module, Debug)]
pub struct EmbeddingRegressor<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
    embedding_dim: usize,
}

impl<B: Backend> RatingRegressor<B> for EmbeddingRegressor<B> {
    fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(inputs);
        let x = self.activation.forward(x);
        self.fc2.forward(x)
    }

    fn sample_len(&self) -> usize {
        self.embedding_dim
    }
}
