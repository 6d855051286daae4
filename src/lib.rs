//! 画像の評価値を予測する回帰モデル
//!
//! - Model A: 生画素から学習するCNN
//! - Model B: MobileNetV2の埋め込みを入力とする全結合ヘッド

pub mod csv_loader;
pub mod error;
pub mod ml;
pub mod ml_commands;
pub mod model;
pub mod types;

pub use error::{RaterError, Result};
pub use types::{ModelType, RatingRecord};
