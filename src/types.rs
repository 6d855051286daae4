use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::RaterError;

/// CSVの1行: 画像ファイル名と評価値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub filename: String,
    pub rating: f32,
}

/// モデル種別
///
/// - `A`: 生画素から学習するCNN
/// - `B`: MobileNetV2の埋め込みを入力とする全結合ヘッド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    A,
    B,
}

impl ModelType {
    /// モデルパスの部分文字列からモデル種別を推定
    ///
    /// "modelA" を含めばA、"modelB" を含めばB。
    pub fn from_model_path(path: &str) -> Result<Self, RaterError> {
        if path.contains("modelA") {
            Ok(ModelType::A)
        } else if path.contains("modelB") {
            Ok(ModelType::B)
        } else {
            Err(RaterError::UnknownModelType(path.to_string()))
        }
    }
}

impl FromStr for ModelType {
    type Err = RaterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(ModelType::A),
            "B" | "b" => Ok(ModelType::B),
            other => Err(RaterError::UnknownModelType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelType::A => write!(f, "A"),
            ModelType::B => write!(f, "B"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_type() {
        assert_eq!("A".parse::<ModelType>().unwrap(), ModelType::A);
        assert_eq!("b".parse::<ModelType>().unwrap(), ModelType::B);
        assert!(matches!(
            "C".parse::<ModelType>(),
            Err(RaterError::UnknownModelType(s)) if s == "C"
        ));
    }

    #[test]
    fn test_model_type_from_path() {
        assert_eq!(ModelType::from_model_path("my-modelA").unwrap(), ModelType::A);
        assert_eq!(ModelType::from_model_path("./out/my-modelB").unwrap(), ModelType::B);
        assert!(ModelType::from_model_path("my-model").is_err());
    }
}
