//! 画像の読み込みと正規化

use image::imageops::FilterType;
use std::path::{Path, PathBuf};

use crate::error::{RaterError, Result};

/// デフォルトの画像サイズ（MobileNetV2の入力解像度）
pub const DEFAULT_IMAGE_SIZE: usize = 224;

/// デフォルトのチャネル数
pub const DEFAULT_CHANNELS: usize = 3;

/// 正規化済みの画像テンソル
///
/// 形状は `[1, H, W, C]`、値は `[0, 1]`。データは NHWC の行優先で並ぶ。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    shape: [usize; 4],
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    /// バッチ次元を除いた形状 `[H, W, C]`
    pub fn sample_shape(&self) -> Vec<usize> {
        self.shape[1..].to_vec()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// CSVのファイル名から画像パスを組み立てる
///
/// 先頭の `./` を取り除いてから画像ディレクトリと結合する。
pub fn resolve_image_path(images_dir: &Path, filename: &str) -> PathBuf {
    let cleaned = filename.strip_prefix("./").unwrap_or(filename);
    images_dir.join(cleaned)
}

/// 画像を読み込んで正規化
///
/// アスペクト比は保持せず `size x size` に引き伸ばし、アルファチャネルを捨て、
/// 各画素値を255で割る。
///
/// # 引数
/// - `path`: 画像ファイルのパス
/// - `size`: リサイズ後の一辺
/// - `channels`: 3 (RGB) または 1 (グレースケール)
pub fn load_image_tensor(path: &Path, size: usize, channels: usize) -> Result<ImageTensor> {
    if channels != 1 && channels != 3 {
        return Err(RaterError::UnsupportedChannels(channels));
    }

    let img = image::open(path).map_err(|source| RaterError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;

    let resized = img.resize_exact(size as u32, size as u32, FilterType::Triangle);

    let raw = if channels == 3 {
        resized.to_rgb8().into_raw()
    } else {
        resized.to_luma8().into_raw()
    };

    let data: Vec<f32> = raw.into_iter().map(|v| v as f32 / 255.0).collect();
    debug_assert_eq!(data.len(), size * size * channels);

    Ok(ImageTensor {
        data,
        shape: [1, size, size, channels],
    })
}
