//! モデルとメタデータの永続化
//!
//! 名前付きディレクトリ（例: `my-modelA`）にモデルとメタデータを保存・読み込みします。
//!
//! ディレクトリ構成:
//! - metadata.json   - メタデータ（モデル種別、入力形状、学習条件など）
//! - model.mpk       - モデルの重み（f32精度）

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};

use crate::error::{RaterError, Result};
use crate::model::model_metadata::ModelMetadata;

pub const METADATA_FILE: &str = "metadata.json";
const WEIGHTS_STEM: &str = "model";

/// 重みファイルのパス（拡張子はRecorderが付与する）
fn weights_stem(dir: &Path) -> PathBuf {
    dir.join(WEIGHTS_STEM)
}

/// 重みファイルの実際のパス
pub fn weights_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.mpk", WEIGHTS_STEM))
}

/// メタデータと共にモデルをディレクトリに保存
///
/// DefaultFileRecorderをFullPrecisionSettingsで使い、f32精度のまま保存する。
pub fn save_model<B: Backend, M: Module<B>>(
    dir: &Path,
    metadata: &ModelMetadata,
    model: M,
) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| RaterError::io(dir, e))?;

    let json = metadata.to_json_string()?;
    let metadata_path = dir.join(METADATA_FILE);
    std::fs::write(&metadata_path, json).map_err(|e| RaterError::io(&metadata_path, e))?;

    let num_params = model.num_params();
    model
        .save_file(
            weights_stem(dir),
            &DefaultFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|e| RaterError::Persist {
            path: dir.to_path_buf(),
            reason: format!("{:?}", e),
        })?;

    tracing::debug!(
        "モデルを保存しました: {} ({} パラメータ)",
        dir.display(),
        num_params
    );

    Ok(())
}

/// ディレクトリからメタデータを読み込む
pub fn load_metadata(dir: &Path) -> Result<ModelMetadata> {
    let metadata_path = dir.join(METADATA_FILE);
    let json = std::fs::read_to_string(&metadata_path)
        .map_err(|e| RaterError::model_load(dir, format!("{}: {}", METADATA_FILE, e)))?;
    ModelMetadata::from_json_string(&json)
        .map_err(|e| RaterError::model_load(dir, format!("{}: {}", METADATA_FILE, e)))
}

/// 初期化済みモデルに保存済みの重みを読み込む
pub fn load_weights<B: Backend, M: Module<B>>(
    dir: &Path,
    model: M,
    device: &B::Device,
) -> Result<M> {
    let path = weights_path(dir);
    if !path.exists() {
        return Err(RaterError::model_load(
            dir,
            format!("weights not found: {}", path.display()),
        ));
    }

    model
        .load_file(
            weights_stem(dir),
            &DefaultFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| RaterError::model_load(dir, format!("モデル重みの読み込みエラー: {:?}", e)))
}
