//! 保存済みモデルのメタデータを表示するバイナリ

use image_rater_lib::model::{load_metadata, weights_path};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let model_dir = match args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => {
            eprintln!("使い方: inspect_model <モデルディレクトリ>");
            return ExitCode::FAILURE;
        }
    };

    println!("=== モデル情報: {} ===", model_dir.display());

    match load_metadata(&model_dir) {
        Ok(metadata) => {
            metadata.print_info();
            println!("1サンプルあたりの入力要素数: {}", metadata.sample_len());
        }
        Err(e) => {
            eprintln!("✗ メタデータ読み込み失敗: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let weights = weights_path(&model_dir);
    match std::fs::metadata(&weights) {
        Ok(meta) => println!("重みファイル: {} ({} bytes)", weights.display(), meta.len()),
        Err(_) => println!("✗ 重みファイルがありません: {}", weights.display()),
    }

    ExitCode::SUCCESS
}
