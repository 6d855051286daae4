//! torchvision の MobileNetV2 の重みを Burn のレコードに変換するバイナリ
//!
//! 使い方: convert_extractor <mobilenet_v2.pth> <出力パス（.mpk は自動で付与）>

use burn_ndarray::{NdArray, NdArrayDevice};
use image_rater_lib::ml::convert_torchvision_weights;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let (input, output) = match (args.get(1), args.get(2)) {
        (Some(input), Some(output)) => (PathBuf::from(input), PathBuf::from(output)),
        _ => {
            eprintln!("使い方: convert_extractor <mobilenet_v2.pth> <出力パス>");
            return ExitCode::FAILURE;
        }
    };

    match convert_torchvision_weights::<NdArray>(&input, &output, &NdArrayDevice::Cpu) {
        Ok(num_params) => {
            println!(
                "✓ {} -> {} ({} パラメータ)",
                input.display(),
                output.with_extension("mpk").display(),
                num_params
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ 変換失敗: {}", e);
            ExitCode::FAILURE
        }
    }
}
