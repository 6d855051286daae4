//! 学習・予測・評価のコマンド
//!
//! 設定のデバイス種別に応じてバックエンドを選び、結果を標準出力に表示します。

use anyhow::{Context, Result};
use burn::backend::{Autodiff, Wgpu};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use std::path::Path;

use crate::ml::{
    compare, evaluate, predict, train, AssemblyReport, EpochMetrics, EvaluateOptions,
    EvaluationReport, PredictOptions, TrainOptions,
};
use crate::model::{DeviceType, RaterConfig};

/// エポックごとの進捗表示
fn print_epoch(metrics: &EpochMetrics) {
    let mut line = format!(
        "Epoch {} / {} | loss={:.4} | mae={:.4}",
        metrics.epoch, metrics.epochs, metrics.loss, metrics.mae
    );
    if let (Some(val_loss), Some(val_mae)) = (metrics.val_loss, metrics.val_mae) {
        line.push_str(&format!(" | val_loss={:.4} | val_mae={:.4}", val_loss, val_mae));
    }
    println!("{}", line);
}

/// スキップしたレコードの一覧
fn print_assembly(report: &AssemblyReport) {
    let skipped: Vec<_> = report.skipped().collect();
    if skipped.is_empty() {
        return;
    }

    println!(
        "{} / {} 件のレコードをスキップしました:",
        skipped.len(),
        report.total()
    );
    for outcome in skipped {
        if let crate::ml::RecordStatus::Skipped(reason) = &outcome.status {
            println!("  [{}] {}: {}", outcome.index, outcome.filename, reason);
        }
    }
}

fn print_evaluation(report: &EvaluationReport) {
    print_assembly(&report.assembly);
    println!(
        "Model {} ({}): n={} | mse={:.4} | mae={:.4}",
        report.model_type,
        report.model_dir.display(),
        report.num_samples,
        report.metrics.mse,
        report.metrics.mae
    );
}

/// 学習コマンド
pub fn run_train(options: &TrainOptions, config: &RaterConfig) -> Result<()> {
    tracing::info!("使用デバイス: {}", config.device_type);

    let report = match config.device_type {
        DeviceType::Wgpu => {
            train::<Autodiff<Wgpu>>(options, config, &WgpuDevice::default(), print_epoch)
        }
        DeviceType::Cpu => {
            train::<Autodiff<NdArray>>(options, config, &NdArrayDevice::Cpu, print_epoch)
        }
    }
    .with_context(|| format!("Model {} の学習に失敗しました", options.model_type))?;

    print_assembly(&report.assembly);
    println!(
        "Model {} を保存しました: {} ({} サンプル)",
        report.model_type,
        report.model_dir.display(),
        report.num_samples
    );
    Ok(())
}

/// 予測コマンド
pub fn run_predict(options: &PredictOptions, config: &RaterConfig) -> Result<()> {
    let prediction = match config.device_type {
        DeviceType::Wgpu => predict::<Wgpu>(options, config, &WgpuDevice::default()),
        DeviceType::Cpu => predict::<NdArray>(options, config, &NdArrayDevice::Cpu),
    }
    .with_context(|| format!("予測に失敗しました: {}", options.image_path.display()))?;

    println!(
        "Predicted rating (Model {}) = {:.2}",
        prediction.model_type, prediction.rating
    );
    Ok(())
}

/// 評価コマンド
pub fn run_evaluate(options: &EvaluateOptions, config: &RaterConfig) -> Result<()> {
    let report = match config.device_type {
        DeviceType::Wgpu => evaluate::<Wgpu>(options, config, &WgpuDevice::default()),
        DeviceType::Cpu => evaluate::<NdArray>(options, config, &NdArrayDevice::Cpu),
    }
    .with_context(|| format!("評価に失敗しました: {}", options.model_path.display()))?;

    print_evaluation(&report);
    Ok(())
}

/// Model A と Model B の比較
///
/// 両方とも失敗した場合のみエラー。
pub fn run_compare(test_csv: &Path, images_dir: &Path, config: &RaterConfig) -> Result<()> {
    let entries = match config.device_type {
        DeviceType::Wgpu => {
            compare::<Wgpu>(test_csv, images_dir, config, &WgpuDevice::default())
        }
        DeviceType::Cpu => compare::<NdArray>(test_csv, images_dir, config, &NdArrayDevice::Cpu),
    };

    let mut succeeded = 0;
    for entry in &entries {
        match &entry.result {
            Ok(report) => {
                print_evaluation(report);
                succeeded += 1;
            }
            Err(e) => println!(
                "Model {} ({}): 評価できませんでした: {}",
                entry.model_type,
                entry.model_dir.display(),
                e
            ),
        }
    }

    if succeeded == 0 {
        anyhow::bail!("どちらのモデルも評価できませんでした");
    }
    Ok(())
}
