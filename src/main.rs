//! 画像評価値の学習・予測・評価CLI
//!
//! # Commands
//!
//! - `train`: CSVと画像ディレクトリからモデルを学習して保存
//! - `predict`: 保存済みモデルで画像1枚の評価値を予測
//! - `evaluate`: テストCSVでMSE/MAEを計算（`--compare` でA/Bを比較）

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use image_rater_lib::ml::{EvaluateOptions, PredictOptions, TrainOptions};
use image_rater_lib::ml_commands;
use image_rater_lib::model::{DeviceType, RaterConfig};

/// 画像評価値の回帰モデル（CNN / MobileNetV2 転移学習）
#[derive(Parser)]
#[command(name = "image_rater")]
#[command(version)]
#[command(about = "Train, evaluate and run image rating regression models")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// 設定ファイル（省略時は rater.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 計算デバイス（wgpu / cpu）。設定ファイルの値より優先
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// モデルを学習して保存
    Train {
        /// A (CNN) または B (MobileNetV2 埋め込み)
        #[arg(long, default_value = "A")]
        model_type: String,

        /// エポック数（省略時は設定ファイルの値）
        #[arg(long)]
        epochs: Option<usize>,

        /// バッチサイズ（省略時は設定ファイルの値）
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long, default_value = "data/labels.csv")]
        csv_path: PathBuf,

        #[arg(long, default_value = "data")]
        images_dir: PathBuf,

        /// 入力チャネル数（1 または 3）
        #[arg(long)]
        channels: Option<usize>,
    },
    /// 画像1枚の評価値を予測
    Predict {
        #[arg(long)]
        model_type: String,

        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        channels: Option<usize>,
    },
    /// テストデータでモデルを評価
    Evaluate {
        /// モデルのディレクトリ（名前に modelA / modelB を含む）
        #[arg(long, default_value = "my-modelA")]
        model: PathBuf,

        #[arg(long, default_value = "test.csv")]
        test_csv: PathBuf,

        #[arg(long, default_value = "data")]
        images_dir: PathBuf,

        /// Model A と Model B を比較
        #[arg(long)]
        compare: bool,
    },
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(RaterConfig::default_path);
    let mut config = RaterConfig::load_or_default(&config_path);
    if let Some(device) = &cli.device {
        config.device_type = device
            .parse::<DeviceType>()
            .context("--device の指定が不正です")?;
    }

    match cli.command {
        Commands::Train {
            model_type,
            epochs,
            batch_size,
            csv_path,
            images_dir,
            channels,
        } => {
            let options = TrainOptions {
                model_type,
                epochs: epochs.unwrap_or(config.training.num_epochs),
                batch_size: batch_size.unwrap_or(config.training.batch_size),
                csv_path,
                images_dir,
                channels: channels.unwrap_or(config.image.channels),
                output_dir: None,
            };
            ml_commands::run_train(&options, &config)
        }
        Commands::Predict {
            model_type,
            image,
            channels,
        } => {
            let options = PredictOptions {
                model_type,
                image_path: image,
                channels: channels.unwrap_or(config.image.channels),
                model_dir: None,
            };
            ml_commands::run_predict(&options, &config)
        }
        Commands::Evaluate {
            model,
            test_csv,
            images_dir,
            compare,
        } => {
            if compare {
                ml_commands::run_compare(&test_csv, &images_dir, &config)
            } else {
                let options = EvaluateOptions {
                    model_path: model,
                    test_csv,
                    images_dir,
                };
                ml_commands::run_evaluate(&options, &config)
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    exit_status(run(cli))
}

/// 失敗時はエラーを記録してステータス1で終了
fn exit_status(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
