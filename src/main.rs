//! skinscan コマンドラインツール

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use skinscan_trainer::ml_commands::{evaluate_command, inspect_command, predict_command, train_command};
use skinscan_trainer::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(version, about = "クラスごとのディレクトリ構成の画像で MobileNetV2 を微調整")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 学習し、テストデータで評価して全ての成果物を出力
    Train {
        /// JSON 設定ファイル（省略時は ./skinscan.json があれば使用）
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, value_enum)]
        device: Option<DeviceArg>,
        /// 事前学習済み重み（torchvision 形式の .safetensors または Burn のレコード）
        #[arg(long, conflicts_with = "no_pretrained")]
        weights: Option<String>,
        /// 特徴抽出器をランダム初期化から学習
        #[arg(long, default_value_t = false)]
        no_pretrained: bool,
    },
    /// 出力済みのチェックポイントまたは量子化モデルをテストデータで評価
    Evaluate {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        device: Option<DeviceArg>,
    },
    /// 出力済みモデルで画像を分類
    Predict {
        #[arg(long)]
        model: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
        device: DeviceArg,
    },
    /// チェックポイントまたは量子化モデルのメタデータを表示
    Inspect { path: PathBuf },
    /// デフォルト設定をファイルに書き出す
    InitConfig { path: Option<PathBuf> },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceArg {
    Wgpu,
    Cpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Wgpu => DeviceType::Wgpu,
            DeviceArg::Cpu => DeviceType::Cpu,
        }
    }
}

fn load_config(path: Option<PathBuf>) -> AppConfig {
    match path {
        Some(path) => AppConfig::load_or_default_from(path),
        None => AppConfig::load_or_default(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            epochs,
            batch_size,
            device,
            weights,
            no_pretrained,
        } => {
            let mut config = load_config(config);
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(device) = device {
                config.set_device_type(device.into());
            }
            if weights.is_some() || no_pretrained {
                config.set_pretrained_weights(weights);
            }
            config.display();

            let report = train_command(&config)?;
            println!("Test Loss: {}, Test Accuracy: {}", report.test.loss, report.test.accuracy);
        }
        Command::Evaluate { model, config, device } => {
            let mut config = load_config(config);
            if let Some(device) = device {
                config.set_device_type(device.into());
            }
            let metrics = evaluate_command(&model, &config)?;
            println!("Test Loss: {}, Test Accuracy: {}", metrics.loss, metrics.accuracy);
        }
        Command::Predict { model, images, device } => {
            let predictions = predict_command(&model, &images, device.into())?;
            for (path, prediction) in images.iter().zip(predictions) {
                println!(
                    "{}: {} ({:.1}%)",
                    path.display(),
                    prediction.label,
                    prediction.confidence * 100.0
                );
            }
        }
        Command::Inspect { path } => inspect_command(&path)?,
        Command::InitConfig { path } => {
            let path = path.unwrap_or_else(AppConfig::default_path);
            AppConfig::default().save(&path)?;
            println!("設定ファイルを作成しました: {}", path.display());
        }
    }

    Ok(())
}
