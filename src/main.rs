//! 水質分類 CLI
//!
//! 学習・評価・推論・モデル情報表示のサブコマンドを提供します。

#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};

use water_quality_lib::backend::{self, cpu_device, CpuBackend, Train};
use water_quality_lib::logging::{init_logging, LogConfig};
use water_quality_lib::ml::{train_model, Evaluator, ModelHandle, Predictor};
use water_quality_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType, InferenceConfig};
use water_quality_lib::types::WaterLabel;

#[cfg(feature = "wgpu")]
use water_quality_lib::backend::{gpu_device, GpuBackend};

/// 水面画像の Clean / Dirty 分類
#[derive(Parser, Debug)]
#[command(name = "water_quality")]
#[command(version)]
#[command(about = "Clean / dirty water image classifier", long_about = None)]
struct Cli {
    /// デバッグログを表示
    #[arg(short, long)]
    verbose: bool,

    /// 設定ファイル（無ければデフォルト設定）
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// データセットからモデルを学習
    Train {
        /// データセットのルート（train/ を含む）
        #[arg(short, long)]
        data_dir: Option<String>,

        /// モデルと学習履歴の出力先
        #[arg(short, long)]
        output_dir: Option<String>,

        /// ヘッド学習のエポック数
        #[arg(short, long)]
        epochs: Option<usize>,

        /// バックボーンを解凍して追加学習する
        #[arg(long)]
        fine_tune: bool,

        /// CPU (NdArray) で学習
        #[arg(long)]
        cpu: bool,
    },

    /// test/ でモデルを評価
    Evaluate {
        /// モデルファイル（tar.gz）
        #[arg(short, long)]
        model: PathBuf,

        /// データセットのルート（test/ を含む）
        #[arg(short, long)]
        data_dir: Option<String>,

        /// 評価結果をJSONで保存
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// 画像を分類
    Predict {
        /// モデルファイル（tar.gz）
        #[arg(short, long)]
        model: PathBuf,

        /// 画像ファイル
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// 結果をJSONで出力
        #[arg(long)]
        json: bool,
    },

    /// モデルのメタデータを表示
    Info {
        /// モデルファイル（tar.gz）
        #[arg(short, long)]
        model: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config).map_err(anyhow::Error::msg)?;

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Train {
            data_dir,
            output_dir,
            epochs,
            fine_tune,
            cpu,
        } => {
            if let Some(dir) = data_dir {
                config.dataset_dir = dir;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if fine_tune {
                config.training.fine_tune.enabled = true;
            }
            if cpu {
                config.device_type = DeviceType::Cpu;
            }
            resolve_device(&mut config);
            run_train(&config)
        }
        Commands::Evaluate {
            model,
            data_dir,
            json,
        } => {
            resolve_device(&mut config);
            let data_dir = data_dir.unwrap_or_else(|| config.dataset_dir.clone());
            match config.device_type {
                DeviceType::Cpu => {
                    run_evaluate::<CpuBackend>(&model, Path::new(&data_dir), json.as_deref(), cpu_device())
                }
                #[cfg(feature = "wgpu")]
                DeviceType::Wgpu => run_evaluate::<GpuBackend>(
                    &model,
                    Path::new(&data_dir),
                    json.as_deref(),
                    gpu_device(true),
                ),
                #[cfg(not(feature = "wgpu"))]
                DeviceType::Wgpu => unsupported_device(),
            }
        }
        Commands::Predict { model, images, json } => {
            resolve_device(&mut config);
            match config.device_type {
                DeviceType::Cpu => run_predict::<CpuBackend>(&model, &images, json, cpu_device()),
                #[cfg(feature = "wgpu")]
                DeviceType::Wgpu => run_predict::<GpuBackend>(&model, &images, json, gpu_device(true)),
                #[cfg(not(feature = "wgpu"))]
                DeviceType::Wgpu => unsupported_device(),
            }
        }
        Commands::Info { model } => run_info(&model),
    }
}

/// 設定の読み込み
///
/// `--config` で明示されたファイルは読めなければエラー。省略時は既定のパスを読み、無ければデフォルト設定。
fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    match explicit {
        Some(path) => {
            AppConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(AppConfig::load_or_default(AppConfig::default_path())),
    }
}

/// このビルドで使えないデバイスが設定されていればCPUに切り替える
fn resolve_device(config: &mut AppConfig) {
    if !backend::is_available(&config.device_type) {
        warn!(
            "{} はこのビルドでは使用できません。CPU (NdArray) を使用します",
            config.device_type
        );
        config.device_type = DeviceType::Cpu;
    }
}

#[cfg(not(feature = "wgpu"))]
fn unsupported_device() -> Result<()> {
    anyhow::bail!("WGPU backend is not enabled in this build")
}

fn run_train(config: &AppConfig) -> Result<()> {
    let report = |m: &water_quality_lib::model::EpochMetrics| {
        println!(
            "epoch {:>3} [{}] loss {:.4} acc {:.4} | val_loss {:.4} val_acc {:.4}",
            m.epoch, m.phase, m.loss, m.accuracy, m.val_loss, m.val_accuracy
        );
    };

    let outcome = match config.device_type {
        DeviceType::Cpu => train_model::<Train<CpuBackend>, _>(config, cpu_device(), report),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => train_model::<Train<GpuBackend>, _>(config, gpu_device(true), report),
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => return unsupported_device(),
    }
    .context("training failed")?;

    info!("=== 学習完了 ===");
    info!(
        "ヘッド学習: {} エポック{}",
        outcome.head_epochs,
        if outcome.early_stopped { "（早期終了）" } else { "" }
    );
    if outcome.fine_tune_epochs > 0 {
        info!("ファインチューニング: {} エポック", outcome.fine_tune_epochs);
    }
    info!(
        "最良 val_accuracy: {:.4} (エポック {})",
        outcome.best_val_accuracy, outcome.best_epoch
    );
    info!("最良モデル: {}", outcome.best_model_path.display());
    info!("最終モデル: {}", outcome.final_model_path.display());
    info!("学習履歴: {}", outcome.history_json_path.display());
    Ok(())
}

fn run_evaluate<B: Backend>(
    model_path: &Path,
    data_dir: &Path,
    json: Option<&Path>,
    device: B::Device,
) -> Result<()> {
    let handle = ModelHandle::<B>::load(model_path, device)
        .with_context(|| format!("failed to load model {}", model_path.display()))?;
    let report = Evaluator::new(&handle)
        .evaluate(data_dir)
        .with_context(|| format!("evaluation failed for {}", data_dir.display()))?;

    println!("{}", report);

    if let Some(path) = json {
        report
            .save_json(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("評価結果を保存しました: {}", path.display());
    }
    Ok(())
}

/// 推論結果（JSON出力用）
#[derive(Debug, Serialize)]
struct PredictionLine<'a> {
    path: &'a Path,
    label: WaterLabel,
    probability: f64,
    confidence: f64,
}

fn run_predict<B: Backend>(model_path: &Path, images: &[PathBuf], json: bool, device: B::Device) -> Result<()> {
    let handle = ModelHandle::<B>::load(model_path, device)
        .with_context(|| format!("failed to load model {}", model_path.display()))?;
    let predictor = Predictor::new(&handle);

    let mut lines = Vec::with_capacity(images.len());
    let mut failures = 0;

    for path in images {
        match predictor.predict_path(path) {
            Ok(result) => {
                if !json {
                    println!(
                        "{}: {} (confidence {:.2}%, p(dirty) = {:.4})",
                        path.display(),
                        result.label,
                        result.confidence,
                        result.probability
                    );
                }
                lines.push(PredictionLine {
                    path,
                    label: result.label,
                    probability: result.probability,
                    confidence: result.confidence,
                });
            }
            Err(e) => {
                error!("{}", e);
                failures += 1;
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    }

    if failures > 0 {
        anyhow::bail!("{} of {} images could not be classified", failures, images.len());
    }
    Ok(())
}

fn run_info(model_path: &Path) -> Result<()> {
    let metadata = load_metadata(model_path)
        .with_context(|| format!("failed to read model {}", model_path.display()))?;
    print_metadata_info(&metadata);
    InferenceConfig::from_metadata(&metadata).print_info();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 7;
        config.save(&path).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.training.num_epochs, 7);
    }
}
