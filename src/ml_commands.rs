//! コマンド実装
//!
//! 設定のデバイス種別に応じてバックエンドを選び、学習・評価・推論を実行します。

use anyhow::{Context, Result};
use burn::backend::Wgpu;
use burn::tensor::backend::Backend;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use std::path::{Path, PathBuf};

use crate::ml::{
    evaluate, train_model, EvalMetrics, ImageBatcher, ImageFolderDataset, ImagePipeline, InferenceEngine,
    Prediction, QuantizedArtifact, TrainingReport,
};
use crate::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};

/// 標準出力へのログ
pub fn console_log(line: String) {
    println!("{}", line);
}

/// 学習を実行
pub fn train_command(config: &AppConfig) -> Result<TrainingReport> {
    console_log(format!("[Train] 使用デバイス: {}", config.device_type));

    match config.device_type {
        DeviceType::Wgpu => train_model::<Autodiff<Wgpu>>(config, WgpuDevice::default(), console_log),
        DeviceType::Cpu => train_model::<Autodiff<NdArray>>(config, NdArrayDevice::Cpu, console_log),
    }
}

fn evaluate_with<B: Backend>(model_path: &Path, config: &AppConfig, device: B::Device) -> Result<EvalMetrics> {
    let engine = InferenceEngine::<B>::load(model_path, device.clone())?;
    engine.config().print_info();

    let test_dir = Path::new(&config.data.test_dir);
    let dataset = ImageFolderDataset::from_directory_with_classes(test_dir, engine.labels())
        .with_context(|| format!("Failed to load test data: {}", test_dir.display()))?;
    console_log(format!("[Eval] テストデータ: {} 枚", burn::data::dataset::Dataset::len(&dataset)));

    let pipeline = ImagePipeline::new(engine.config().image_size, engine.config().normalization);
    let batcher = ImageBatcher::<B>::new(device, pipeline, config.training.seed);
    evaluate(engine.model(), dataset, batcher, config.training.batch_size)
}

/// 出力済みモデル（チェックポイントまたは量子化モデル）をテストデータで評価
pub fn evaluate_command(model_path: &Path, config: &AppConfig) -> Result<EvalMetrics> {
    match config.device_type {
        DeviceType::Wgpu => evaluate_with::<Wgpu>(model_path, config, WgpuDevice::default()),
        DeviceType::Cpu => evaluate_with::<NdArray>(model_path, config, NdArrayDevice::Cpu),
    }
}

fn predict_with<B: Backend>(model_path: &Path, images: &[PathBuf], device: B::Device) -> Result<Vec<Prediction>> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    engine.classify_batch(images)
}

/// 画像を分類
pub fn predict_command(model_path: &Path, images: &[PathBuf], device_type: DeviceType) -> Result<Vec<Prediction>> {
    match device_type {
        DeviceType::Wgpu => predict_with::<Wgpu>(model_path, images, WgpuDevice::default()),
        DeviceType::Cpu => predict_with::<NdArray>(model_path, images, NdArrayDevice::Cpu),
    }
}

/// 出力ファイルの内容を表示
pub fn inspect_command(path: &Path) -> Result<()> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => QuantizedArtifact::load(path)?.print_info(),
        _ => print_metadata_info(&load_metadata(path)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{export_all, ModelConfig};
    use crate::model::ModelMetadata;

    #[test]
    fn test_inspect_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.data.image_size = 32;
        config.model.hidden_units = 8;
        config.model.width_multiplier = 0.35;
        config.export.checkpoint_path = dir.path().join("m.tar.gz").to_string_lossy().to_string();
        config.export.quantized_path = dir.path().join("m.safetensors").to_string_lossy().to_string();
        config.export.labels_path = dir.path().join("labels.txt").to_string_lossy().to_string();

        let model = ModelConfig::new(2)
            .with_hidden_units(8)
            .with_width_multiplier(0.35)
            .init::<NdArray>(&NdArrayDevice::Cpu);
        let metadata = ModelMetadata::new(vec!["x".into(), "y".into()], &config);
        let paths = export_all(&model, &metadata, &config.export, &|_| {}).unwrap();

        inspect_command(&paths.checkpoint).unwrap();
        inspect_command(&paths.quantized).unwrap();
        assert!(inspect_command(&dir.path().join("labels.txt")).is_err());
    }
}
