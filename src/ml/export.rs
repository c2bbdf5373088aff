//! 学習済みモデルの出力
//!
//! 1. フル精度チェックポイント（tar.gz: metadata.json + model.bin）
//! 2. 量子化モデル（safetensors）
//! 3. クラスラベル一覧（1行1ラベル、クラスインデックス順）

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::path::{Path, PathBuf};

use crate::ml::ml_model::{ModelConfig, SkinClassifier};
use crate::ml::quantize::QuantizedArtifact;
use crate::model::{load_model_with_metadata, save_model_with_metadata, write_labels, ExportSettings, ModelMetadata};

/// 出力ファイルのパス
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPaths {
    pub checkpoint: PathBuf,
    pub quantized: PathBuf,
    pub labels: PathBuf,
}

/// フル精度チェックポイントを保存
///
/// 実際に書き込んだパスを返します。
pub fn export_checkpoint<B: Backend>(
    model: &SkinClassifier<B>,
    metadata: &ModelMetadata,
    path: &Path,
) -> Result<PathBuf> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(
        &recorder,
        model.clone().into_record(),
        (),
    )
    .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;

    save_model_with_metadata(path, metadata, &model_binary)
}

/// チェックポイントからモデルを復元
pub fn load_checkpoint<B: Backend>(path: &Path, device: &B::Device) -> Result<(SkinClassifier<B>, ModelMetadata)> {
    let (metadata, model_binary) = load_model_with_metadata(path)?;

    let model = ModelConfig::new(metadata.num_classes)
        .with_hidden_units(metadata.hidden_units)
        .with_width_multiplier(metadata.width_multiplier)
        .init::<B>(device);

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((model.load_record(record), metadata))
}

/// 量子化モデルを保存
pub fn export_quantized<B: Backend>(
    model: &SkinClassifier<B>,
    metadata: &ModelMetadata,
    path: &Path,
) -> Result<PathBuf> {
    let artifact = QuantizedArtifact::from_model(model, metadata);
    artifact.save(path)?;
    Ok(path.to_path_buf())
}

/// 3種類すべてを出力
pub fn export_all<B: Backend>(
    model: &SkinClassifier<B>,
    metadata: &ModelMetadata,
    settings: &ExportSettings,
    log_callback: &impl Fn(String),
) -> Result<ExportPaths> {
    let checkpoint = export_checkpoint(model, metadata, Path::new(&settings.checkpoint_path))
        .context("Failed to export checkpoint")?;
    log_callback(format!("[Export] チェックポイント: {}", checkpoint.display()));

    let quantized = export_quantized(model, metadata, Path::new(&settings.quantized_path))
        .context("Failed to export quantized model")?;
    log_callback(format!(
        "[Export] 量子化モデル: {} ({:.2} MB)",
        quantized.display(),
        file_size_mb(&quantized)
    ));

    let labels = PathBuf::from(&settings.labels_path);
    write_labels(&labels, &metadata.class_labels).context("Failed to export class labels")?;
    log_callback(format!(
        "[Export] クラスラベル: {} ({} クラス)",
        labels.display(),
        metadata.class_labels.len()
    ));

    Ok(ExportPaths {
        checkpoint,
        quantized,
        labels,
    })
}

fn file_size_mb(path: &Path) -> f64 {
    std::fs::metadata(path)
        .map(|m| m.len() as f64 / 1024.0 / 1024.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{read_labels, AppConfig};
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_export_all_writes_three_files() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();

        let mut config = AppConfig::default();
        config.data.image_size = 32;
        config.model.hidden_units = 16;
        config.model.width_multiplier = 0.35;
        config.export.checkpoint_path = dir.path().join("out/model").to_string_lossy().to_string();
        config.export.quantized_path = dir.path().join("out/model.safetensors").to_string_lossy().to_string();
        config.export.labels_path = dir.path().join("out/labels.txt").to_string_lossy().to_string();

        let labels = vec!["acne".to_string(), "eczema".to_string(), "rosacea".to_string()];
        let metadata = ModelMetadata::new(labels.clone(), &config);
        let model = ModelConfig::new(3)
            .with_hidden_units(16)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&device);

        let logs = std::cell::RefCell::new(Vec::new());
        let paths = export_all(&model, &metadata, &config.export, &|msg| logs.borrow_mut().push(msg)).unwrap();

        assert!(paths.checkpoint.ends_with("model.tar.gz"));
        assert!(paths.checkpoint.exists());
        assert!(paths.quantized.exists());
        assert_eq!(read_labels(&paths.labels).unwrap(), labels);
        assert_eq!(logs.borrow().len(), 3);

        let (restored, restored_metadata) = load_checkpoint::<TestBackend>(&paths.checkpoint, &device).unwrap();
        assert_eq!(restored_metadata.class_labels, labels);

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let expected: Vec<f32> = model.forward(input.clone()).into_data().iter::<f32>().collect();
        let actual: Vec<f32> = restored.forward(input).into_data().iter::<f32>().collect();
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
