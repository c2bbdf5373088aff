//! モデル学習と評価
//!
//! 1. データセット読み込み（train / val / test）
//! 2. モデル構築（事前学習済み特徴抽出器 + 分類ヘッド）
//! 3. 学習（Adam、交差エントロピー）
//! 4. テストデータで評価
//! 5. チェックポイント・量子化モデル・ラベルを出力

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::Module,
    optim::AdamConfig,
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder, LearningStrategy,
    },
};
use std::path::{Path, PathBuf};

use crate::ml::augment::ImagePipeline;
use crate::ml::dataset::{ImageBatcher, ImageFolderDataset};
use crate::ml::export::{export_all, ExportPaths};
use crate::ml::ml_model::{ModelConfig, SkinClassifier};
use crate::model::{AppConfig, ModelMetadata};

/// 評価結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    /// サンプル平均の交差エントロピー
    pub loss: f64,
    /// 正解率 (0.0 - 1.0)
    pub accuracy: f64,
    pub num_samples: usize,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// クラスラベル（クラスインデックス順）
    pub class_labels: Vec<String>,
    pub train_samples: usize,
    pub val_samples: usize,
    pub test: EvalMetrics,
    pub exports: ExportPaths,
}

/// 3分割のデータセット
pub struct DatasetSplits {
    pub train: ImageFolderDataset,
    pub val: ImageFolderDataset,
    pub test: ImageFolderDataset,
}

impl DatasetSplits {
    pub fn class_labels(&self) -> &[String] {
        self.train.class_names()
    }
}

fn log_split(name: &str, dataset: &ImageFolderDataset, log_callback: &impl Fn(String)) {
    log_callback(format!("[Data] {}: {} 枚", name, dataset.len()));
    for (index, (class, count)) in dataset.class_names().iter().zip(dataset.class_counts()).enumerate() {
        log_callback(format!("  {:>2} {}: {} 枚", index, class, count));
    }
}

/// train / val / test を読み込む
///
/// クラス順は学習用ディレクトリから決まり、検証・テスト用もそれに従います。
pub fn load_splits(config: &AppConfig, log_callback: &impl Fn(String)) -> Result<DatasetSplits> {
    let train_dir = Path::new(&config.data.train_dir);
    let train = ImageFolderDataset::from_directory(train_dir)
        .with_context(|| format!("Failed to load training data: {}", train_dir.display()))?;
    train.validate_class_count(config.model.num_classes)?;

    let classes = train.class_names().to_vec();
    log_callback(format!("[Data] クラス ({}個): {}", classes.len(), classes.join(", ")));

    let val_dir = Path::new(&config.data.val_dir);
    let val = ImageFolderDataset::from_directory_with_classes(val_dir, &classes)
        .with_context(|| format!("Failed to load validation data: {}", val_dir.display()))?;

    let test_dir = Path::new(&config.data.test_dir);
    let test = ImageFolderDataset::from_directory_with_classes(test_dir, &classes)
        .with_context(|| format!("Failed to load test data: {}", test_dir.display()))?;

    log_split("学習データ", &train, log_callback);
    log_split("検証データ", &val, log_callback);
    log_split("テストデータ", &test, log_callback);

    Ok(DatasetSplits { train, val, test })
}

/// モデルを構築し、事前学習済み重みを読み込んで特徴抽出器を固定
pub fn build_model<B: Backend>(
    config: &AppConfig,
    device: &B::Device,
    log_callback: &impl Fn(String),
) -> Result<SkinClassifier<B>> {
    let model_config = ModelConfig::new(config.model.num_classes)
        .with_hidden_units(config.model.hidden_units)
        .with_width_multiplier(config.model.width_multiplier);
    let model = model_config.init::<B>(device);

    let model = match &config.model.pretrained_weights {
        Some(path) => {
            log_callback(format!("[Model] 事前学習済み重み: {}", path));
            model
                .load_pretrained_backbone(Path::new(path), device)
                .with_context(|| format!("Failed to load pretrained weights: {}", path))?
        }
        None => {
            eprintln!("警告: 事前学習済み重みが指定されていません。特徴抽出器はランダム初期化のままです");
            model
        }
    };
    let model = model.freeze_backbone();

    log_callback(format!(
        "[Model] MobileNetV2 (幅係数 {}) + FC {} + FC {}",
        config.model.width_multiplier, config.model.hidden_units, config.model.num_classes
    ));
    log_callback(format!(
        "[Model] パラメータ数: {} (学習対象: {})",
        model.num_params(),
        model.trainable_params()
    ));

    Ok(model)
}

/// データセット全体で損失と正解率を計算
pub fn evaluate<B: Backend>(
    model: &SkinClassifier<B>,
    dataset: ImageFolderDataset,
    batcher: ImageBatcher<B>,
    batch_size: usize,
) -> Result<EvalMetrics> {
    if dataset.is_empty() {
        anyhow::bail!("評価データが空です");
    }

    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size.max(1))
        .num_workers(0)
        .build(dataset);

    let mut total_loss = 0.0f64;
    let mut correct = 0i64;
    let mut num_samples = 0usize;

    for batch in dataloader.iter() {
        let output = model.forward_classification(batch.images, batch.targets);
        let [n] = output.targets.dims();

        let loss = output.loss.into_scalar().elem::<f64>();
        total_loss += loss * n as f64;

        correct += output
            .output
            .argmax(1)
            .reshape([n])
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        num_samples += n;
    }

    Ok(EvalMetrics {
        loss: total_loss / num_samples as f64,
        accuracy: correct as f64 / num_samples as f64,
        num_samples,
    })
}

fn artifact_dir(config: &AppConfig) -> PathBuf {
    match &config.training.artifact_dir {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("skinscan_training"),
    }
}

/// モデル学習を実行
pub fn train_model<B: AutodiffBackend>(
    config: &AppConfig,
    device: B::Device,
    log_callback: impl Fn(String),
) -> Result<TrainingReport> {
    let settings = &config.training;

    // === 1. データセット ===
    let splits = load_splits(config, &log_callback)?;
    let class_labels = splits.class_labels().to_vec();
    let train_samples = splits.train.len();
    let val_samples = splits.val.len();

    // === 2. モデル ===
    let model = build_model::<B>(config, &device, &log_callback)?;

    // === 3. 学習 ===
    let batcher_train = ImageBatcher::<B>::new(device.clone(), ImagePipeline::training(config), settings.seed);
    let batcher_val =
        ImageBatcher::<B::InnerBackend>::new(device.clone(), ImagePipeline::evaluation(config), settings.seed);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(splits.train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val.clone())
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(splits.val);

    let artifact_dir = artifact_dir(config);
    std::fs::create_dir_all(&artifact_dir)
        .context(format!("Failed to create artifact directory: {:?}", artifact_dir))?;
    let artifact_dir_str = artifact_dir.to_string_lossy().to_string();

    log_callback(format!(
        "[Train] エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.num_epochs, settings.batch_size, settings.learning_rate
    ));
    log_callback(format!("[Train] アーティファクト: {}", artifact_dir.display()));

    let learner = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(settings.num_epochs)
        .summary()
        .build(
            model,
            AdamConfig::new()
                .with_beta_1(0.9)
                .with_beta_2(0.999)
                .with_epsilon(1e-7)
                .init(),
            settings.learning_rate,
        );

    let model_trained = learner.fit(dataloader_train, dataloader_val);
    let model = model_trained.model;
    log_callback("[Train] 学習が完了しました".to_string());

    // === 4. 評価 ===
    let test = evaluate(&model, splits.test, batcher_val, settings.batch_size)?;
    log_callback(format!(
        "[Eval] テストデータ {} 枚: 損失 {:.4}, 正解率 {:.2}%",
        test.num_samples,
        test.loss,
        test.accuracy * 100.0
    ));

    // === 5. 出力 ===
    let metadata = ModelMetadata::new(class_labels.clone(), config).with_test_metrics(test.loss, test.accuracy);
    let exports = export_all(&model, &metadata, &config.export, &log_callback)?;

    Ok(TrainingReport {
        class_labels,
        train_samples,
        val_samples,
        test,
        exports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Normalization;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn write_split(root: &Path, classes: &[&str], per_class: usize) {
        for (c, class) in classes.iter().enumerate() {
            for i in 0..per_class {
                let path = root.join(class).join(format!("{i}.png"));
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                let value = (c * 80 + i * 5) as u8;
                RgbImage::from_pixel(40, 40, Rgb([value, 255 - value, 100])).save(path).unwrap();
            }
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.data.train_dir = root.join("train").to_string_lossy().to_string();
        config.data.val_dir = root.join("val").to_string_lossy().to_string();
        config.data.test_dir = root.join("test").to_string_lossy().to_string();
        config.data.image_size = 32;
        config.model.num_classes = 3;
        config.model.hidden_units = 16;
        config.model.width_multiplier = 0.35;
        config.model.pretrained_weights = None;
        config
    }

    #[test]
    fn test_load_splits_uses_training_class_order() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), &["c", "a", "b"], 2);
        write_split(&dir.path().join("val"), &["b"], 1);
        write_split(&dir.path().join("test"), &["a", "c"], 1);

        let splits = load_splits(&test_config(dir.path()), &|_| {}).unwrap();
        assert_eq!(splits.class_labels(), &["a", "b", "c"]);
        assert_eq!(splits.val.get(0).unwrap().label, 1);
        assert_eq!(splits.test.class_counts(), vec![1, 0, 1]);
    }

    #[test]
    fn test_load_splits_checks_class_count() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("train"), &["a", "b"], 1);
        write_split(&dir.path().join("val"), &["a"], 1);
        write_split(&dir.path().join("test"), &["a"], 1);

        let err = load_splits(&test_config(dir.path()), &|_| {}).err().unwrap();
        assert!(format!("{:#}", err).contains("expected 3 classes"));
    }

    #[test]
    fn test_missing_pretrained_weights_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.model.pretrained_weights = Some(dir.path().join("absent.safetensors").to_string_lossy().to_string());

        assert!(build_model::<TestBackend>(&config, &Default::default(), &|_| {}).is_err());
    }

    #[test]
    fn test_evaluate_metrics_in_range() {
        let dir = tempfile::tempdir().unwrap();
        write_split(&dir.path().join("test"), &["a", "b", "c"], 3);
        let config = test_config(dir.path());
        let device = Default::default();

        let dataset = ImageFolderDataset::from_directory(&dir.path().join("test")).unwrap();
        let model = build_model::<TestBackend>(&config, &device, &|_| {}).unwrap();
        let batcher = ImageBatcher::<TestBackend>::new(device, ImagePipeline::new(32, Normalization::ImageNet), 0);

        // 9 枚を 4 枚ずつのバッチで評価（最後は 1 枚）
        let metrics = evaluate(&model, dataset, batcher, 4).unwrap();
        assert_eq!(metrics.num_samples, 9);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        assert!(metrics.loss.is_finite() && metrics.loss >= 0.0);
    }
}
