//! 学習パイプライン全体の実行テスト（読み込み・学習・評価・出力）

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use image::{Rgb, RgbImage};
use skinscan_trainer::ml::train_model;
use skinscan_trainer::model::{load_metadata, read_labels, AppConfig};
use std::fs;
use std::path::Path;

fn write_split(root: &Path, per_class: u8) {
    for (c, class) in ["b_class", "a_class"].iter().enumerate() {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let value = if c == 0 { 30 + i } else { 220 - i };
            RgbImage::from_pixel(40, 40, Rgb([value, value, value]))
                .save(dir.join(format!("{i}.png")))
                .unwrap();
        }
    }
}

#[test]
fn train_evaluate_and_export() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_split(&root.join("train"), 6);
    write_split(&root.join("val"), 2);
    write_split(&root.join("test"), 2);

    let mut config = AppConfig::default();
    config.data.train_dir = root.join("train").to_string_lossy().to_string();
    config.data.val_dir = root.join("val").to_string_lossy().to_string();
    config.data.test_dir = root.join("test").to_string_lossy().to_string();
    config.data.image_size = 32;
    config.model.num_classes = 2;
    config.model.hidden_units = 16;
    config.model.width_multiplier = 0.35;
    config.model.pretrained_weights = None;
    config.training.num_epochs = 1;
    config.training.batch_size = 4;
    config.training.artifact_dir = Some(root.join("artifacts").to_string_lossy().to_string());
    config.export.checkpoint_path = root.join("out/model.tar.gz").to_string_lossy().to_string();
    config.export.quantized_path = root.join("out/model.safetensors").to_string_lossy().to_string();
    config.export.labels_path = root.join("out/class_labels.txt").to_string_lossy().to_string();

    let report = train_model::<Autodiff<NdArray>>(&config, NdArrayDevice::Cpu, |line| println!("{line}")).unwrap();

    assert_eq!(report.class_labels, vec!["a_class", "b_class"]);
    assert_eq!(report.train_samples, 12);
    assert_eq!(report.test.num_samples, 4);
    assert!((0.0..=1.0).contains(&report.test.accuracy));
    assert!(report.test.loss >= 0.0);

    assert_eq!(read_labels(&report.exports.labels).unwrap(), report.class_labels);
    let metadata = load_metadata(&report.exports.checkpoint).unwrap();
    assert!(metadata.test_accuracy.is_some());
    assert!(report.exports.quantized.exists());
}
