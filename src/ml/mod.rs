//! 機械学習モジュール
//!
//! 画像分類モデルの定義、学習、評価、出力、推論を提供します。

pub mod augment;
pub mod dataset;
pub mod export;
pub mod inference;
pub mod ml_model;
pub mod mobilenet;
pub mod quantize;
pub mod training;

pub use augment::{ImagePipeline, RandomAffine};
pub use dataset::{discover_classes, DatasetError, ImageBatch, ImageBatcher, ImageFolderDataset, ImageItem};
pub use export::{export_all, export_checkpoint, export_quantized, load_checkpoint, ExportPaths};
pub use inference::{InferenceEngine, Prediction};
pub use ml_model::{ModelConfig, SkinClassifier};
pub use mobilenet::{MobileNetV2, MobileNetV2Config};
pub use quantize::{QuantizedArtifact, QuantizedTensor};
pub use training::{build_model, evaluate, load_splits, train_model, EvalMetrics, TrainingReport};
