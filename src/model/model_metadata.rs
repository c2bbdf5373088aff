//! モデルメタデータの定義と永続化
//!
//! tar.gz形式のチェックポイントに同梱され、推論時にモデル構成と
//! クラスラベルの並び順を復元するために使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::config::{AppConfig, Normalization};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// 全クラスラベル（クラスインデックス順）
    /// 例: ["acne", "eczema", "melanoma", ...]
    pub class_labels: Vec<String>,

    /// 分類クラス数
    pub num_classes: usize,

    /// モデル入力サイズ（正方形）
    pub image_size: usize,

    /// 分類ヘッドの隠れ層ユニット数
    pub hidden_units: usize,

    /// MobileNetV2 の幅係数
    pub width_multiplier: f64,

    /// 入力画像の正規化方式（推論時も同じ前処理が必要）
    pub normalization: Normalization,

    /// 学習エポック数
    pub num_epochs: usize,

    /// バッチサイズ
    pub batch_size: usize,

    /// 学習率
    pub learning_rate: f64,

    /// テストデータでの損失
    #[serde(default)]
    pub test_loss: Option<f64>,

    /// テストデータでの正解率
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 学習設定とクラスラベルからメタデータを作成
    pub fn new(class_labels: Vec<String>, config: &AppConfig) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            num_classes: class_labels.len(),
            class_labels,
            image_size: config.data.image_size,
            hidden_units: config.model.hidden_units,
            width_multiplier: config.model.width_multiplier,
            normalization: config.data.normalization,
            num_epochs: config.training.num_epochs,
            batch_size: config.training.batch_size,
            learning_rate: config.training.learning_rate,
            test_loss: None,
            test_accuracy: None,
            trained_at,
        }
    }

    /// テスト評価結果を記録
    pub fn with_test_metrics(mut self, loss: f64, accuracy: f64) -> Self {
        self.test_loss = Some(loss);
        self.test_accuracy = Some(accuracy);
        self
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.class_labels.len() != metadata.num_classes {
            anyhow::bail!(
                "metadata is inconsistent: {} class labels for {} classes",
                metadata.class_labels.len(),
                metadata.num_classes
            );
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["acne".to_string(), "eczema".to_string(), "psoriasis".to_string()]
    }

    #[test]
    fn test_new_takes_sizes_from_config() {
        let mut config = AppConfig::default();
        config.data.image_size = 96;
        config.model.hidden_units = 64;

        let metadata = ModelMetadata::new(labels(), &config);
        assert_eq!(metadata.num_classes, 3);
        assert_eq!(metadata.image_size, 96);
        assert_eq!(metadata.hidden_units, 64);
        assert!(metadata.test_accuracy.is_none());
    }

    #[test]
    fn test_json_round_trip_keeps_label_order() {
        let metadata = ModelMetadata::new(labels(), &AppConfig::default()).with_test_metrics(0.42, 0.9);
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored, metadata);
        assert_eq!(restored.class_labels[2], "psoriasis");
    }

    #[test]
    fn test_inconsistent_class_count_is_rejected() {
        let mut metadata = ModelMetadata::new(labels(), &AppConfig::default());
        metadata.num_classes = 5;
        let json = serde_json::to_string(&metadata).unwrap();

        assert!(ModelMetadata::from_json_string(&json).is_err());
    }
}
