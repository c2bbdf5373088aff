//! 推論設定
//!
//! 保存されたメタデータ（チェックポイントまたは量子化モデル）から、
//! 推論に必要な前処理とクラスラベルの対応を取り出します。

use crate::model::config::Normalization;
use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// 全クラスラベル（クラスインデックス順）
    pub class_labels: Vec<String>,

    /// モデル入力解像度（正方形）
    pub image_size: usize,

    /// 入力画像の正規化方式
    pub normalization: Normalization,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            image_size: metadata.image_size,
            normalization: metadata.normalization,
        }
    }

    /// クラス数を取得
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスからラベルを取得（位置による対応）
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_labels.get(index).map(String::as_str)
    }

    /// ラベルからクラスインデックスを取得
    pub fn label_to_class_index(&self, label: &str) -> Option<usize> {
        self.class_labels.iter().position(|l| l == label)
    }

    /// 設定情報を表示
    pub fn print_info(&self) {
        println!("\n=== 推論設定 ===");
        println!("クラス数: {}", self.num_classes());
        println!("クラスラベル: {}", self.class_labels.join(", "));
        println!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        println!("正規化: {}", self.normalization);
        println!("==================");
    }
}
