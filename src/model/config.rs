//! アプリケーション設定管理モジュール
//!
//! データセットの場所、モデル構成、学習パラメータ、出力ファイル名などを
//! JSON形式で保存・読み込みします。すべての項目にデフォルト値があるため、
//! 設定ファイルは変更したい項目だけを書けば動作します。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 画素値の正規化方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Normalization {
    /// 0-255 を 0-1 に縮小するだけ
    Rescale,
    /// 0-1 に縮小した後、ImageNetの平均と標準偏差で正規化
    ImageNet,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::ImageNet
    }
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Normalization::Rescale => write!(f, "rescale"),
            Normalization::ImageNet => write!(f, "imagenet"),
        }
    }
}

impl std::str::FromStr for Normalization {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rescale" => Ok(Normalization::Rescale),
            "imagenet" => Ok(Normalization::ImageNet),
            other => Err(anyhow::anyhow!("Unknown normalization: {}", other)),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// 学習用ディレクトリ（サブディレクトリ名がクラス名）
    pub train_dir: String,
    /// 検証用ディレクトリ
    pub val_dir: String,
    /// テスト用ディレクトリ
    pub test_dir: String,
    /// モデル入力サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// 正規化方式
    pub normalization: Normalization,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            train_dir: "train".to_string(),
            val_dir: "val".to_string(),
            test_dir: "test".to_string(),
            image_size: 224,
            normalization: Normalization::default(),
        }
    }
}

/// 学習用データ拡張の設定
///
/// 各範囲はランダム値の上限で、実際の値は `[-range, range]` から一様に選ばれます。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationSettings {
    /// データ拡張を行うか
    pub enabled: bool,
    /// 回転角度の範囲（度）
    pub rotation_range: f32,
    /// 横方向シフト（画像幅に対する割合）
    pub width_shift_range: f32,
    /// 縦方向シフト（画像高さに対する割合）
    pub height_shift_range: f32,
    /// せん断角度の範囲（度）
    pub shear_range: f32,
    /// ズーム範囲（`[1 - zoom, 1 + zoom]`、縦横独立）
    pub zoom_range: f32,
    /// 50%の確率で左右反転
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 分類クラス数（学習データのクラスディレクトリ数と一致する必要がある）
    pub num_classes: usize,
    /// 分類ヘッドの隠れ層ユニット数
    pub hidden_units: usize,
    /// MobileNetV2 の幅係数
    pub width_multiplier: f64,
    /// 事前学習済み重みファイル（.safetensors または Burn の .bin）
    pub pretrained_weights: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            num_classes: 8,
            hidden_units: 1024,
            width_multiplier: 1.0,
            pretrained_weights: Some("weights/mobilenet_v2-imagenet.safetensors".to_string()),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数（0でオンデマンド読み込み）
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// シャッフル用ランダムシード
    pub seed: u64,
    /// Learner のアーティファクト出力先（未指定なら一時ディレクトリ）
    pub artifact_dir: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            num_workers: 0,
            learning_rate: 1e-3,
            seed: 42,
            artifact_dir: None,
        }
    }
}

/// 出力ファイル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// フル精度チェックポイント（tar.gz）
    pub checkpoint_path: String,
    /// 量子化モデル（safetensors）
    pub quantized_path: String,
    /// クラスラベル一覧（1行1ラベル）
    pub labels_path: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            checkpoint_path: "Skin_model_mobilenetv2.tar.gz".to_string(),
            quantized_path: "Skin_model_mobilenetv2.safetensors".to_string(),
            labels_path: "class_labels.txt".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    pub data: DataSettings,
    /// データ拡張設定
    pub augmentation: AugmentationSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 出力ファイル設定
    pub export: ExportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("skinscan.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    println!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    eprintln!(
                        "警告: 設定ファイルの読み込みに失敗しました ({}): {}",
                        path.display(),
                        e
                    );
                    eprintln!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            println!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// 事前学習済み重みのパスを設定
    pub fn set_pretrained_weights(&mut self, path: Option<String>) {
        self.model.pretrained_weights = path;
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("\n--- データセット ---");
        println!("学習: {}", self.data.train_dir);
        println!("検証: {}", self.data.val_dir);
        println!("テスト: {}", self.data.test_dir);
        println!("入力サイズ: {}x{}", self.data.image_size, self.data.image_size);
        println!("正規化: {}", self.data.normalization);
        println!("データ拡張: {}", if self.augmentation.enabled { "有効" } else { "無効" });
        println!("\n--- モデル ---");
        println!("分類クラス数: {}", self.model.num_classes);
        println!("隠れ層ユニット数: {}", self.model.hidden_units);
        println!("幅係数: {}", self.model.width_multiplier);
        match &self.model.pretrained_weights {
            Some(path) => println!("事前学習済み重み: {}", path),
            None => println!("事前学習済み重み: なし（ランダム初期化）"),
        }
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("\n--- 出力 ---");
        println!("チェックポイント: {}", self.export.checkpoint_path);
        println!("量子化モデル: {}", self.export.quantized_path);
        println!("ラベル: {}", self.export.labels_path);
        println!("========================\n");
    }
}
