//! 皮膚画像分類モデル
//!
//! 事前学習済み MobileNetV2 を固定した特徴抽出器として使い、
//! その上に学習対象の分類ヘッドを載せます。

use anyhow::Result;
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use std::path::Path;

use crate::ml::dataset::ImageBatch;
use crate::ml::mobilenet::{MobileNetV2, MobileNetV2Config};

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 分類ヘッドの隠れ層ユニット数
    #[config(default = 1024)]
    pub hidden_units: usize,
    /// MobileNetV2 の幅係数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl ModelConfig {
    pub fn backbone_config(&self) -> MobileNetV2Config {
        MobileNetV2Config::new().with_width_multiplier(self.width_multiplier)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> SkinClassifier<B> {
        let backbone = self.backbone_config().init(device);
        let features = backbone.out_channels();

        SkinClassifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(features, self.hidden_units).init(device),
            output: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 皮膚画像分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2 特徴抽出器（重み固定）
/// - Global Average Pooling
/// - FC: 1280 -> hidden_units + ReLU
/// - FC: hidden_units -> num_classes
#[derive(Module, Debug)]
pub struct SkinClassifier<B: Backend> {
    pub backbone: MobileNetV2<B>,
    pub pool: AdaptiveAvgPool2d,
    pub hidden: Linear<B>,
    pub output: Linear<B>,
    pub activation: Relu,
}

impl<B: Backend> SkinClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.forward_head(features)
    }

    /// 分類ヘッドのみの順伝播
    ///
    /// # 引数
    /// - `features`: 特徴マップ [batch_size, channels, h, w]
    pub fn forward_head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();

        let x = self.pool.forward(features);
        let x = x.reshape([batch_size, channels]);

        let x = self.hidden.forward(x);
        let x = self.activation.forward(x);

        self.output.forward(x)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID, ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// 順伝播と損失計算
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let features = self.backbone.forward(images);
        self.head_classification(features, targets)
    }

    /// 特徴マップから損失計算
    pub fn head_classification(
        &self,
        features: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward_head(features);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 特徴抽出器の重みを固定
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }

    /// 特徴抽出器に事前学習済み重みを読み込む
    pub fn load_pretrained_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        self.backbone = self.backbone.load_pretrained(path, device)?;
        Ok(self)
    }

    /// 学習対象（分類ヘッド）のパラメータ数
    pub fn trainable_params(&self) -> usize {
        self.hidden.num_params() + self.output.num_params()
    }

    /// 分類クラス数
    pub fn num_classes(&self) -> usize {
        self.output.weight.val().dims()[1]
    }
}

/// TrainStep実装
///
/// 特徴抽出器は内部バックエンドで推論モードのまま実行し、
/// 分類ヘッドだけを微分します。
impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for SkinClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let features = self.backbone.valid().forward(batch.images.inner());
        let features = Tensor::<B, 4>::from_inner(features);

        let item = self.head_classification(features, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for SkinClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> ModelConfig {
        ModelConfig::new(3).with_hidden_units(16).with_width_multiplier(0.35)
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let logits = model.forward(images);
        assert_eq!(logits.dims(), [2, 3]);
        assert_eq!(model.num_classes(), 3);
    }

    #[test]
    fn test_trainable_params_is_head_only() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        // hidden: 1280*16 + 16, output: 16*3 + 3
        assert_eq!(model.trainable_params(), 1280 * 16 + 16 + 16 * 3 + 3);
        assert!(model.num_params() > model.trainable_params());
    }

    #[test]
    fn test_train_step_only_updates_head() {
        let device = Default::default();
        let model = small_config().init::<TestAutodiffBackend>(&device).freeze_backbone();

        let batch = ImageBatch {
            images: Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 32, 32], &device),
            targets: Tensor::<TestAutodiffBackend, 1, Int>::from_ints([0, 2], &device),
        };

        let output = TrainStep::step(&model, batch);
        // hidden.weight, hidden.bias, output.weight, output.bias
        assert_eq!(output.grads.len(), 4);
    }

    #[test]
    fn test_predict_returns_class_indices() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let (predictions, logits) = model.predict(Tensor::zeros([4, 3, 32, 32], &device));
        assert_eq!(predictions.dims(), [4, 1]);
        assert_eq!(logits.dims(), [4, 3]);
        for class in predictions.into_data().iter::<i64>() {
            assert!((0..3).contains(&class));
        }
    }
}
