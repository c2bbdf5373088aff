//! モデル推論機能

use anyhow::Result;
use burn::tensor::{activation::softmax, backend::Backend, Tensor, TensorData};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

use crate::ml::augment::ImagePipeline;
use crate::ml::export::load_checkpoint;
use crate::ml::ml_model::SkinClassifier;
use crate::ml::quantize::QuantizedArtifact;
use crate::model::InferenceConfig;

/// 1枚分の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    /// softmax 確率
    pub confidence: f32,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: SkinClassifier<B>,
    config: InferenceConfig,
    pipeline: ImagePipeline,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// 拡張子で判別して読み込む（`.safetensors` は量子化モデル、それ以外はチェックポイント）
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let path = model_path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => Self::from_quantized(path, device),
            _ => Self::from_bundle(path, device),
        }
    }

    /// フル精度チェックポイントから初期化
    pub fn from_bundle(model_path: &Path, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_checkpoint::<B>(model_path, &device)?;
        Ok(Self::new(model, InferenceConfig::from_metadata(&metadata), device))
    }

    /// 量子化モデルから初期化
    pub fn from_quantized(model_path: &Path, device: B::Device) -> Result<Self> {
        let artifact = QuantizedArtifact::load(model_path)?;
        let model = artifact.into_classifier::<B>(&device)?;
        Ok(Self::new(model, artifact.inference_config(), device))
    }

    pub fn new(model: SkinClassifier<B>, config: InferenceConfig, device: B::Device) -> Self {
        let pipeline = ImagePipeline::new(config.image_size, config.normalization);
        Self {
            model,
            config,
            pipeline,
            device,
        }
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let mut predictions = self.classify_batch(&[image_path])?;
        predictions
            .pop()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    /// 複数画像をまとめて分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        if image_paths.is_empty() {
            return Ok(Vec::new());
        }

        // 推論時はデータ拡張なしなので乱数は使われない
        let mut rng = StdRng::seed_from_u64(0);
        let size = self.config.image_size;
        let mut pixels = Vec::with_capacity(image_paths.len() * self.pipeline.tensor_len());
        for path in image_paths {
            pixels.extend(self.pipeline.load(path.as_ref(), &mut rng)?);
        }

        let batch_size = image_paths.len();
        let images = Tensor::<B, 4>::from_data(TensorData::new(pixels, [batch_size, 3, size, size]), &self.device);

        let logits = self.model.forward(images);
        let num_classes = logits.dims()[1];
        let probabilities: Vec<f32> = softmax(logits, 1).into_data().iter::<f32>().collect();

        probabilities
            .chunks(num_classes)
            .map(|row| {
                let (index, confidence) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

                // クラス名に変換
                let label = self
                    .config
                    .class_index_to_label(index)
                    .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", index))?
                    .to_string();

                Ok(Prediction {
                    index,
                    label,
                    confidence,
                })
            })
            .collect()
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn labels(&self) -> &[String] {
        &self.config.class_labels
    }

    pub fn model(&self) -> &SkinClassifier<B> {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::Normalization;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_classify_batch_returns_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (i, value) in [0u8, 128, 255].iter().enumerate() {
            let path = dir.path().join(format!("{i}.png"));
            RgbImage::from_pixel(50, 30, Rgb([*value, 20, 200])).save(&path).unwrap();
            paths.push(path);
        }

        let device = Default::default();
        let model = ModelConfig::new(2)
            .with_hidden_units(8)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&device);
        let config = InferenceConfig {
            class_labels: vec!["benign".into(), "malignant".into()],
            image_size: 32,
            normalization: Normalization::ImageNet,
        };
        let engine = InferenceEngine::new(model, config, device);

        let predictions = engine.classify_batch(&paths).unwrap();
        assert_eq!(predictions.len(), 3);
        for prediction in &predictions {
            assert!(prediction.index < 2);
            assert_eq!(prediction.label, engine.labels()[prediction.index]);
            assert!(prediction.confidence >= 0.5 && prediction.confidence <= 1.0);
        }

        let single = engine.classify_image(&paths[1]).unwrap();
        assert_eq!(single.index, predictions[1].index);
    }
}
