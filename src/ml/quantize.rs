//! 量子化モデル
//!
//! 学習済みモデルを推論専用の軽量な safetensors ファイルに変換します。
//!
//! - Conv + BatchNorm はバイアス付き Conv に畳み込む
//! - 重みは出力チャネルごとの対称 int8（scale = max|w| / 127）
//! - バイアスは f32 のまま
//! - 全結合層の重みは `[out, in]` の順で保存
//!
//! ファイル内のテンソル:
//! - `{layer}.weight`       I8
//! - `{layer}.weight_scale` F32 （出力チャネルごと）
//! - `{layer}.bias`         F32
//!
//! `__metadata__` にはクラスラベルと前処理の情報を格納します。

use anyhow::{Context, Result};
use burn::{
    module::{Param, RunningState},
    nn::Linear,
    tensor::{backend::Backend, Tensor, TensorData},
};
use safetensors::{
    tensor::{Dtype, TensorView},
    SafeTensors,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::ml::ml_model::{ModelConfig, SkinClassifier};
use crate::ml::mobilenet::{vector, ConvBn};
use crate::model::{InferenceConfig, ModelMetadata, Normalization};

/// `__metadata__` の format タグ
pub const QUANTIZED_FORMAT: &str = "skinscan-int8-v1";

const HIDDEN_LAYER: &str = "head.hidden";
const OUTPUT_LAYER: &str = "head.output";

fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// 出力チャネルごとに量子化されたテンソル
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub shape: Vec<usize>,
    pub values: Vec<i8>,
    /// 出力チャネル（shape[0]）ごとのスケール
    pub scales: Vec<f32>,
}

impl QuantizedTensor {
    /// 対称 int8 量子化
    pub fn quantize(values: &[f32], shape: Vec<usize>) -> Self {
        let channels = shape.first().copied().unwrap_or(1).max(1);
        let per_channel = (values.len() / channels).max(1);

        let mut quantized = Vec::with_capacity(values.len());
        let mut scales = Vec::with_capacity(channels);

        for chunk in values.chunks(per_channel) {
            let max_abs = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
            scales.push(scale);
            quantized.extend(chunk.iter().map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8));
        }

        Self {
            shape,
            values: quantized,
            scales,
        }
    }

    /// f32 に戻す
    pub fn dequantize(&self) -> Vec<f32> {
        let per_channel = (self.values.len() / self.scales.len().max(1)).max(1);
        self.values
            .chunks(per_channel)
            .zip(&self.scales)
            .flat_map(|(chunk, scale)| chunk.iter().map(move |v| *v as f32 * scale))
            .collect()
    }
}

/// 量子化された1層分（重み + バイアス）
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedLayer {
    pub weight: QuantizedTensor,
    pub bias: Vec<f32>,
}

/// BatchNorm を畳み込んだ Conv の重み
#[derive(Debug, Clone)]
pub struct FoldedConv {
    pub shape: Vec<usize>,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Conv + BatchNorm をバイアス付き Conv に畳み込む
///
/// `scale = gamma / sqrt(var + eps)` として
/// `W' = W * scale`, `b' = beta + (b - mean) * scale`
pub fn fold_conv_bn<B: Backend>(layer: &ConvBn<B>) -> FoldedConv {
    let weight = layer.conv.weight.val();
    let shape = weight.dims().to_vec();
    let channels = shape[0];
    let mut folded = tensor_values(weight);

    let gamma = tensor_values(layer.norm.gamma.val());
    let beta = tensor_values(layer.norm.beta.val());
    let mean = tensor_values(layer.norm.running_mean.value());
    let var = tensor_values(layer.norm.running_var.value());
    let eps = layer.norm.epsilon as f32;
    let conv_bias = match &layer.conv.bias {
        Some(bias) => tensor_values(bias.val()),
        None => vec![0.0; channels],
    };

    let per_channel = folded.len() / channels;
    let mut bias = Vec::with_capacity(channels);
    for (o, chunk) in folded.chunks_mut(per_channel).enumerate() {
        let scale = gamma[o] / (var[o] + eps).sqrt();
        chunk.iter_mut().for_each(|w| *w *= scale);
        bias.push(beta[o] + (conv_bias[o] - mean[o]) * scale);
    }

    FoldedConv {
        shape,
        weight: folded,
        bias,
    }
}

/// 畳み込み済みの重みを Conv に戻し、BatchNorm を恒等変換にする
pub fn restore_conv_bn<B: Backend>(
    mut layer: ConvBn<B>,
    weight: Vec<f32>,
    bias: Vec<f32>,
    device: &B::Device,
) -> Result<ConvBn<B>> {
    let dims = layer.conv.weight.val().dims();
    let channels = dims[0];
    if weight.len() != dims.iter().product::<usize>() || bias.len() != channels {
        anyhow::bail!(
            "shape mismatch: weight {} / bias {} values for conv {:?}",
            weight.len(),
            bias.len(),
            dims
        );
    }

    layer.conv.weight = Param::from_tensor(Tensor::from_data(TensorData::new(weight, dims), device));
    layer.conv.bias = Some(Param::from_tensor(vector(bias, device)));

    // (x - 0) / sqrt((1 - eps) + eps) * 1 + 0 = x
    let eps = layer.norm.epsilon as f32;
    layer.norm.gamma = Param::from_tensor(vector(vec![1.0; channels], device));
    layer.norm.beta = Param::from_tensor(vector(vec![0.0; channels], device));
    layer.norm.running_mean = RunningState::new(vector(vec![0.0; channels], device));
    layer.norm.running_var = RunningState::new(vector(vec![1.0 - eps; channels], device));
    Ok(layer)
}

fn quantize_linear<B: Backend>(linear: &Linear<B>) -> QuantizedLayer {
    // Burn の重みは [in, out]
    let weight = linear.weight.val().transpose();
    let [out_features, in_features] = weight.dims();
    let bias = match &linear.bias {
        Some(bias) => tensor_values(bias.val()),
        None => vec![0.0; out_features],
    };

    QuantizedLayer {
        weight: QuantizedTensor::quantize(&tensor_values(weight), vec![out_features, in_features]),
        bias,
    }
}

fn restore_linear<B: Backend>(mut linear: Linear<B>, layer: &QuantizedLayer, device: &B::Device) -> Result<Linear<B>> {
    let [in_features, out_features] = linear.weight.val().dims();
    if layer.weight.shape != [out_features, in_features] || layer.bias.len() != out_features {
        anyhow::bail!(
            "shape mismatch: file {:?}, model [{}, {}]",
            layer.weight.shape,
            out_features,
            in_features
        );
    }

    let weight = Tensor::<B, 2>::from_data(
        TensorData::new(layer.weight.dequantize(), [out_features, in_features]),
        device,
    )
    .transpose();
    linear.weight = Param::from_tensor(weight);
    linear.bias = Some(Param::from_tensor(vector(layer.bias.clone(), device)));
    Ok(linear)
}

/// 量子化モデル
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedArtifact {
    pub class_labels: Vec<String>,
    pub image_size: usize,
    pub hidden_units: usize,
    pub width_multiplier: f64,
    pub normalization: Normalization,
    layers: BTreeMap<String, QuantizedLayer>,
}

impl QuantizedArtifact {
    /// 学習済みモデルから作成
    pub fn from_model<B: Backend>(model: &SkinClassifier<B>, metadata: &ModelMetadata) -> Self {
        let mut layers = BTreeMap::new();

        for (name, layer) in model.backbone.layers() {
            let folded = fold_conv_bn(layer);
            layers.insert(
                format!("backbone.{}", name.path()),
                QuantizedLayer {
                    weight: QuantizedTensor::quantize(&folded.weight, folded.shape),
                    bias: folded.bias,
                },
            );
        }
        layers.insert(HIDDEN_LAYER.to_string(), quantize_linear(&model.hidden));
        layers.insert(OUTPUT_LAYER.to_string(), quantize_linear(&model.output));

        Self {
            class_labels: metadata.class_labels.clone(),
            image_size: metadata.image_size,
            hidden_units: metadata.hidden_units,
            width_multiplier: metadata.width_multiplier,
            normalization: metadata.normalization,
            layers,
        }
    }

    pub fn layer(&self, name: &str) -> Option<&QuantizedLayer> {
        self.layers.get(name)
    }

    /// 指定層の重みを f32 に戻す
    pub fn dequantize(&self, name: &str) -> Option<Vec<f32>> {
        self.layer(name).map(|layer| layer.weight.dequantize())
    }

    /// 推論設定
    pub fn inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            class_labels: self.class_labels.clone(),
            image_size: self.image_size,
            normalization: self.normalization,
        }
    }

    /// 実行可能な分類モデルを再構築（BatchNorm は恒等変換）
    pub fn into_classifier<B: Backend>(&self, device: &B::Device) -> Result<SkinClassifier<B>> {
        let config = ModelConfig::new(self.class_labels.len())
            .with_hidden_units(self.hidden_units)
            .with_width_multiplier(self.width_multiplier);
        let mut model = config.init::<B>(device);

        model.backbone = model.backbone.try_map_layers(|name, layer| {
            let key = format!("backbone.{}", name.path());
            let quantized = self
                .layer(&key)
                .ok_or_else(|| anyhow::anyhow!("layer `{}` not found in quantized model", key))?;
            restore_conv_bn(layer, quantized.weight.dequantize(), quantized.bias.clone(), device)
                .with_context(|| format!("layer {}", key))
        })?;

        let hidden = self
            .layer(HIDDEN_LAYER)
            .ok_or_else(|| anyhow::anyhow!("layer `{}` not found in quantized model", HIDDEN_LAYER))?;
        model.hidden = restore_linear(model.hidden, hidden, device).context(HIDDEN_LAYER)?;

        let output = self
            .layer(OUTPUT_LAYER)
            .ok_or_else(|| anyhow::anyhow!("layer `{}` not found in quantized model", OUTPUT_LAYER))?;
        model.output = restore_linear(model.output, output, device).context(OUTPUT_LAYER)?;

        Ok(model)
    }

    fn metadata_map(&self) -> Result<HashMap<String, String>> {
        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), QUANTIZED_FORMAT.to_string());
        metadata.insert("class_labels".to_string(), serde_json::to_string(&self.class_labels)?);
        metadata.insert("num_classes".to_string(), self.class_labels.len().to_string());
        metadata.insert("image_size".to_string(), self.image_size.to_string());
        metadata.insert("hidden_units".to_string(), self.hidden_units.to_string());
        metadata.insert("width_multiplier".to_string(), self.width_multiplier.to_string());
        metadata.insert("normalization".to_string(), self.normalization.to_string());
        Ok(metadata)
    }

    /// safetensors 形式にシリアライズ
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffers: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
        for (name, layer) in &self.layers {
            let channels = layer.weight.scales.len();
            buffers.push((
                format!("{name}.weight"),
                Dtype::I8,
                layer.weight.shape.clone(),
                bytemuck::cast_slice(&layer.weight.values).to_vec(),
            ));
            buffers.push((
                format!("{name}.weight_scale"),
                Dtype::F32,
                vec![channels],
                bytemuck::cast_slice(&layer.weight.scales).to_vec(),
            ));
            buffers.push((
                format!("{name}.bias"),
                Dtype::F32,
                vec![layer.bias.len()],
                bytemuck::cast_slice(&layer.bias).to_vec(),
            ));
        }

        let mut views = Vec::with_capacity(buffers.len());
        for (name, dtype, shape, data) in &buffers {
            let view = TensorView::new(*dtype, shape.clone(), data)
                .map_err(|e| anyhow::anyhow!("invalid tensor `{}`: {:?}", name, e))?;
            views.push((name.clone(), view));
        }

        safetensors::serialize(views, &Some(self.metadata_map()?))
            .map_err(|e| anyhow::anyhow!("Failed to serialize quantized model: {:?}", e))
    }

    /// ファイルに保存
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create parent directory: {:?}", parent))?;
            }
        }
        std::fs::write(path, self.to_bytes()?).context(format!("Failed to write quantized model: {:?}", path))?;
        Ok(())
    }

    /// ファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).context(format!("Failed to read quantized model: {:?}", path))?;
        Self::from_bytes(&bytes).with_context(|| format!("Invalid quantized model: {:?}", path))
    }

    /// safetensors のバイト列から復元
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)
            .map_err(|e| anyhow::anyhow!("Failed to read safetensors header: {:?}", e))?;
        let metadata = header
            .metadata()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("__metadata__ not found"))?;

        let field = |key: &str| -> Result<&String> {
            metadata
                .get(key)
                .ok_or_else(|| anyhow::anyhow!("metadata `{}` not found", key))
        };

        if field("format")? != QUANTIZED_FORMAT {
            anyhow::bail!("unsupported format: {}", field("format")?);
        }
        let class_labels: Vec<String> = serde_json::from_str(field("class_labels")?)?;
        let image_size: usize = field("image_size")?.parse()?;
        let hidden_units: usize = field("hidden_units")?.parse()?;
        let width_multiplier: f64 = field("width_multiplier")?.parse()?;
        let normalization: Normalization = field("normalization")?.parse()?;

        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|e| anyhow::anyhow!("Failed to parse safetensors: {:?}", e))?;

        let mut layers = BTreeMap::new();
        for name in tensors.names() {
            let Some(layer_name) = name.strip_suffix(".weight_scale") else {
                continue;
            };

            let weight = tensors
                .tensor(&format!("{layer_name}.weight"))
                .map_err(|e| anyhow::anyhow!("{}.weight: {:?}", layer_name, e))?;
            if weight.dtype() != Dtype::I8 {
                anyhow::bail!("{}.weight must be I8, got {:?}", layer_name, weight.dtype());
            }
            let scales = read_f32(&tensors, name)?;
            let bias = read_f32(&tensors, &format!("{layer_name}.bias"))?;
            let channels = weight.shape().first().copied().unwrap_or(0);
            if channels == 0 || scales.len() != channels || bias.len() != channels {
                anyhow::bail!(
                    "{}: weight has {} output channels, but {} scales and {} biases",
                    layer_name,
                    channels,
                    scales.len(),
                    bias.len()
                );
            }

            layers.insert(
                layer_name.to_string(),
                QuantizedLayer {
                    weight: QuantizedTensor {
                        shape: weight.shape().to_vec(),
                        values: bytemuck::cast_slice::<u8, i8>(weight.data()).to_vec(),
                        scales,
                    },
                    bias,
                },
            );
        }

        Ok(Self {
            class_labels,
            image_size,
            hidden_units,
            width_multiplier,
            normalization,
            layers,
        })
    }

    /// 概要を表示
    pub fn print_info(&self) {
        let params: usize = self.layers.values().map(|l| l.weight.values.len() + l.bias.len()).sum();
        println!("\n=== 量子化モデル ===");
        println!("形式: {}", QUANTIZED_FORMAT);
        println!("クラス数: {}", self.class_labels.len());
        for (index, label) in self.class_labels.iter().enumerate() {
            println!("  {:>2}: {}", index, label);
        }
        println!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        println!("正規化: {}", self.normalization);
        println!("層数: {}", self.layers.len());
        println!("パラメータ数: {}", params);
        println!("====================");
    }
}

fn read_f32(tensors: &SafeTensors<'_>, key: &str) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(key)
        .map_err(|e| anyhow::anyhow!("{}: {:?}", key, e))?;
    if view.dtype() != Dtype::F32 {
        anyhow::bail!("{} must be F32, got {:?}", key, view.dtype());
    }
    Ok(bytemuck::pod_collect_to_vec::<u8, f32>(view.data()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::mobilenet::MobileNetV2Config;
    use crate::model::AppConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_model() -> SkinClassifier<TestBackend> {
        ModelConfig::new(3)
            .with_hidden_units(16)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&Default::default())
    }

    fn metadata() -> ModelMetadata {
        let mut config = AppConfig::default();
        config.data.image_size = 32;
        config.model.hidden_units = 16;
        config.model.width_multiplier = 0.35;
        ModelMetadata::new(vec!["a".into(), "b".into(), "c".into()], &config)
    }

    #[test]
    fn test_quantization_error_within_half_step() {
        let values = vec![0.5, -1.0, 0.25, 0.0, 0.001, -0.002, 0.003, 0.0];
        let quantized = QuantizedTensor::quantize(&values, vec![2, 4]);
        assert_eq!(quantized.scales.len(), 2);
        assert!((quantized.scales[0] - 1.0 / 127.0).abs() < 1e-9);

        let restored = quantized.dequantize();
        for (i, (a, b)) in values.iter().zip(&restored).enumerate() {
            let scale = quantized.scales[i / 4];
            assert!((a - b).abs() <= scale / 2.0 + 1e-7, "index {}", i);
        }
    }

    #[test]
    fn test_zero_channel_quantizes_to_zero() {
        let quantized = QuantizedTensor::quantize(&[0.0; 4], vec![1, 4]);
        assert_eq!(quantized.values, vec![0; 4]);
        assert_eq!(quantized.dequantize(), vec![0.0; 4]);
    }

    #[test]
    fn test_folding_preserves_conv_bn_output() {
        let device = Default::default();
        let backbone = MobileNetV2Config::new().with_width_multiplier(0.35).init::<TestBackend>(&device);
        let mut layer = backbone.stem.clone();
        let channels = layer.out_channels();

        let values: Vec<f32> = (0..channels).map(|i| i as f32 / channels as f32).collect();
        layer.norm.gamma = Param::from_tensor(vector(values.iter().map(|v| 0.5 + v).collect(), &device));
        layer.norm.beta = Param::from_tensor(vector(values.iter().map(|v| v - 0.3).collect(), &device));
        layer.norm.running_mean = RunningState::new(vector(values.iter().map(|v| v * 0.2).collect(), &device));
        layer.norm.running_var = RunningState::new(vector(values.iter().map(|v| 1.0 + v).collect(), &device));

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 8, 8],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let expected = tensor_values(layer.forward(input.clone()));

        let folded = fold_conv_bn(&layer);
        let restored = restore_conv_bn(layer, folded.weight, folded.bias, &device).unwrap();
        let actual = tensor_values(restored.forward(input));

        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_artifact_is_plain_safetensors() {
        let model = small_model();
        let artifact = QuantizedArtifact::from_model(&model, &metadata());
        let bytes = artifact.to_bytes().unwrap();

        let tensors = SafeTensors::deserialize(&bytes).unwrap();
        let output = tensors.tensor("head.output.weight").unwrap();
        assert_eq!(output.dtype(), Dtype::I8);
        assert_eq!(output.shape(), &[3, 16]);
        assert_eq!(tensors.tensor("head.output.weight_scale").unwrap().shape(), &[3]);
        assert_eq!(tensors.tensor("backbone.stem.bias").unwrap().dtype(), Dtype::F32);

        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let meta = header.metadata().clone().unwrap();
        assert_eq!(meta["format"], QUANTIZED_FORMAT);
        assert_eq!(meta["class_labels"], r#"["a","b","c"]"#);

        assert_eq!(QuantizedArtifact::from_bytes(&bytes).unwrap(), artifact);
    }

    #[test]
    fn test_dequantized_weights_track_folded_weights() {
        let model = small_model();
        let artifact = QuantizedArtifact::from_model(&model, &metadata());

        let folded = fold_conv_bn(&model.backbone.blocks[2].depthwise);
        let layer = artifact.layer("backbone.blocks.2.depthwise").unwrap();
        let restored = artifact.dequantize("backbone.blocks.2.depthwise").unwrap();
        let per_channel = folded.weight.len() / layer.weight.scales.len();

        for (i, (a, b)) in folded.weight.iter().zip(&restored).enumerate() {
            assert!((a - b).abs() <= layer.weight.scales[i / per_channel] / 2.0 + 1e-6);
        }
    }

    #[test]
    fn test_rebuilt_classifier_runs() {
        let device = Default::default();
        let artifact = QuantizedArtifact::from_model(&small_model(), &metadata());

        let rebuilt = artifact.into_classifier::<TestBackend>(&device).unwrap();
        let logits = rebuilt.forward(Tensor::zeros([2, 3, 32, 32], &device));
        assert_eq!(logits.dims(), [2, 3]);
        assert!(tensor_values(logits).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_channel_count_mismatch_is_rejected() {
        let mut artifact = QuantizedArtifact::from_model(&small_model(), &metadata());
        artifact.layers.get_mut(OUTPUT_LAYER).unwrap().weight.scales = vec![0.01; 5];
        let bytes = artifact.to_bytes().unwrap();

        let err = QuantizedArtifact::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains(OUTPUT_LAYER), "{err}");

        let mut artifact = QuantizedArtifact::from_model(&small_model(), &metadata());
        artifact.layers.get_mut("backbone.stem").unwrap().bias.pop();
        assert!(QuantizedArtifact::from_bytes(&artifact.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn test_missing_metadata_is_rejected() {
        let bytes = safetensors::serialize(Vec::<(String, TensorView<'_>)>::new(), &None).unwrap();
        assert!(QuantizedArtifact::from_bytes(&bytes).is_err());
    }
}
