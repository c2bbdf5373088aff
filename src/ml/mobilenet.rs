//! MobileNetV2 特徴抽出器
//!
//! ImageNetで事前学習された重みを読み込み、分類ヘッドの前段として使います。
//! 層構成は torchvision の `mobilenet_v2` と同じで、重みファイルのキーもそのまま対応します。
//!
//! # アーキテクチャ
//! - Stem: Conv 3x3 stride 2 + BN + ReLU6
//! - 反転残差ブロック x 17（構成は [`INVERTED_RESIDUAL_SETTINGS`]）
//! - Head: Conv 1x1 -> 1280 + BN + ReLU6
//!
//! 出力は `[batch, 1280, H/32, W/32]` の特徴マップです。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::{Module, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor, TensorData},
};
use safetensors::{tensor::Dtype, SafeTensors};
use std::path::Path;

/// 反転残差ブロックの構成表
///
/// (t: 拡張率, c: 出力チャネル, n: 繰り返し回数, s: 最初のブロックのストライド)
pub const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// チャネル数を `divisor` の倍数に丸める（元の値の90%を下回らない）
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let mut rounded = (((value + divisor_f / 2.0) / divisor_f).floor() * divisor_f).max(divisor_f);
    if rounded < 0.9 * value {
        rounded += divisor_f;
    }
    rounded as usize
}

/// 反転残差ブロック1個分の形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub expand_ratio: usize,
}

impl BlockSpec {
    pub fn hidden_channels(&self) -> usize {
        self.in_channels * self.expand_ratio
    }
}

/// 特徴抽出器の設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// 幅係数（1.0 が ImageNet 事前学習済み重みの構成）
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl MobileNetV2Config {
    pub fn stem_channels(&self) -> usize {
        make_divisible(32.0 * self.width_multiplier, 8)
    }

    /// 出力特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        make_divisible(1280.0 * self.width_multiplier.max(1.0), 8)
    }

    /// 全反転残差ブロックの形状を順番に列挙
    pub fn block_specs(&self) -> Vec<BlockSpec> {
        let mut specs = Vec::new();
        let mut in_channels = self.stem_channels();
        for &(expand_ratio, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS.iter() {
            let out_channels = make_divisible(channels as f64 * self.width_multiplier, 8);
            for i in 0..repeats {
                specs.push(BlockSpec {
                    in_channels,
                    out_channels,
                    stride: if i == 0 { stride } else { 1 },
                    expand_ratio,
                });
                in_channels = out_channels;
            }
        }
        specs
    }

    /// モデルを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let stem_channels = self.stem_channels();
        let specs = self.block_specs();
        let last_block_channels = specs.last().map(|s| s.out_channels).unwrap_or(stem_channels);

        MobileNetV2 {
            stem: ConvBn::new([3, stem_channels], 3, 2, 1, true, device),
            blocks: specs.iter().map(|spec| InvertedResidual::new(spec, device)).collect(),
            head: ConvBn::new([last_block_channels, self.out_channels()], 1, 1, 1, true, device),
        }
    }
}

/// Conv + BatchNorm (+ ReLU6)
///
/// 畳み込みはバイアスなし。量子化時にはバッチ正規化を畳み込みへ畳み込みます。
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B>,
    pub activation: bool,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        activation: bool,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel - 1) / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(channels[1]).init(device),
            activation,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        if self.activation {
            x.clamp(0.0, 6.0)
        } else {
            x
        }
    }

    /// 出力チャネル数
    pub fn out_channels(&self) -> usize {
        self.conv.weight.val().dims()[0]
    }

    fn load_torchvision(
        mut self,
        tensors: &SafeTensors<'_>,
        conv_key: &str,
        norm_key: &str,
        device: &B::Device,
    ) -> Result<Self> {
        let weight_dims = self.conv.weight.val().dims();
        let weight = read_f32(tensors, &format!("{conv_key}.weight"), &weight_dims)?;
        self.conv.weight = Param::from_tensor(Tensor::from_data(TensorData::new(weight, weight_dims), device));

        let channels = [weight_dims[0]];
        let gamma = read_f32(tensors, &format!("{norm_key}.weight"), &channels)?;
        let beta = read_f32(tensors, &format!("{norm_key}.bias"), &channels)?;
        let mean = read_f32(tensors, &format!("{norm_key}.running_mean"), &channels)?;
        let var = read_f32(tensors, &format!("{norm_key}.running_var"), &channels)?;

        self.norm.gamma = Param::from_tensor(vector(gamma, device));
        self.norm.beta = Param::from_tensor(vector(beta, device));
        self.norm.running_mean = RunningState::new(vector(mean, device));
        self.norm.running_var = RunningState::new(vector(var, device));
        Ok(self)
    }
}

/// 1次元テンソルを作成
pub(crate) fn vector<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 1> {
    let len = values.len();
    Tensor::from_data(TensorData::new(values, [len]), device)
}

/// 反転残差ブロック（expand 1x1 -> depthwise 3x3 -> project 1x1）
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub project: ConvBn<B>,
    pub use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(spec: &BlockSpec, device: &B::Device) -> Self {
        let hidden = spec.hidden_channels();
        let expand = (spec.expand_ratio != 1)
            .then(|| ConvBn::new([spec.in_channels, hidden], 1, 1, 1, true, device));

        Self {
            expand,
            depthwise: ConvBn::new([hidden, hidden], 3, spec.stride, hidden, true, device),
            project: ConvBn::new([hidden, spec.out_channels], 1, 1, 1, false, device),
            use_residual: spec.stride == 1 && spec.in_channels == spec.out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

/// 層の識別子
///
/// 量子化モデルのテンソル名と、torchvision 重みファイルのキーの両方を導きます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerName {
    Stem,
    Expand { block: usize },
    Depthwise { block: usize, expanded: bool },
    Project { block: usize, expanded: bool },
    Head { block_count: usize },
}

impl LayerName {
    /// モジュール内のパス（例: `blocks.3.depthwise`）
    pub fn path(&self) -> String {
        match *self {
            LayerName::Stem => "stem".to_string(),
            LayerName::Expand { block } => format!("blocks.{block}.expand"),
            LayerName::Depthwise { block, .. } => format!("blocks.{block}.depthwise"),
            LayerName::Project { block, .. } => format!("blocks.{block}.project"),
            LayerName::Head { .. } => "head".to_string(),
        }
    }

    /// torchvision の state_dict における (畳み込み, バッチ正規化) のキー接頭辞
    pub fn torchvision_keys(&self) -> (String, String) {
        match *self {
            LayerName::Stem => ("features.0.0".to_string(), "features.0.1".to_string()),
            LayerName::Expand { block } => {
                let f = block + 1;
                (format!("features.{f}.conv.0.0"), format!("features.{f}.conv.0.1"))
            }
            LayerName::Depthwise { block, expanded } => {
                let f = block + 1;
                let i = if expanded { 1 } else { 0 };
                (format!("features.{f}.conv.{i}.0"), format!("features.{f}.conv.{i}.1"))
            }
            LayerName::Project { block, expanded } => {
                let f = block + 1;
                let i = if expanded { 2 } else { 1 };
                (format!("features.{f}.conv.{i}"), format!("features.{f}.conv.{}", i + 1))
            }
            LayerName::Head { block_count } => {
                let f = block_count + 1;
                (format!("features.{f}.0"), format!("features.{f}.1"))
            }
        }
    }
}

/// MobileNetV2 特徴抽出器
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub head: ConvBn<B>,
}

impl<B: Backend> MobileNetV2<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, height, width]
    ///
    /// # 戻り値
    /// - 特徴マップ [batch_size, out_channels, height / 32, width / 32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.head.forward(x)
    }

    /// 出力特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        self.head.out_channels()
    }

    /// 全 Conv+BN 層を順番に列挙
    pub fn layers(&self) -> Vec<(LayerName, &ConvBn<B>)> {
        let mut layers = vec![(LayerName::Stem, &self.stem)];
        for (block, residual) in self.blocks.iter().enumerate() {
            let expanded = residual.expand.is_some();
            if let Some(expand) = &residual.expand {
                layers.push((LayerName::Expand { block }, expand));
            }
            layers.push((LayerName::Depthwise { block, expanded }, &residual.depthwise));
            layers.push((LayerName::Project { block, expanded }, &residual.project));
        }
        layers.push((LayerName::Head { block_count: self.blocks.len() }, &self.head));
        layers
    }

    /// 全 Conv+BN 層を [`layers`](Self::layers) と同じ順番で置き換える
    pub fn try_map_layers<F>(self, mut f: F) -> Result<Self>
    where
        F: FnMut(LayerName, ConvBn<B>) -> Result<ConvBn<B>>,
    {
        let block_count = self.blocks.len();
        let stem = f(LayerName::Stem, self.stem)?;

        let mut blocks = Vec::with_capacity(block_count);
        for (block, residual) in self.blocks.into_iter().enumerate() {
            let expanded = residual.expand.is_some();
            let expand = match residual.expand {
                Some(layer) => Some(f(LayerName::Expand { block }, layer)?),
                None => None,
            };
            let depthwise = f(LayerName::Depthwise { block, expanded }, residual.depthwise)?;
            let project = f(LayerName::Project { block, expanded }, residual.project)?;
            blocks.push(InvertedResidual {
                expand,
                depthwise,
                project,
                use_residual: residual.use_residual,
            });
        }

        let head = f(LayerName::Head { block_count }, self.head)?;
        Ok(Self { stem, blocks, head })
    }

    /// 事前学習済み重みを読み込む
    ///
    /// - `.safetensors`: torchvision のキー構成（`features.N...`）
    /// - それ以外: Burn のフル精度バイナリレコード
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => self.load_torchvision_safetensors(path, device),
            _ => self
                .load_file(path.to_path_buf(), &BinFileRecorder::<FullPrecisionSettings>::new(), device)
                .map_err(|e| anyhow::anyhow!("事前学習済み重みの読み込みエラー {:?}: {:?}", path, e)),
        }
    }

    fn load_torchvision_safetensors(self, path: &Path, device: &B::Device) -> Result<Self> {
        let bytes = std::fs::read(path).context(format!("Failed to read weights file: {:?}", path))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| anyhow::anyhow!("Failed to parse safetensors file {:?}: {:?}", path, e))?;

        let mut loaded = 0usize;
        let model = self.try_map_layers(|name, layer| {
            let (conv_key, norm_key) = name.torchvision_keys();
            let layer = layer
                .load_torchvision(&tensors, &conv_key, &norm_key, device)
                .with_context(|| format!("layer {}", name.path()))?;
            loaded += 1;
            Ok(layer)
        })?;

        println!("[Model] 事前学習済み重みを読み込みました: {} 層 ({})", loaded, path.display());
        Ok(model)
    }
}

fn read_f32(tensors: &SafeTensors<'_>, key: &str, expected_shape: &[usize]) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(key)
        .map_err(|_| anyhow::anyhow!("tensor `{}` not found in weights file", key))?;

    if view.shape() != expected_shape {
        anyhow::bail!(
            "shape mismatch for `{}`: file {:?}, model {:?}",
            key,
            view.shape(),
            expected_shape
        );
    }

    let values = match view.dtype() {
        Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(view.data()),
        Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, u16>(view.data())
            .into_iter()
            .map(|bits| half::f16::from_bits(bits).to_f32())
            .collect(),
        Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, u16>(view.data())
            .into_iter()
            .map(|bits| half::bf16::from_bits(bits).to_f32())
            .collect(),
        other => anyhow::bail!("unsupported dtype {:?} for `{}`", other, key),
    };
    Ok(values)
}
