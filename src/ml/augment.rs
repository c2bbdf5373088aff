//! 画像の前処理とデータ拡張
//!
//! 読み込み -> RGB8 -> リサイズ -> (学習時のみ) ランダムアフィン変換 -> 正規化 -> CHW
//!
//! アフィン変換は (行, 列) 座標系で 回転・平行移動・せん断・ズーム を画像中心まわりに合成し、
//! 出力画素ごとに入力画像の座標を求めて双線形補間でサンプリングします。
//! 画像外は最も近い端の画素で埋めます。

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use rand::Rng;
use std::path::Path;

use crate::model::config::{AppConfig, AugmentationSettings, Normalization};

/// ImageNetの平均（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

type Mat3 = [[f64; 3]; 3];

fn matmul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// 1枚分のランダムアフィン変換
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomAffine {
    /// 回転角（度）
    pub rotation: f64,
    /// 行方向の平行移動（画素）
    pub shift_rows: f64,
    /// 列方向の平行移動（画素）
    pub shift_cols: f64,
    /// せん断角（度）
    pub shear: f64,
    /// 行方向のズーム率
    pub zoom_rows: f64,
    /// 列方向のズーム率
    pub zoom_cols: f64,
    /// 変換後に左右反転するか
    pub flip: bool,
}

impl Default for RandomAffine {
    fn default() -> Self {
        Self::identity()
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f64) -> f64 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

impl RandomAffine {
    /// 何もしない変換
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            shear: 0.0,
            zoom_rows: 1.0,
            zoom_cols: 1.0,
            flip: false,
        }
    }

    /// 設定の範囲から変換をサンプリング
    pub fn sample<R: Rng + ?Sized>(
        settings: &AugmentationSettings,
        width: u32,
        height: u32,
        rng: &mut R,
    ) -> Self {
        let zoom = settings.zoom_range.max(0.0) as f64;
        let (zoom_rows, zoom_cols) = if zoom > 0.0 {
            (rng.gen_range(1.0 - zoom..=1.0 + zoom), rng.gen_range(1.0 - zoom..=1.0 + zoom))
        } else {
            (1.0, 1.0)
        };

        Self {
            rotation: symmetric(rng, settings.rotation_range as f64),
            shift_rows: symmetric(rng, settings.height_shift_range as f64) * height as f64,
            shift_cols: symmetric(rng, settings.width_shift_range as f64) * width as f64,
            shear: symmetric(rng, settings.shear_range as f64),
            zoom_rows,
            zoom_cols,
            flip: settings.horizontal_flip && rng.gen_bool(0.5),
        }
    }

    /// 出力座標 (行, 列, 1) を入力座標へ写す行列
    fn matrix(&self, height: f64, width: f64) -> Mat3 {
        let theta = self.rotation.to_radians();
        let shear = self.shear.to_radians();

        let rotation = [[theta.cos(), -theta.sin(), 0.0], [theta.sin(), theta.cos(), 0.0], [0.0, 0.0, 1.0]];
        let shift = [[1.0, 0.0, self.shift_rows], [0.0, 1.0, self.shift_cols], [0.0, 0.0, 1.0]];
        let shear = [[1.0, -shear.sin(), 0.0], [0.0, shear.cos(), 0.0], [0.0, 0.0, 1.0]];
        let zoom = [[self.zoom_rows, 0.0, 0.0], [0.0, self.zoom_cols, 0.0], [0.0, 0.0, 1.0]];

        let transform = matmul(&matmul(&matmul(&rotation, &shift), &shear), &zoom);

        // 画像中心を原点にする
        let center_rows = height / 2.0 - 0.5;
        let center_cols = width / 2.0 - 0.5;
        let offset = [[1.0, 0.0, center_rows], [0.0, 1.0, center_cols], [0.0, 0.0, 1.0]];
        let reset = [[1.0, 0.0, -center_rows], [0.0, 1.0, -center_cols], [0.0, 0.0, 1.0]];

        matmul(&matmul(&offset, &transform), &reset)
    }

    /// 画像に変換を適用
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return image.clone();
        }

        let m = self.matrix(height as f64, width as f64);
        let mut output = RgbImage::new(width, height);

        for row in 0..height {
            for col in 0..width {
                let (r, c) = (row as f64, col as f64);
                let src_row = m[0][0] * r + m[0][1] * c + m[0][2];
                let src_col = m[1][0] * r + m[1][1] * c + m[1][2];

                let out_col = if self.flip { width - 1 - col } else { col };
                output.put_pixel(out_col, row, sample_bilinear(image, src_row, src_col));
            }
        }

        output
    }
}

/// 双線形補間（範囲外は端の画素）
fn sample_bilinear(image: &RgbImage, row: f64, col: f64) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let row = row.clamp(0.0, (height - 1) as f64);
    let col = col.clamp(0.0, (width - 1) as f64);

    let r0 = row.floor() as u32;
    let c0 = col.floor() as u32;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = row - r0 as f64;
    let fc = col - c0 as f64;

    let p00 = image.get_pixel(c0, r0);
    let p01 = image.get_pixel(c1, r0);
    let p10 = image.get_pixel(c0, r1);
    let p11 = image.get_pixel(c1, r1);

    let mut out = [0u8; 3];
    for ch in 0..3 {
        let value = p00[ch] as f64 * (1.0 - fr) * (1.0 - fc)
            + p01[ch] as f64 * (1.0 - fr) * fc
            + p10[ch] as f64 * fr * (1.0 - fc)
            + p11[ch] as f64 * fr * fc;
        out[ch] = value.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// 画素値を正規化
pub fn normalize_value(normalization: Normalization, channel: usize, value: u8) -> f32 {
    let scaled = value as f32 / 255.0;
    match normalization {
        Normalization::Rescale => scaled,
        Normalization::ImageNet => (scaled - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
    }
}

/// RGB画像を正規化して (C, H, W) の順で平坦化
pub fn to_chw(image: &RgbImage, normalization: Normalization) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = image.get_pixel(x, y);
                data.push(normalize_value(normalization, channel, pixel[channel]));
            }
        }
    }

    data
}

/// 画像の前処理パイプライン
#[derive(Debug, Clone)]
pub struct ImagePipeline {
    /// モデル入力解像度（正方形）
    pub image_size: usize,
    pub normalization: Normalization,
    /// 学習時のみ設定
    pub augmentation: Option<AugmentationSettings>,
}

impl ImagePipeline {
    /// データ拡張なしのパイプライン
    pub fn new(image_size: usize, normalization: Normalization) -> Self {
        Self {
            image_size,
            normalization,
            augmentation: None,
        }
    }

    pub fn with_augmentation(mut self, settings: AugmentationSettings) -> Self {
        self.augmentation = Some(settings);
        self
    }

    /// 学習用パイプライン（設定で有効な場合のみデータ拡張）
    pub fn training(config: &AppConfig) -> Self {
        let pipeline = Self::evaluation(config);
        if config.augmentation.enabled {
            pipeline.with_augmentation(config.augmentation.clone())
        } else {
            pipeline
        }
    }

    /// 検証・テスト・推論用パイプライン
    pub fn evaluation(config: &AppConfig) -> Self {
        Self::new(config.data.image_size, config.data.normalization)
    }

    /// 1枚分のテンソル要素数
    pub fn tensor_len(&self) -> usize {
        3 * self.image_size * self.image_size
    }

    /// デコード済み画像を処理
    pub fn process<R: Rng + ?Sized>(&self, image: DynamicImage, rng: &mut R) -> Vec<f32> {
        let size = self.image_size as u32;
        let rgb = image.to_rgb8();
        let resized = if rgb.dimensions() == (size, size) {
            rgb
        } else {
            image::imageops::resize(&rgb, size, size, FilterType::Nearest)
        };

        let augmented = match &self.augmentation {
            Some(settings) => RandomAffine::sample(settings, size, size, rng).apply(&resized),
            None => resized,
        };

        to_chw(&augmented, self.normalization)
    }

    /// 画像ファイルを読み込んで処理
    pub fn load<R: Rng + ?Sized>(&self, path: &Path, rng: &mut R) -> Result<Vec<f32>> {
        let image = image::open(path).context(format!("Failed to decode image: {:?}", path))?;
        Ok(self.process(image, rng))
    }
}
