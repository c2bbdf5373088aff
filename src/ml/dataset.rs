//! クラスごとのディレクトリ構成の画像データセット
//!
//! ```text
//! train/
//!   acne/      img001.jpg ...
//!   eczema/    ...
//! ```
//!
//! クラス名は学習用ディレクトリのサブディレクトリ名を辞書順に並べたもので、
//! その並び順がクラスインデックスになります。検証・テスト用は学習用の並び順を使います。

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::ml::augment::ImagePipeline;

/// 対応する画像拡張子（小文字）
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// データセット読み込みエラー
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset directory not found: {path}")]
    MissingDirectory { path: PathBuf },
    #[error("no class directories found in {path}")]
    NoClasses { path: PathBuf },
    #[error("class '{class}' has no images in {path}")]
    EmptyClass { class: String, path: PathBuf },
    #[error("directory '{class}' in {path} is not one of the training classes")]
    UnknownClass { class: String, path: PathBuf },
    #[error("expected {expected} classes but found {found}: {classes:?}")]
    ClassCountMismatch {
        expected: usize,
        found: usize,
        classes: Vec<String>,
    },
    #[error("no images found in {path}")]
    NoImages { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 拡張子が対応画像形式か（大文字小文字を区別しない）
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn subdirectories(dir: &Path) -> Result<Vec<String>, DatasetError> {
    if !dir.is_dir() {
        return Err(DatasetError::MissingDirectory { path: dir.to_path_buf() });
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_hidden(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// クラス名（サブディレクトリ名）を辞書順で取得
pub fn discover_classes(dir: &Path) -> Result<Vec<String>, DatasetError> {
    let mut classes = subdirectories(dir)?;
    classes.sort();
    Ok(classes)
}

/// ディレクトリ以下の画像ファイルを再帰的に収集
fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DatasetError> {
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        if is_hidden(&entry.file_name().to_string_lossy()) {
            continue;
        }
        // シンボリックリンクのディレクトリはたどらない
        if entry.file_type().map_err(io_error(&path))?.is_dir() {
            collect_images(&path, out)?;
        } else if path.is_file() && is_image_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 画像データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// ディレクトリからクラスを検出して読み込む（学習用）
    ///
    /// 全クラスに1枚以上の画像が必要です。
    pub fn from_directory(data_dir: &Path) -> Result<Self, DatasetError> {
        let classes = discover_classes(data_dir)?;
        if classes.is_empty() {
            return Err(DatasetError::NoClasses { path: data_dir.to_path_buf() });
        }

        let dataset = Self::from_directory_with_classes(data_dir, &classes)?;
        let counts = dataset.class_counts();
        if let Some(index) = counts.iter().position(|&count| count == 0) {
            return Err(DatasetError::EmptyClass {
                class: classes[index].clone(),
                path: data_dir.to_path_buf(),
            });
        }

        Ok(dataset)
    }

    /// 指定されたクラス順序でディレクトリから読み込む（検証・テスト用）
    ///
    /// 存在しないクラスディレクトリは警告のみ。未知のクラスディレクトリはエラーです。
    pub fn from_directory_with_classes(data_dir: &Path, class_order: &[String]) -> Result<Self, DatasetError> {
        for name in subdirectories(data_dir)? {
            if !class_order.contains(&name) {
                return Err(DatasetError::UnknownClass {
                    class: name,
                    path: data_dir.to_path_buf(),
                });
            }
        }

        let mut samples = Vec::new();
        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                eprintln!("警告: クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths = Vec::new();
            collect_images(&class_dir, &mut paths)?;
            paths.sort();
            samples.extend(paths.into_iter().map(|path| (path, class_id)));
        }

        if samples.is_empty() {
            return Err(DatasetError::NoImages { path: data_dir.to_path_buf() });
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとの画像枚数（クラスインデックス順）
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, class_id) in &self.samples {
            counts[*class_id] += 1;
        }
        counts
    }

    /// クラス数が設定値と一致するか確認
    pub fn validate_class_count(&self, expected: usize) -> Result<(), DatasetError> {
        if self.num_classes() != expected {
            return Err(DatasetError::ClassCountMismatch {
                expected,
                found: self.num_classes(),
                classes: self.class_names.clone(),
            });
        }
        Ok(())
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
///
/// データ拡張の乱数はシードから生成し、全バッチで共有します。
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    pipeline: ImagePipeline,
    rng: Arc<Mutex<StdRng>>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, pipeline: ImagePipeline, seed: u64) -> Self {
        Self {
            device,
            pipeline,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.pipeline.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * self.pipeline.tensor_len());
        let mut targets = Vec::with_capacity(batch_size);

        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for item in items {
            match self.pipeline.load(&item.path, &mut *rng) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    eprintln!("警告: 画像読み込み失敗 {}: {:#}", item.path.display(), e);
                    // エラーの場合はゼロで埋める
                    all_pixels.extend(std::iter::repeat(0.0f32).take(self.pipeline.tensor_len()));
                }
            }
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(all_pixels, [batch_size, 3, size, size]),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [batch_size]), &self.device);

        ImageBatch { images, targets }
    }
}
