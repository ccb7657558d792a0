use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::ImageReader;
use rand::{SeedableRng, rngs::StdRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::model::constants::{CHANNELS, HEIGHT, RESIZE, WIDTH};
use crate::utils::{
    center_crop, random_crop, random_horizontal_flip, resize_shorter_edge, rgb_to_normalized_chw,
};

const ITEM_LEN: usize = CHANNELS * HEIGHT * WIDTH;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a readable image", .path.display())]
    NotAnImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to decode {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Eval,
}

/// Keeps the first `train_size` entries for training and the rest for evaluation.
pub fn partition<T>(mut items: Vec<T>, split: Split, train_size: usize) -> Vec<T> {
    let at = train_size.min(items.len());
    let rest = items.split_off(at);
    match split {
        Split::Train => items,
        Split::Eval => rest,
    }
}

/// One loaded sample. A decode failure travels with the item so the training
/// loop can stop on it instead of the loader silently ending its pass.
#[derive(Debug, Clone)]
pub struct FaceItem {
    pub path: PathBuf,
    pub image: Result<Vec<f32>, String>,
}

pub struct CelebaDataset {
    pub image_paths: Vec<PathBuf>,
    pub split: Split,
    seed: u64,
    epoch: Arc<AtomicU64>,
}

impl CelebaDataset {
    /// Lists every file of `path` in lexicographic order and keeps this split's share.
    /// Each kept file must carry a decodable image header.
    pub fn new<P: AsRef<Path>>(path: P, split: Split, train_size: usize) -> Result<Self, DataError> {
        let path = path.as_ref();
        let io_err = |source: std::io::Error| DataError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut all_paths = Vec::new();
        for entry in std::fs::read_dir(path).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if path.is_file() {
                all_paths.push(path);
            }
        }
        all_paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let image_paths = partition(all_paths, split, train_size);
        for path in &image_paths {
            check_image_header(path)?;
        }
        tracing::debug!(
            "{:?} split of {} holds {} images",
            split,
            path.display(),
            image_paths.len()
        );

        Ok(Self {
            image_paths,
            split,
            seed: 0,
            epoch: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn train<P: AsRef<Path>>(path: P, train_size: usize) -> Result<Self, DataError> {
        Self::new(path, Split::Train, train_size)
    }

    pub fn eval<P: AsRef<Path>>(path: P, train_size: usize) -> Result<Self, DataError> {
        Self::new(path, Split::Eval, train_size)
    }

    /// Seed that, with the epoch and the item index, fixes every random crop and flip.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Shared handle the training loop bumps at the start of every epoch.
    pub fn epoch_counter(&self) -> Arc<AtomicU64> {
        self.epoch.clone()
    }

    fn load(&self, path: &Path, index: usize) -> Result<Vec<f32>, image::ImageError> {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        let resized = resize_shorter_edge(&image, RESIZE);
        let cropped = match self.split {
            Split::Train => {
                let epoch = self.epoch.load(Ordering::SeqCst);
                let mut rng = augmentation_rng(self.seed, epoch, index);
                let cropped = random_crop(&resized, WIDTH as u32, HEIGHT as u32, &mut rng);
                random_horizontal_flip(cropped, 0.5, &mut rng)
            }
            Split::Eval => center_crop(&resized, WIDTH as u32, HEIGHT as u32),
        };
        Ok(rgb_to_normalized_chw(&cropped))
    }
}

/// Independent stream per (seed, epoch, index), so worker scheduling never
/// changes which crop an image gets.
fn augmentation_rng(seed: u64, epoch: u64, index: usize) -> StdRng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8..16].copy_from_slice(&epoch.to_le_bytes());
    key[16..24].copy_from_slice(&(index as u64).to_le_bytes());
    StdRng::from_seed(key)
}

fn check_image_header(path: &Path) -> Result<(), DataError> {
    let reader = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    reader
        .into_dimensions()
        .map(|_| ())
        .map_err(|source| DataError::NotAnImage {
            path: path.to_path_buf(),
            source,
        })
}

impl Dataset<FaceItem> for CelebaDataset {
    fn len(&self) -> usize {
        self.image_paths.len()
    }

    fn get(&self, index: usize) -> Option<FaceItem> {
        let path = self.image_paths.get(index)?;
        let image = self.load(path, index).map_err(|err| {
            tracing::error!("failed to load {}: {}", path.display(), err);
            err.to_string()
        });
        Some(FaceItem {
            path: path.clone(),
            image,
        })
    }
}

#[derive(Clone, Default)]
pub struct FaceBatcher {}

#[derive(Clone, Debug)]
pub struct FaceBatch<B: Backend> {
    /// `[n, CHANNELS, HEIGHT, WIDTH]`; rows of failed items are zero.
    pub images: Tensor<B, 4>,
    pub failures: Vec<(PathBuf, String)>,
}

impl<B: Backend> FaceBatch<B> {
    /// The image tensor, or the first item that could not be decoded.
    pub fn into_images(self) -> Result<Tensor<B, 4>, DataError> {
        match self.failures.into_iter().next() {
            Some((path, reason)) => Err(DataError::Corrupt { path, reason }),
            None => Ok(self.images),
        }
    }
}

impl<B: Backend> Batcher<B, FaceItem, FaceBatch<B>> for FaceBatcher {
    fn batch(&self, items: Vec<FaceItem>, device: &B::Device) -> FaceBatch<B> {
        let batch_size = items.len();
        let mut values = Vec::with_capacity(batch_size * ITEM_LEN);
        let mut failures = Vec::new();
        for item in items {
            match item.image {
                Ok(image) => values.extend(image),
                Err(reason) => {
                    values.resize(values.len() + ITEM_LEN, 0.0);
                    failures.push((item.path, reason));
                }
            }
        }

        let data = TensorData::new(values, [batch_size, CHANNELS, HEIGHT, WIDTH]);
        FaceBatch {
            images: Tensor::from_data(data.convert::<B::FloatElem>(), device),
            failures,
        }
    }
}
