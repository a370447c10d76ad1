//! Detection dataset with optional rectangular batching and an image cache,
//! plus the parallel batch loader that assembles Burn tensors.

use crate::index::{index_images, label_path_for};
use crate::transform::{augment_hsv, flip_horizontal, letterbox, load_resized};
use crate::types::{BurnDatasetError, DatasetResult, Sample};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use data_contracts::labels::ImageLabels;
use image::RgbImage;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One target row: `[image_index, class, cx, cy, w, h, depth]`, box normalized to the batch image.
pub type TargetRow = [f32; 7];

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Longest side after the initial resize; square training shape when `rect` is off.
    pub img_size: u32,
    pub batch_size: usize,
    /// Batch shapes are rounded up to multiples of this.
    pub stride: u32,
    /// Enable photometric/flip augmentation and allow letterbox upscaling.
    pub augment: bool,
    /// Group images of similar aspect ratio and shape each batch to them.
    pub rect: bool,
    /// Keep resized images in memory after the first load.
    pub cache_images: bool,
    /// Collapse every class to 0.
    pub single_cls: bool,
    /// Extra stride fraction added to rectangular batch shapes.
    pub pad: f32,
    pub hsv_gains: [f32; 3],
    pub flip_prob: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            img_size: 416,
            batch_size: 16,
            stride: 32,
            augment: false,
            rect: false,
            cache_images: false,
            single_cls: false,
            pad: 0.0,
            hsv_gains: [0.0; 3],
            flip_prob: 0.5,
        }
    }
}

pub struct DetectionDataset {
    cfg: LoaderConfig,
    image_files: Vec<PathBuf>,
    labels: Vec<ImageLabels>,
    /// Native (width, height) per image.
    shapes: Vec<(u32, u32)>,
    /// Per-batch (width, height) when `rect` is set.
    batch_shapes: Vec<(u32, u32)>,
    cache: Option<Vec<RgbImage>>,
    /// Sampling order; resampled when image weights are in use.
    pub indices: Vec<usize>,
}

fn read_labels(image: &Path, single_cls: bool) -> DatasetResult<Option<ImageLabels>> {
    let path = label_path_for(image);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).map_err(|source| BurnDatasetError::Io {
        path: path.clone(),
        source,
    })?;
    let labels =
        ImageLabels::parse(&text).map_err(|source| BurnDatasetError::Label { path, source })?;
    Ok(Some(if single_cls {
        labels.into_single_class()
    } else {
        labels
    }))
}

impl DetectionDataset {
    pub fn open(source: &Path, cfg: LoaderConfig) -> DatasetResult<Self> {
        let mut image_files = index_images(source)?;
        let loaded: Vec<DatasetResult<(Option<ImageLabels>, (u32, u32))>> = image_files
            .par_iter()
            .map(|path| {
                let labels = read_labels(path, cfg.single_cls)?;
                let dims = image::image_dimensions(path).map_err(|source| {
                    BurnDatasetError::Image {
                        path: path.clone(),
                        source,
                    }
                })?;
                Ok((labels, dims))
            })
            .collect();

        let (mut found, mut missing, mut empty) = (0usize, 0usize, 0usize);
        let mut labels = Vec::with_capacity(loaded.len());
        let mut shapes = Vec::with_capacity(loaded.len());
        for res in loaded {
            let (lbl, dims) = res?;
            match lbl {
                Some(l) if l.objects.is_empty() => {
                    empty += 1;
                    labels.push(l);
                }
                Some(l) => {
                    found += 1;
                    labels.push(l);
                }
                None => {
                    missing += 1;
                    labels.push(ImageLabels::default());
                }
            }
            shapes.push(dims);
        }
        info!(
            "{}: {} images, {found} labelled, {missing} missing, {empty} empty",
            source.display(),
            image_files.len()
        );
        if found == 0 {
            warn!("no labels found under {}", source.display());
        }

        let mut batch_shapes = Vec::new();
        if cfg.rect {
            let ar: Vec<f32> = shapes.iter().map(|(w, h)| *h as f32 / *w as f32).collect();
            let mut order: Vec<usize> = (0..ar.len()).collect();
            order.sort_by(|a, b| ar[*a].total_cmp(&ar[*b]));
            image_files = order.iter().map(|i| image_files[*i].clone()).collect();
            labels = order.iter().map(|i| labels[*i].clone()).collect();
            shapes = order.iter().map(|i| shapes[*i]).collect();
            let sorted_ar: Vec<f32> = order.iter().map(|i| ar[*i]).collect();
            batch_shapes = rect_batch_shapes(&sorted_ar, &cfg);
        }

        let n = image_files.len();
        let mut dataset = Self {
            cfg,
            image_files,
            labels,
            shapes,
            batch_shapes,
            cache: None,
            indices: (0..n).collect(),
        };
        if dataset.cfg.cache_images {
            dataset.cache_images()?;
        }
        Ok(dataset)
    }

    fn cache_images(&mut self) -> DatasetResult<()> {
        let size = self.cfg.img_size;
        let cached: DatasetResult<Vec<RgbImage>> = self
            .image_files
            .par_iter()
            .map(|p| load_resized(p, size).map(|(img, _)| img))
            .collect();
        let cached = cached?;
        let bytes: usize = cached.iter().map(|img| img.as_raw().len()).sum();
        info!("cached {} images ({:.2}GB)", cached.len(), bytes as f64 / 1e9);
        self.cache = Some(cached);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.image_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_files.is_empty()
    }

    pub fn labels(&self) -> &[ImageLabels] {
        &self.labels
    }

    pub fn image_files(&self) -> &[PathBuf] {
        &self.image_files
    }

    pub fn native_shapes(&self) -> &[(u32, u32)] {
        &self.shapes
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    /// Rejects labels whose class falls outside `0..num_classes`.
    pub fn check_classes(&self, num_classes: usize) -> DatasetResult<()> {
        for (path, labels) in self.image_files.iter().zip(&self.labels) {
            labels
                .check_classes(num_classes)
                .map_err(|e| BurnDatasetError::Validation {
                    path: label_path_for(path),
                    msg: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Target (width, height) for batch `batch_no`.
    pub fn batch_shape(&self, batch_no: usize) -> (u32, u32) {
        match self.batch_shapes.get(batch_no) {
            Some(shape) if self.cfg.rect => *shape,
            _ => (self.cfg.img_size, self.cfg.img_size),
        }
    }

    pub fn load_sample(
        &self,
        index: usize,
        shape: (u32, u32),
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<Sample> {
        let path = self
            .image_files
            .get(index)
            .ok_or_else(|| BurnDatasetError::Other(format!("sample index {index} out of range")))?;
        let resized;
        let img = match &self.cache {
            Some(cache) => &cache[index],
            None => {
                resized = load_resized(path, self.cfg.img_size)?.0;
                &resized
            }
        };
        let src = img.dimensions();
        let lb = letterbox(img, shape, self.cfg.augment);
        let labels = &self.labels[index];
        let mut objects = lb.map_objects(&labels.objects, src);
        let mut roi = lb.map_roi(labels.roi, src);
        let mut image = lb.image;
        if self.cfg.augment {
            augment_hsv(&mut image, self.cfg.hsv_gains, rng);
            if rng.random_range(0.0f32..1.0) < self.cfg.flip_prob {
                flip_horizontal(&mut image, &mut objects, &mut roi);
            }
        }
        Ok(Sample {
            path: path.clone(),
            image,
            objects,
            roi,
        })
    }
}

fn rect_batch_shapes(sorted_ar: &[f32], cfg: &LoaderConfig) -> Vec<(u32, u32)> {
    let bs = cfg.batch_size.max(1);
    let stride = cfg.stride as f32;
    sorted_ar
        .chunks(bs)
        .map(|ari| {
            let mini = ari.iter().copied().fold(f32::INFINITY, f32::min);
            let maxi = ari.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let (sh, sw) = if maxi < 1.0 {
                (maxi, 1.0)
            } else if mini > 1.0 {
                (1.0, 1.0 / mini)
            } else {
                (1.0, 1.0)
            };
            let round = |s: f32| ((s * cfg.img_size as f32 / stride + cfg.pad).ceil() * stride) as u32;
            (round(sw), round(sh))
        })
        .collect()
}

/// Collated batch. Images stay in 0..255; the trainer normalizes.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Vec<TargetRow>,
    /// `[batch, 4]` normalized x0, y0, x1, y1.
    pub rois: Tensor<B, 2>,
    pub paths: Vec<PathBuf>,
}

pub fn collate<B: Backend>(samples: Vec<Sample>, device: &B::Device) -> DatasetResult<Batch<B>> {
    let Some(first) = samples.first() else {
        return Err(BurnDatasetError::Other("cannot collate empty batch".into()));
    };
    let (width, height) = first.image.dimensions();
    let bs = samples.len();
    let plane = (width * height) as usize;
    let mut image_buf = vec![0.0f32; bs * 3 * plane];
    let mut roi_buf = Vec::with_capacity(bs * 4);
    let mut targets = Vec::new();
    let mut paths = Vec::with_capacity(bs);
    for (b, sample) in samples.into_iter().enumerate() {
        if sample.image.dimensions() != (width, height) {
            return Err(BurnDatasetError::Other(format!(
                "image dimensions differ within batch: {} is {:?}, expected {:?}",
                sample.path.display(),
                sample.image.dimensions(),
                (width, height)
            )));
        }
        let base = b * 3 * plane;
        for (i, px) in sample.image.pixels().enumerate() {
            for c in 0..3 {
                image_buf[base + c * plane + i] = px[c] as f32;
            }
        }
        roi_buf.extend_from_slice(&sample.roi);
        for o in &sample.objects {
            targets.push([
                b as f32,
                o.class_id as f32,
                o.bbox[0],
                o.bbox[1],
                o.bbox[2],
                o.bbox[3],
                o.depth,
            ]);
        }
        paths.push(sample.path);
    }
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(image_buf, [bs, 3, height as usize, width as usize]),
        device,
    );
    let rois = Tensor::<B, 2>::from_data(TensorData::new(roi_buf, [bs, 4]), device);
    Ok(Batch {
        images,
        targets,
        rois,
        paths,
    })
}

/// Batches a dataset with a bounded rayon pool. `workers == 0` loads on the calling thread.
pub struct DataLoader {
    dataset: DetectionDataset,
    batch_size: usize,
    shuffle: bool,
    workers: usize,
    pool: Option<rayon::ThreadPool>,
}

impl DataLoader {
    pub fn new(
        dataset: DetectionDataset,
        batch_size: usize,
        workers: usize,
        shuffle: bool,
    ) -> DatasetResult<Self> {
        let pool = if workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .build()
                    .map_err(|e| BurnDatasetError::Other(format!("loader pool: {e}")))?,
            )
        } else {
            None
        };
        Ok(Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            workers,
            pool,
        })
    }

    /// Default worker count: `min(cpus, batch_size if > 1 else 0, 8)`.
    pub fn default_workers(batch_size: usize) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let bs = if batch_size > 1 { batch_size } else { 0 };
        cpus.min(bs).min(8)
    }

    pub fn dataset(&self) -> &DetectionDataset {
        &self.dataset
    }

    pub fn dataset_mut(&mut self) -> &mut DetectionDataset {
        &mut self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn epoch(&self, seed: u64) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.dataset.indices.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
        }
        BatchIter {
            loader: self,
            order,
            cursor: 0,
            batch_no: 0,
            seed,
        }
    }
}

pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
    batch_no: usize,
    seed: u64,
}

impl BatchIter<'_> {
    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> DatasetResult<Option<Batch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let dataset = &self.loader.dataset;
        let positions = &self.order[self.cursor..end];
        let shape = dataset.batch_shape(self.batch_no);
        let seed = self.seed;
        let load = |pos: &usize| {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(*pos as u64));
            dataset.load_sample(dataset.indices[*pos], shape, &mut rng)
        };
        let samples: DatasetResult<Vec<Sample>> = match &self.loader.pool {
            Some(pool) => pool.install(|| positions.par_iter().map(load).collect()),
            None => positions.iter().map(load).collect(),
        };
        self.cursor = end;
        self.batch_no += 1;
        collate(samples?, device).map(Some)
    }
}
