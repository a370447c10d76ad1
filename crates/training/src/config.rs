//! Run configuration and the values derived from it once at startup.

use crate::error::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Architecture descriptor (TOML).
    pub cfg: PathBuf,
    /// Dataset descriptor (`key=value`).
    pub data: PathBuf,
    /// `[min, max, test]`; shorter lists repeat their last entry.
    pub img_size: Vec<u32>,
    /// Empty, a native `.pt` checkpoint, or a foreign Darknet weights file.
    pub weights: String,
    /// `cpu`, or a comma-separated list of device ordinals.
    pub device: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub multi_scale: bool,
    pub rect: bool,
    pub cache_images: bool,
    pub adam: bool,
    pub single_cls: bool,
    pub freeze_layers: bool,
    pub image_weights: bool,
    /// Only evaluate after the final epoch.
    pub notest: bool,
    pub conf_thres: f32,
    pub iou_thres: f32,
    /// Suffix applied to artifacts when the run completes.
    pub name: String,
    /// Root for `weights/`, `results.txt`, batch previews and scalar logs.
    pub out_dir: PathBuf,
    pub grid: u32,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            cfg: PathBuf::from("cfg/roidepth_0_0_2.toml"),
            data: PathBuf::from("data/roidepth-kitti.data"),
            img_size: vec![128, 128],
            weights: "weights/roi_net_1_0_0_pre_1000000.weights".into(),
            device: "0".into(),
            epochs: 5,
            batch_size: 64,
            multi_scale: false,
            rect: false,
            cache_images: false,
            adam: true,
            single_cls: false,
            freeze_layers: false,
            image_weights: false,
            notest: false,
            conf_thres: 0.001,
            iou_thres: 0.35,
            name: String::new(),
            out_dir: PathBuf::from("."),
            grid: 32,
            seed: 0,
        }
    }
}

/// Where initial weights come from, resolved once from the weights string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSource {
    NoWeights,
    ForeignWeights(PathBuf),
    NativeCheckpoint(PathBuf),
}

impl WeightsSource {
    pub fn resolve(weights: &str) -> Self {
        let trimmed = weights.trim();
        if trimmed.is_empty() {
            WeightsSource::NoWeights
        } else if trimmed.ends_with(".pt") {
            WeightsSource::NativeCheckpoint(PathBuf::from(trimmed))
        } else {
            WeightsSource::ForeignWeights(PathBuf::from(trimmed))
        }
    }
}

/// Image sizes after normalization. `grid_min..=grid_max` is the multi-scale range in grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSizes {
    pub min: u32,
    pub max: u32,
    pub test: u32,
    pub grid_min: u32,
    pub grid_max: u32,
    pub multi_scale: bool,
}

impl ImageSizes {
    /// Training resolution before any multi-scale draw.
    pub fn train(&self) -> u32 {
        self.max
    }
}

/// Extends the size list to three entries, checks grid alignment and derives
/// the multi-scale range. When multi-scale is on with `min == max` the range
/// becomes `[min / 1.5, max / 0.667]` (floored).
pub fn normalize_image_sizes(
    img_size: &[u32],
    grid: u32,
    multi_scale: bool,
) -> TrainResult<ImageSizes> {
    let grid = grid.max(1);
    let mut sizes: Vec<u32> = img_size.iter().copied().take(3).collect();
    let Some(&last) = sizes.last() else {
        return Err(TrainError::Other("img_size must list at least one size".into()));
    };
    while sizes.len() < 3 {
        sizes.push(last);
    }
    let (mut min, mut max, test) = (sizes[0], sizes[1], sizes[2]);
    let smallest = min.min(max).min(test);
    if smallest == 0 || smallest % grid != 0 {
        return Err(TrainError::GridAlignment {
            size: smallest,
            grid,
        });
    }
    let multi_scale = multi_scale || min != max;
    if multi_scale && min == max {
        min = (min as f64 / 1.5).floor() as u32;
        max = (max as f64 / 0.667).floor() as u32;
    }
    let grid_min = (min / grid).max(1);
    let grid_max = (max / grid).max(grid_min);
    Ok(ImageSizes {
        min: grid_min * grid,
        max: grid_max * grid,
        test,
        grid_min,
        grid_max,
        multi_scale,
    })
}

/// Output locations under `out_dir`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub weights_dir: PathBuf,
    pub last: PathBuf,
    pub best: PathBuf,
    pub results: PathBuf,
    pub runs_dir: PathBuf,
}

impl RunPaths {
    pub fn new(out_dir: &Path, name: &str) -> Self {
        let weights_dir = out_dir.join("weights");
        let run = if name.is_empty() { "exp" } else { name };
        Self {
            last: weights_dir.join("last.pt"),
            best: weights_dir.join("best.pt"),
            weights_dir,
            results: out_dir.join("results.txt"),
            runs_dir: out_dir.join("runs").join(run),
        }
    }
}

impl TrainingConfig {
    pub fn load(path: &Path) -> TrainResult<Self> {
        let text = fs::read_to_string(path).map_err(TrainError::io(path))?;
        toml::from_str(&text).map_err(|source| TrainError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::new(&self.out_dir, &self.name)
    }

    pub fn weights_source(&self) -> WeightsSource {
        WeightsSource::resolve(&self.weights)
    }

    /// Fails fast on missing descriptor files.
    pub fn check_files(&self) -> TrainResult<()> {
        for path in [&self.cfg, &self.data] {
            if !path.is_file() {
                return Err(TrainError::MissingFile(path.clone()));
            }
        }
        match self.weights_source() {
            WeightsSource::NoWeights => Ok(()),
            WeightsSource::ForeignWeights(p) | WeightsSource::NativeCheckpoint(p) => {
                if p.is_file() {
                    Ok(())
                } else {
                    Err(TrainError::MissingFile(p))
                }
            }
        }
    }
}

/// Suffix used when renaming artifacts: numeric names are used as-is, others get a leading `_`.
pub fn name_suffix(name: &str) -> String {
    if name.is_empty() {
        String::new()
    } else if name.chars().all(|c| c.is_ascii_digit()) {
        name.to_string()
    } else {
        format!("_{name}")
    }
}
