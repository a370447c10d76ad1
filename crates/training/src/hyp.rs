//! Loss gains, optimizer constants and augmentation strengths.

use crate::error::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Immutable hyperparameter record. Class-count adjustments produce a new
/// value through [`Hyperparameters::for_classes`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    /// GIoU box loss gain.
    pub giou: f64,
    /// Classification loss gain.
    pub cls: f64,
    /// Classification BCE positive weight.
    pub cls_pw: f64,
    /// Objectness loss gain.
    pub obj: f64,
    /// Objectness BCE positive weight.
    pub obj_pw: f64,
    /// Anchor/target IoU threshold for assignment.
    pub iou_t: f64,
    /// Initial learning rate.
    pub lr0: f64,
    /// Final learning-rate ratio.
    pub lrf: f64,
    /// SGD momentum (Adam beta1 is fixed).
    pub momentum: f64,
    pub weight_decay: f64,
    /// Focal loss gamma; 0 disables focal loss.
    pub fl_gamma: f64,
    pub hsv_h: f64,
    pub hsv_s: f64,
    pub hsv_v: f64,
    pub degrees: f64,
    pub translate: f64,
    pub scale: f64,
    pub shear: f64,
    /// Depth regression loss gain.
    pub depth: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            giou: 3.54,
            cls: 37.4,
            cls_pw: 1.0,
            obj: 64.3,
            obj_pw: 1.0,
            iou_t: 0.20,
            lr0: 0.001,
            lrf: 0.0005,
            momentum: 0.937,
            weight_decay: 0.01,
            fl_gamma: 0.0,
            hsv_h: 0.0138,
            hsv_s: 0.678,
            hsv_v: 0.36,
            degrees: 0.0,
            translate: 0.0,
            scale: 0.0,
            shear: 0.0,
            depth: 1.0,
        }
    }
}

impl Hyperparameters {
    /// Loads overrides from TOML; missing keys keep their defaults.
    pub fn load(path: &Path) -> TrainResult<Self> {
        let text = fs::read_to_string(path).map_err(TrainError::io(path))?;
        toml::from_str(&text).map_err(|source| TrainError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Class gain is tuned for 80 classes; scale it to `nc`.
    pub fn for_classes(&self, nc: usize) -> Self {
        Self {
            cls: self.cls * nc as f64 / 80.0,
            ..*self
        }
    }

    pub fn hsv_gains(&self) -> [f32; 3] {
        [self.hsv_h as f32, self.hsv_s as f32, self.hsv_v as f32]
    }
}
