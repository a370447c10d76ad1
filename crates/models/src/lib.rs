//! Burn detection model with a region-of-interest depth head.
//!
//! - `ArchConfig`: TOML architecture descriptor (backbone convolutions, YOLO heads).
//! - `RoiDepthNet`: Darknet-style convolutional backbone, one 1x1 head per YOLO
//!   output and a small MLP regressing depth from pooled features plus the ROI.
//! - `Detector`: the seam the training core drives; exposes raw head outputs,
//!   anchor geometry and stable parameter names.
//! - `darknet`: reader/writer for Darknet `.weights` files.

pub mod arch;
pub mod darknet;
pub mod detector;
pub mod params;
pub mod roidepth;

pub use arch::{ArchConfig, ArchError, ConvSpec, HeadSpec};
pub use darknet::{load_darknet_weights, DarknetError, DarknetHeader};
pub use detector::{Detector, DetectorOutput, HeadInfo};
pub use params::{collect_params, overwrite_params, HostTensor, OverwriteReport};
pub use roidepth::{NetLayout, RoiDepthNet, RoiDepthNetConfig};

pub mod prelude {
    pub use super::{ArchConfig, Detector, DetectorOutput, RoiDepthNet, RoiDepthNetConfig};
}
