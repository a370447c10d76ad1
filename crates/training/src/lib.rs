#![recursion_limit = "256"]
//! Training core for the ROI-depth detector.
//!
//! - `schedule`: burn-in warm-up, accumulation count, cosine lr schedule.
//! - `multiscale`: per-step random training resolution.
//! - `optim`: three-group optimizer (SGD/Nesterov or Adam) with serializable state.
//! - `ema`: exponential moving average of the weights.
//! - `checkpoint`: last/best checkpoints, resume, artifact finalization.
//! - `distributed`: process group and single/data-parallel model handles.
//! - `trainer`: the orchestrating loop.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod distributed;
pub mod ema;
pub mod error;
pub mod eval;
pub mod hyp;
pub mod loss;
pub mod multiscale;
pub mod optim;
pub mod param_groups;
pub mod results;
pub mod schedule;
pub mod sink;
pub mod state_dict;
pub mod trainer;
pub mod util;

pub use checkpoint::{Checkpoint, ResumeState};
pub use config::{ImageSizes, RunPaths, TrainingConfig, WeightsSource};
pub use context::TrainingContext;
pub use error::{TrainError, TrainResult};
pub use hyp::Hyperparameters;
pub use models::{RoiDepthNet, RoiDepthNetConfig};
pub use trainer::{default_handle, train, train_with_handle, TrainOutcome};
pub use util::{run_train, TrainArgs};

use burn::tensor::backend::Backend;

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type TrainDevice = <TrainBackend as Backend>::Device;

/// Maps a device spec (`cpu`, `0`, `0,1`) to backend devices. The CPU
/// backend repeats its single device once per listed ordinal.
pub fn resolve_devices(spec: &str) -> TrainResult<Vec<TrainDevice>> {
    let spec = spec.trim();
    if spec.is_empty() || spec.eq_ignore_ascii_case("cpu") {
        return Ok(vec![cpu_device()]);
    }
    let ordinals = spec
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| TrainError::Other(format!("invalid device `{s}` in `{spec}`")))
        })
        .collect::<TrainResult<Vec<usize>>>()?;
    Ok(ordinals.into_iter().map(ordinal_device).collect())
}

#[cfg(not(feature = "backend-wgpu"))]
fn cpu_device() -> TrainDevice {
    burn_ndarray::NdArrayDevice::Cpu
}

#[cfg(not(feature = "backend-wgpu"))]
fn ordinal_device(_ordinal: usize) -> TrainDevice {
    burn_ndarray::NdArrayDevice::Cpu
}

#[cfg(feature = "backend-wgpu")]
fn cpu_device() -> TrainDevice {
    burn_wgpu::WgpuDevice::Cpu
}

#[cfg(feature = "backend-wgpu")]
fn ordinal_device(ordinal: usize) -> TrainDevice {
    burn_wgpu::WgpuDevice::DiscreteGpu(ordinal)
}
