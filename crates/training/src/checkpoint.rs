//! Checkpoint persistence, resume and end-of-run artifact handling.

use crate::config::{name_suffix, RunPaths};
use crate::error::{TrainError, TrainResult};
use crate::optim::OptimizerState;
use crate::state_dict::StateDict;
use burn::module::Module;
use burn::tensor::backend::Backend;
use models::Detector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub best_fitness: f64,
    /// Contents of the results file when the checkpoint was taken.
    pub training_results: Option<String>,
    /// EMA weights.
    pub model: StateDict,
    /// Dropped on the final epoch and when stripped.
    pub optimizer: Option<OptimizerState>,
}

impl Checkpoint {
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(TrainError::io(parent))?;
        }
        let bytes = bincode::serialize(self).map_err(|source| TrainError::Codec {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, bytes).map_err(TrainError::io(path))
    }

    pub fn load(path: &Path) -> TrainResult<Self> {
        let bytes = fs::read(path).map_err(TrainError::io(path))?;
        bincode::deserialize(&bytes).map_err(|source| TrainError::Codec {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Where training picks up after weights are loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub start_epoch: usize,
    /// Possibly extended total epoch count.
    pub epochs: usize,
    pub best_fitness: f64,
    pub optimizer: Option<OptimizerState>,
}

impl ResumeState {
    pub fn fresh(epochs: usize) -> Self {
        Self {
            start_epoch: 0,
            epochs,
            best_fitness: 0.0,
            optimizer: None,
        }
    }
}

/// Loads a native checkpoint into `model`.
///
/// Parameters whose shapes differ are skipped; names the model lacks fail
/// with [`TrainError::IncompatibleWeights`]. Optimizer state and best fitness
/// are restored only when the checkpoint carries an optimizer. Saved results
/// text is written back to `results_path`. If `epochs` is not beyond the saved
/// epoch, it is extended by the saved epoch count.
pub fn resume<B, M>(
    model: M,
    weights: &Path,
    cfg: &Path,
    epochs: usize,
    results_path: &Path,
) -> TrainResult<(M, ResumeState)>
where
    B: Backend,
    M: Module<B> + Detector<B>,
{
    let ckpt = Checkpoint::load(weights)?;
    let (model, report) = ckpt.model.load_into::<B, M>(model).map_err(|reason| {
        TrainError::IncompatibleWeights {
            weights: weights.to_path_buf(),
            cfg: cfg.to_path_buf(),
            reason,
        }
    })?;
    if !report.skipped.is_empty() {
        warn!(
            "skipped {} tensors with mismatched shapes: {}",
            report.skipped.len(),
            report.skipped.join(", ")
        );
    }
    info!("loaded {} tensors from {}", report.loaded, weights.display());

    let mut state = ResumeState::fresh(epochs);
    if let Some(optimizer) = ckpt.optimizer {
        state.optimizer = Some(optimizer);
        state.best_fitness = ckpt.best_fitness;
    }
    if let Some(text) = &ckpt.training_results {
        fs::write(results_path, text).map_err(TrainError::io(results_path))?;
    }
    state.start_epoch = ckpt.epoch + 1;
    if state.epochs < state.start_epoch {
        info!(
            "{} has been trained for {} epochs. Fine-tuning for {} additional epochs.",
            weights.display(),
            ckpt.epoch,
            state.epochs
        );
        state.epochs += ckpt.epoch;
    }
    Ok((model, state))
}

/// Tracks the best fitness seen and decides which slots an epoch writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestTracker {
    pub best_fitness: f64,
}

impl BestTracker {
    pub fn new(best_fitness: f64) -> Self {
        Self { best_fitness }
    }

    /// Records `fitness`; returns whether the best slot should be written.
    /// Never true on the final epoch.
    pub fn observe(&mut self, fitness: f64, final_epoch: bool) -> bool {
        let improved = fitness.total_cmp(&self.best_fitness).is_gt();
        if improved {
            self.best_fitness = fitness;
        }
        improved && !final_epoch
    }
}

/// Writes `last`, then `best` when requested.
pub fn save_epoch(ckpt: &Checkpoint, paths: &RunPaths, save_best: bool) -> TrainResult<()> {
    ckpt.save(&paths.last)?;
    if save_best {
        ckpt.save(&paths.best)?;
        info!("{}-save-as-best", ckpt.epoch);
    }
    Ok(())
}

/// Removes optimizer state from a checkpoint file in place.
pub fn strip_optimizer(path: &Path) -> TrainResult<()> {
    let mut ckpt = Checkpoint::load(path)?;
    ckpt.optimizer = None;
    ckpt.save(path)
}

/// Renames `last`, `best` and the results file with the run-name suffix and
/// strips optimizer state from the renamed checkpoints. Returns the new paths.
pub fn finalize_artifacts(paths: &RunPaths, name: &str) -> TrainResult<Vec<PathBuf>> {
    if name.is_empty() {
        return Ok(Vec::new());
    }
    let suffix = name_suffix(name);
    let renames = [
        (
            paths.last.clone(),
            paths.weights_dir.join(format!("last{suffix}.pt")),
        ),
        (
            paths.best.clone(),
            paths.weights_dir.join(format!("best{suffix}.pt")),
        ),
        (
            paths.results.clone(),
            paths.results.with_file_name(format!("results{suffix}.txt")),
        ),
    ];
    let mut out = Vec::new();
    for (from, to) in renames {
        if !from.exists() {
            continue;
        }
        fs::rename(&from, &to).map_err(TrainError::io(&from))?;
        if to.extension().is_some_and(|e| e == "pt") {
            strip_optimizer(&to)?;
        }
        out.push(to);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_requires_strict_improvement_and_not_final() {
        let mut best = BestTracker::new(0.0);
        assert!(!best.observe(0.0, false));
        assert!(best.observe(0.2, false));
        assert!(!best.observe(0.1, false));
        assert!(!best.observe(0.5, true));
        assert_eq!(best.best_fitness, 0.5);
    }
}
