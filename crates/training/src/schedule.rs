//! Burn-in warm-up, gradient accumulation count and the per-epoch cosine schedule.

use crate::hyp::Hyperparameters;
use crate::optim::GroupedOptimizer;
use crate::param_groups::ParamGroup;
use burn::tensor::backend::AutodiffBackend;
use std::f64::consts::PI;

/// Effective batch the accumulation count aims for.
pub const NOMINAL_BATCH: usize = 64;

/// Two-point linear interpolation clamped to the end values.
pub fn interp(x: f64, xp: [f64; 2], fp: [f64; 2]) -> f64 {
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[1] {
        return fp[1];
    }
    fp[0] + (x - xp[0]) * (fp[1] - fp[0]) / (xp[1] - xp[0])
}

/// Length of the warm-up window: at least three epochs or 500 iterations.
pub fn burn_in_iterations(batches_per_epoch: usize) -> usize {
    (3 * batches_per_epoch).max(500)
}

/// Steady-state accumulation count: `max(round(64 / batch_size), 1)`.
pub fn nominal_accumulate(batch_size: usize) -> usize {
    let ratio = NOMINAL_BATCH as f64 / batch_size.max(1) as f64;
    (ratio.round_ties_even() as usize).max(1)
}

/// Cosine lr factor: `((1 + cos(e * pi / epochs)) / 2) * 0.95 + 0.05`.
pub fn lr_lambda(epoch: f64, epochs: usize) -> f64 {
    ((1.0 + (epoch * PI / epochs.max(1) as f64).cos()) / 2.0) * 0.95 + 0.05
}

/// Per-iteration warm-up of lr, weight decay, momentum and the GIoU ratio.
#[derive(Debug, Clone, Copy)]
pub struct WarmUp {
    pub n_burn: usize,
    pub batch_size: usize,
    pub epochs: usize,
}

/// Values produced by one warm-up application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmUpStep {
    pub gr: f64,
    pub accumulate: usize,
}

impl WarmUp {
    pub fn new(batches_per_epoch: usize, batch_size: usize, epochs: usize) -> Self {
        Self {
            n_burn: burn_in_iterations(batches_per_epoch),
            batch_size,
            epochs,
        }
    }

    pub fn active(&self, ni: usize) -> bool {
        ni <= self.n_burn
    }

    /// Accumulation count during burn-in, ramping from 1 to the nominal value.
    pub fn accumulate(&self, ni: usize) -> usize {
        let target = NOMINAL_BATCH as f64 / self.batch_size.max(1) as f64;
        let x = interp(ni as f64, [0.0, self.n_burn as f64], [1.0, target]);
        (x.round_ties_even() as usize).max(1)
    }

    /// Rewrites every group's settings for iteration `ni`. Bias lr falls from
    /// 0.1 to its scheduled value; other groups rise from 0. Momentum is only
    /// touched for optimizers that have one.
    pub fn apply<B: AutodiffBackend>(
        &self,
        ni: usize,
        epoch: usize,
        hyp: &Hyperparameters,
        optim: &mut GroupedOptimizer<B>,
    ) -> WarmUpStep {
        let xi = [0.0, self.n_burn as f64];
        let x = ni as f64;
        let has_momentum = optim.kind().has_momentum();
        let scale = lr_lambda(epoch as f64, self.epochs);
        for group in ParamGroup::ALL {
            let settings = optim.group_mut(group);
            let lr_start = if group == ParamGroup::Bias { 0.1 } else { 0.0 };
            settings.lr = interp(x, xi, [lr_start, settings.initial_lr * scale]);
            let wd_end = if group == ParamGroup::ConvWeight {
                hyp.weight_decay
            } else {
                0.0
            };
            settings.weight_decay = interp(x, xi, [0.0, wd_end]);
            if has_momentum {
                settings.momentum = interp(x, xi, [0.9, hyp.momentum]);
            }
        }
        WarmUpStep {
            gr: interp(x, xi, [0.0, 1.0]),
            accumulate: self.accumulate(ni),
        }
    }
}

/// Decides which iterations run an optimizer step and counts them. The
/// accumulation count follows the warm-up ramp, then stays at its last value.
#[derive(Debug, Clone, Copy)]
pub struct AccumulationGate {
    warm: WarmUp,
    accumulate: usize,
    steps: u64,
}

impl AccumulationGate {
    pub fn new(warm: WarmUp) -> Self {
        Self {
            warm,
            accumulate: nominal_accumulate(warm.batch_size),
            steps: 0,
        }
    }

    /// Updates the accumulation count for iteration `ni` and reports whether
    /// the optimizer steps on it.
    pub fn observe(&mut self, ni: usize) -> bool {
        if self.warm.active(ni) {
            self.accumulate = self.warm.accumulate(ni);
        }
        let step = ni % self.accumulate == 0;
        if step {
            self.steps += 1;
        }
        step
    }

    pub fn accumulate(&self) -> usize {
        self.accumulate
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

/// Epoch-level cosine schedule with the same counter semantics as a lambda
/// schedule whose counter was pre-seeded to `start_epoch - 1`.
#[derive(Debug, Clone, Copy)]
pub struct CosineSchedule {
    epochs: usize,
    last_epoch: i64,
}

impl CosineSchedule {
    /// Applies the epoch-0 factor immediately, then seeds the counter.
    pub fn new<B: AutodiffBackend>(
        optim: &mut GroupedOptimizer<B>,
        epochs: usize,
        start_epoch: usize,
    ) -> Self {
        let schedule = Self {
            epochs,
            last_epoch: start_epoch as i64 - 1,
        };
        schedule.apply(optim, 0.0);
        schedule
    }

    pub fn lr_lambda(&self, epoch: f64) -> f64 {
        lr_lambda(epoch, self.epochs)
    }

    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    /// Advances one epoch and sets `lr = initial_lr * lf(epoch)` on every group.
    pub fn step<B: AutodiffBackend>(&mut self, optim: &mut GroupedOptimizer<B>) {
        self.last_epoch += 1;
        self.apply(optim, self.last_epoch as f64);
    }

    fn apply<B: AutodiffBackend>(&self, optim: &mut GroupedOptimizer<B>, epoch: f64) {
        let factor = self.lr_lambda(epoch);
        for group in ParamGroup::ALL {
            let settings = optim.group_mut(group);
            settings.lr = settings.initial_lr * factor;
        }
    }
}
