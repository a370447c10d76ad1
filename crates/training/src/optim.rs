//! Optimizer with three parameter groups whose lr, momentum and weight decay
//! can be rewritten between steps (warm-up, cosine schedule).

use crate::param_groups::{ParamGroup, ParamGroups};
use burn::module::{AutodiffModule, ModuleMapper, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub lr: f64,
    pub initial_lr: f64,
    /// SGD momentum, or Adam beta1.
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// SGD with Nesterov momentum, no dampening.
    Sgd,
    Adam { beta2: f64, epsilon: f64 },
}

impl OptimizerKind {
    pub fn adam() -> Self {
        OptimizerKind::Adam {
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn has_momentum(&self) -> bool {
        matches!(self, OptimizerKind::Sgd)
    }
}

struct ParamState<B: Backend> {
    step: u64,
    /// SGD momentum buffer or Adam first moment.
    exp_avg: Tensor<B, 1>,
    exp_avg_sq: Option<Tensor<B, 1>>,
}

/// Serializable optimizer state keyed by parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub groups: Vec<GroupSettings>,
    pub params: Vec<ParamSlot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSlot {
    pub name: String,
    pub step: u64,
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Option<Vec<f32>>,
}

pub struct GroupedOptimizer<B: AutodiffBackend> {
    kind: OptimizerKind,
    groups: [GroupSettings; 3],
    params: ParamGroups,
    state: HashMap<ParamId, ParamState<B::InnerBackend>>,
}

impl<B: AutodiffBackend> GroupedOptimizer<B> {
    /// `ConvWeight` gets `weight_decay`; `Other` and `Bias` get none.
    /// Adam keeps beta1 at 0.9 and ignores `momentum`.
    pub fn new(kind: OptimizerKind, params: ParamGroups, lr0: f64, momentum: f64, weight_decay: f64) -> Self {
        let momentum = if kind.has_momentum() { momentum } else { 0.9 };
        let settings = |wd| GroupSettings {
            lr: lr0,
            initial_lr: lr0,
            momentum,
            weight_decay: wd,
        };
        Self {
            kind,
            groups: [settings(0.0), settings(weight_decay), settings(0.0)],
            params,
            state: HashMap::new(),
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn group(&self, group: ParamGroup) -> &GroupSettings {
        &self.groups[group.index()]
    }

    pub fn group_mut(&mut self, group: ParamGroup) -> &mut GroupSettings {
        &mut self.groups[group.index()]
    }

    pub fn groups(&self) -> &[GroupSettings; 3] {
        &self.groups
    }

    pub fn param_groups(&self) -> &ParamGroups {
        &self.params
    }

    /// Applies one update to every parameter that has a gradient.
    pub fn step<M: AutodiffModule<B>>(&mut self, module: M, mut grads: GradientsParams) -> M {
        let mut mapper = StepMapper {
            optim: self,
            grads: &mut grads,
        };
        module.map(&mut mapper)
    }

    fn update<const D: usize>(
        &mut self,
        id: ParamId,
        param: Tensor<B::InnerBackend, D>,
        grad: Tensor<B::InnerBackend, D>,
    ) -> Tensor<B::InnerBackend, D> {
        let dims = param.dims();
        let n = param.shape().num_elements();
        let p = param.reshape([n]);
        let mut g = grad.reshape([n]);
        let settings = self.groups[self.params.group_of(&id).index()];
        if settings.weight_decay != 0.0 {
            g = g + p.clone().mul_scalar(settings.weight_decay);
        }
        let previous = self.state.remove(&id).filter(|s| s.exp_avg.dims()[0] == n);
        let previous_step = previous.as_ref().map(|s| s.step).unwrap_or(0);
        let (updated, state) = match self.kind {
            OptimizerKind::Sgd => {
                let buf = match previous {
                    Some(s) => s.exp_avg.mul_scalar(settings.momentum) + g.clone(),
                    None => g.clone(),
                };
                let direction = g + buf.clone().mul_scalar(settings.momentum);
                let p = p - direction.mul_scalar(settings.lr);
                (
                    p,
                    ParamState {
                        step: previous_step + 1,
                        exp_avg: buf,
                        exp_avg_sq: None,
                    },
                )
            }
            OptimizerKind::Adam { beta2, epsilon } => {
                let beta1 = settings.momentum;
                let (m, v) = match previous {
                    Some(ParamState {
                        exp_avg,
                        exp_avg_sq: Some(sq),
                        ..
                    }) => (exp_avg, sq),
                    _ => (g.zeros_like(), g.zeros_like()),
                };
                let step = previous_step + 1;
                let m = m.mul_scalar(beta1) + g.clone().mul_scalar(1.0 - beta1);
                let v = v.mul_scalar(beta2) + g.powf_scalar(2.0).mul_scalar(1.0 - beta2);
                let bc1 = 1.0 - beta1.powi(step as i32);
                let bc2 = 1.0 - beta2.powi(step as i32);
                let denom = v.clone().div_scalar(bc2).sqrt().add_scalar(epsilon);
                let p = p - m.clone().div_scalar(bc1).div(denom).mul_scalar(settings.lr);
                (
                    p,
                    ParamState {
                        step,
                        exp_avg: m,
                        exp_avg_sq: Some(v),
                    },
                )
            }
        };
        self.state.insert(id, state);
        updated.reshape(dims)
    }

    pub fn to_state(&self) -> OptimizerState {
        let mut params: Vec<ParamSlot> = self
            .state
            .iter()
            .filter_map(|(id, s)| {
                let name = self.params.names.get(id)?;
                Some(ParamSlot {
                    name: name.clone(),
                    step: s.step,
                    exp_avg: host(&s.exp_avg),
                    exp_avg_sq: s.exp_avg_sq.as_ref().map(host),
                })
            })
            .collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        OptimizerState {
            kind: self.kind,
            groups: self.groups.to_vec(),
            params,
        }
    }

    /// Restores group settings and per-parameter buffers. Buffers for names the
    /// model no longer has are dropped; size mismatches are reset at the next step.
    pub fn load_state(&mut self, state: &OptimizerState, device: &<B::InnerBackend as Backend>::Device) {
        if state.kind != self.kind {
            warn!(
                "optimizer state is {:?} but {:?} is configured; keeping fresh state",
                state.kind, self.kind
            );
            return;
        }
        for (slot, saved) in self.groups.iter_mut().zip(&state.groups) {
            *slot = *saved;
        }
        let by_name: HashMap<&str, ParamId> = self
            .params
            .names
            .iter()
            .map(|(id, name)| (name.as_str(), *id))
            .collect();
        self.state.clear();
        let mut dropped = 0usize;
        for slot in &state.params {
            let Some(id) = by_name.get(slot.name.as_str()) else {
                dropped += 1;
                continue;
            };
            let sq_ok = slot
                .exp_avg_sq
                .as_ref()
                .map_or(true, |sq| sq.len() == slot.exp_avg.len());
            if !sq_ok {
                dropped += 1;
                continue;
            }
            let tensor = |values: &Vec<f32>| {
                Tensor::<B::InnerBackend, 1>::from_data(
                    TensorData::new(values.clone(), [values.len()]),
                    device,
                )
            };
            self.state.insert(
                *id,
                ParamState {
                    step: slot.step,
                    exp_avg: tensor(&slot.exp_avg),
                    exp_avg_sq: slot.exp_avg_sq.as_ref().map(tensor),
                },
            );
        }
        if dropped > 0 {
            warn!("dropped optimizer state for {dropped} unknown parameters");
        }
    }
}

fn host<B: Backend>(t: &Tensor<B, 1>) -> Vec<f32> {
    t.clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default()
}

struct StepMapper<'a, B: AutodiffBackend> {
    optim: &'a mut GroupedOptimizer<B>,
    grads: &'a mut GradientsParams,
}

impl<B: AutodiffBackend> ModuleMapper<B> for StepMapper<'_, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return tensor;
        };
        let require_grad = tensor.is_require_grad();
        let grad = grad.to_device(&tensor.device());
        let updated = Tensor::from_inner(self.optim.update(id, tensor.inner(), grad));
        if require_grad {
            updated.require_grad()
        } else {
            updated
        }
    }
}
