//! Exponential moving average of model weights, kept on the inner backend.

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Decay ramps with the update count: `decay * (1 - exp(-updates / 2000))`.
pub fn ema_decay(base: f64, updates: u64) -> f64 {
    base * (1.0 - (-(updates as f64) / 2000.0).exp())
}

pub struct ModelEma<B: AutodiffBackend, M: AutodiffModule<B>> {
    ema: M::InnerModule,
    updates: u64,
    decay: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> ModelEma<B, M> {
    pub fn new(model: &M) -> Self {
        Self::with_decay(model, 0.9999)
    }

    pub fn with_decay(model: &M, decay: f64) -> Self {
        Self {
            ema: model.valid(),
            updates: 0,
            decay,
            _backend: PhantomData,
        }
    }

    pub fn module(&self) -> &M::InnerModule {
        &self.ema
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// `shadow = d * shadow + (1 - d) * live`, with `d` taken after counting this update.
    pub fn update(&mut self, model: &M) {
        self.updates += 1;
        let d = ema_decay(self.decay, self.updates);
        let mut live = LiveParams {
            tensors: HashMap::new(),
        };
        model.valid().visit(&mut live);
        let mut blend = Blend {
            live: live.tensors,
            d,
        };
        self.ema = self.ema.clone().map(&mut blend);
    }
}

/// Flattened live parameters keyed by id.
struct LiveParams<B: Backend> {
    tensors: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for LiveParams<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let n = tensor.shape().num_elements();
        self.tensors.insert(id, tensor.clone().reshape([n]));
    }
}

struct Blend<B: Backend> {
    live: HashMap<ParamId, Tensor<B, 1>>,
    d: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.live.remove(&id) {
            Some(live) if live.dims()[0] == tensor.shape().num_elements() => {
                let live = live.to_device(&tensor.device()).reshape(tensor.dims());
                tensor.mul_scalar(self.d) + live.mul_scalar(1.0 - self.d)
            }
            _ => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use burn::backend::{ndarray::NdArray, Autodiff};
    use burn::nn::{Linear, LinearConfig};
    use models::collect_params;

    type B = Autodiff<NdArray<f32>>;
    type Inner = NdArray<f32>;

    struct Shift(f32);

    impl<BK: Backend> ModuleMapper<BK> for Shift {
        fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<BK, D>) -> Tensor<BK, D> {
            tensor.add_scalar(self.0)
        }
    }

    #[test]
    fn update_blends_towards_live_weights_and_counts() {
        let device = Default::default();
        let model: Linear<B> = LinearConfig::new(3, 2).init(&device);
        let mut ema = ModelEma::<B, Linear<B>>::new(&model);
        let live = model.clone().map(&mut Shift(1.0));

        ema.update(&live);
        assert_eq!(ema.updates(), 1);
        let d = ema_decay(0.9999, 1) as f32;
        let shadow = collect_params::<Inner, _>(ema.module());
        let target = collect_params::<Inner, _>(&live.valid());
        assert_eq!(shadow.len(), target.len());
        for (id, s) in &shadow {
            let t = &target[id];
            for (a, b) in s.values.iter().zip(&t.values) {
                // d * (b - 1) + (1 - d) * b
                assert!((a - (b - d)).abs() < 1e-5, "{a} vs {b}");
            }
        }

        ema.update(&live);
        assert_eq!(ema.updates(), 2);
    }

    #[test]
    fn decay_starts_near_zero_and_saturates() {
        assert!(ema_decay(0.9999, 1) < 0.001);
        assert!(ema_decay(0.9999, 2000) > 0.63 && ema_decay(0.9999, 2000) < 0.64);
        assert!((ema_decay(0.9999, 100_000) - 0.9999).abs() < 1e-6);
    }
}
