//! Host-side access to float parameters keyed by `ParamId`.

use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use std::collections::HashMap;

/// Flattened parameter values with their shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

struct Collector {
    out: HashMap<ParamId, HostTensor>,
}

impl<B: Backend> ModuleVisitor<B> for Collector {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap_or_default();
        self.out.insert(id, HostTensor { shape, values });
    }
}

/// Copies every float parameter of `module` to the host.
pub fn collect_params<B: Backend, M: Module<B>>(module: &M) -> HashMap<ParamId, HostTensor> {
    let mut collector = Collector {
        out: HashMap::new(),
    };
    module.visit(&mut collector);
    collector.out
}

struct Overwrite<'a> {
    values: &'a HashMap<ParamId, HostTensor>,
    applied: usize,
    skipped: Vec<ParamId>,
}

impl<B: Backend> ModuleMapper<B> for Overwrite<'_> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(host) = self.values.get(&id) else {
            return tensor;
        };
        if host.shape != tensor.dims().to_vec() {
            self.skipped.push(id);
            return tensor;
        }
        let grad = tensor.is_require_grad();
        let device = tensor.device();
        let fresh = Tensor::<B, D>::from_data(
            TensorData::new(host.values.clone(), host.shape.clone()),
            &device,
        );
        self.applied += 1;
        if grad {
            fresh.require_grad()
        } else {
            fresh
        }
    }
}

/// Outcome of [`overwrite_params`].
#[derive(Debug, Clone, Default)]
pub struct OverwriteReport {
    pub applied: usize,
    /// Parameters left untouched because the stored shape differs.
    pub shape_mismatch: Vec<ParamId>,
}

/// Replaces parameters present in `values` whose shape matches; others keep their current value.
pub fn overwrite_params<B: Backend, M: Module<B>>(
    module: M,
    values: &HashMap<ParamId, HostTensor>,
) -> (M, OverwriteReport) {
    let mut mapper = Overwrite {
        values,
        applied: 0,
        skipped: Vec::new(),
    };
    let module = module.map(&mut mapper);
    (
        module,
        OverwriteReport {
            applied: mapper.applied,
            shape_mismatch: mapper.skipped,
        },
    )
}
