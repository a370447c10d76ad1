//! Name-keyed snapshots of model parameters.

use burn::module::{Module, ParamId};
use burn::tensor::backend::Backend;
use models::{collect_params, overwrite_params, Detector, HostTensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub tensors: Vec<NamedTensor>,
}

/// Result of loading a state dict into a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Names present in both but with different shapes; left at their current values.
    pub skipped: Vec<String>,
}

impl StateDict {
    pub fn from_module<B, M>(module: &M) -> Self
    where
        B: Backend,
        M: Module<B> + Detector<B>,
    {
        let params = collect_params::<B, M>(module);
        let tensors = module
            .named_params()
            .into_iter()
            .filter_map(|(name, id)| {
                params.get(&id).map(|t| NamedTensor {
                    name,
                    shape: t.shape.clone(),
                    values: t.values.clone(),
                })
            })
            .collect();
        Self { tensors }
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Loads every tensor whose shape matches the model. Names the model does
    /// not have are returned as `Err` with the first offending name.
    pub fn load_into<B, M>(&self, module: M) -> Result<(M, LoadReport), String>
    where
        B: Backend,
        M: Module<B> + Detector<B>,
    {
        let by_name: HashMap<String, ParamId> = module.named_params().into_iter().collect();
        let mut values = HashMap::new();
        let mut names_by_id = HashMap::new();
        for t in &self.tensors {
            let Some(id) = by_name.get(&t.name) else {
                return Err(format!("unexpected parameter `{}`", t.name));
            };
            values.insert(
                *id,
                HostTensor {
                    shape: t.shape.clone(),
                    values: t.values.clone(),
                },
            );
            names_by_id.insert(*id, t.name.clone());
        }
        let (module, report) = overwrite_params::<B, M>(module, &values);
        let mut skipped: Vec<String> = report
            .shape_mismatch
            .iter()
            .filter_map(|id| names_by_id.get(id).cloned())
            .collect();
        skipped.sort();
        Ok((
            module,
            LoadReport {
                loaded: report.applied,
                skipped,
            },
        ))
    }
}
