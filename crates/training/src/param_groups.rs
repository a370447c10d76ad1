//! Partition of model parameters into the three optimizer groups.

use burn::module::ParamId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Everything else; no weight decay.
    Other = 0,
    /// Convolution kernels; the only group with weight decay.
    ConvWeight = 1,
    /// Biases; no weight decay, warm-up starts from a high lr.
    Bias = 2,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 3] = [ParamGroup::Other, ParamGroup::ConvWeight, ParamGroup::Bias];

    pub fn classify(name: &str) -> Self {
        if name.contains(".bias") {
            ParamGroup::Bias
        } else if name.contains("Conv2d.weight") {
            ParamGroup::ConvWeight
        } else {
            ParamGroup::Other
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Named parameters split by group. Every parameter lands in exactly one group.
#[derive(Debug, Clone, Default)]
pub struct ParamGroups {
    pub membership: HashMap<ParamId, ParamGroup>,
    pub names: HashMap<ParamId, String>,
}

impl ParamGroups {
    pub fn from_named(named: Vec<(String, ParamId)>) -> Self {
        let mut groups = ParamGroups::default();
        for (name, id) in named {
            groups.membership.insert(id, ParamGroup::classify(&name));
            groups.names.insert(id, name);
        }
        groups
    }

    pub fn group_of(&self, id: &ParamId) -> ParamGroup {
        self.membership.get(id).copied().unwrap_or(ParamGroup::Other)
    }

    pub fn counts(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for g in self.membership.values() {
            counts[g.index()] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_groups() {
        assert_eq!(ParamGroup::classify("module_list.0.Conv2d.weight"), ParamGroup::ConvWeight);
        assert_eq!(ParamGroup::classify("module_list.0.Conv2d.bias"), ParamGroup::Bias);
        assert_eq!(ParamGroup::classify("depth_head.fc1.weight"), ParamGroup::Other);
        assert_eq!(ParamGroup::classify("depth_head.fc1.bias"), ParamGroup::Bias);
    }

    #[test]
    fn every_parameter_counted_once() {
        let named = vec![
            ("module_list.0.Conv2d.weight".to_string(), ParamId::new()),
            ("module_list.0.Conv2d.bias".to_string(), ParamId::new()),
            ("depth_head.fc1.weight".to_string(), ParamId::new()),
        ];
        let groups = ParamGroups::from_named(named);
        assert_eq!(groups.counts(), [1, 1, 1]);
    }
}
