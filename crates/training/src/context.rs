use crate::hyp::Hyperparameters;

/// Training-time values the loss and the loop share, held outside the model.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    pub nc: usize,
    /// Hyperparameters already adjusted for `nc`.
    pub hyp: Hyperparameters,
    /// GIoU ratio for objectness targets; ramps 0 -> 1 during burn-in.
    pub gr: f64,
    pub class_weights: Vec<f32>,
    pub yolo_layers: Vec<usize>,
}

impl TrainingContext {
    pub fn new(nc: usize, hyp: &Hyperparameters) -> Self {
        Self {
            nc,
            hyp: hyp.for_classes(nc),
            gr: 1.0,
            class_weights: vec![1.0 / nc.max(1) as f32; nc],
            yolo_layers: Vec::new(),
        }
    }
}
