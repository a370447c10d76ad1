use burn::module::ParamId;
use burn::tensor::{backend::Backend, Tensor};

/// Geometry of one YOLO output.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadInfo {
    pub stride: usize,
    /// Anchor (width, height) pairs in input pixels.
    pub anchors: Vec<[f32; 2]>,
}

#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    /// One raw prediction per head, `[batch, anchors, grid_h, grid_w, 5 + classes]`.
    pub heads: Vec<Tensor<B, 5>>,
    /// `[batch, 1]` depth of each image's region of interest.
    pub depth: Tensor<B, 2>,
}

/// What the training core needs from a detector with a depth head.
pub trait Detector<B: Backend> {
    fn forward_detect(&self, images: Tensor<B, 4>, rois: Tensor<B, 2>) -> DetectorOutput<B>;

    fn head_info(&self) -> Vec<HeadInfo>;

    fn num_classes(&self) -> usize;

    /// Layer indices of the YOLO outputs within the flat layer list.
    fn yolo_layers(&self) -> Vec<usize>;

    fn grid_size(&self) -> usize;

    /// Stable names for every float parameter, e.g. `module_list.3.Conv2d.weight`.
    fn named_params(&self) -> Vec<(String, ParamId)>;
}
