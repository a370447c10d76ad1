//! Detection + depth loss: GIoU box regression, objectness and class BCE
//! (optionally focal) and smooth-L1 depth.

use crate::context::TrainingContext;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_dataset::TargetRow;
use models::{DetectorOutput, HeadInfo};

const FOCAL_ALPHA: f64 = 0.25;

/// Detached loss components, in results order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossItems {
    pub giou: f32,
    pub obj: f32,
    pub cls: f32,
    pub total: f32,
    pub depth: f32,
}

impl LossItems {
    pub fn to_array(&self) -> [f32; 5] {
        [self.giou, self.obj, self.cls, self.total, self.depth]
    }

    pub fn from_array(v: [f32; 5]) -> Self {
        Self {
            giou: v[0],
            obj: v[1],
            cls: v[2],
            total: v[3],
            depth: v[4],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

pub struct LossOutput<B: Backend> {
    /// Gain-weighted sum of all components, shape `[1]`.
    pub total: Tensor<B, 1>,
    pub items: LossItems,
}

/// Targets assigned to one head: flat cell index plus what each prediction is regressed to.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeadTargets {
    /// `((b * na + a) * gh + gj) * gw + gi`.
    pub index: Vec<i64>,
    /// Offset within the cell and size, in grid units.
    pub tbox: Vec<[f32; 4]>,
    /// Anchor size in grid units.
    pub anchors: Vec<[f32; 2]>,
    pub tcls: Vec<usize>,
}

impl HeadTargets {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// IoU of two boxes sharing a center, given as widths and heights.
pub fn wh_iou(a: [f32; 2], b: [f32; 2]) -> f32 {
    let inter = a[0].min(b[0]) * a[1].min(b[1]);
    inter / (a[0] * a[1] + b[0] * b[1] - inter + 1e-16)
}

/// Matches every target against every anchor of a head, keeping pairs whose
/// shape IoU exceeds `iou_t`.
pub fn build_head_targets(
    targets: &[TargetRow],
    head: &HeadInfo,
    dims: [usize; 4],
    iou_t: f32,
) -> HeadTargets {
    let [_, na, gh, gw] = dims;
    let stride = head.stride.max(1) as f32;
    let mut out = HeadTargets::default();
    for (a, anchor) in head.anchors.iter().enumerate().take(na) {
        let anchor = [anchor[0] / stride, anchor[1] / stride];
        for t in targets {
            let gxy = [t[2] * gw as f32, t[3] * gh as f32];
            let gwh = [t[4] * gw as f32, t[5] * gh as f32];
            if wh_iou(anchor, gwh) <= iou_t {
                continue;
            }
            let gi = (gxy[0].floor().max(0.0) as usize).min(gw - 1);
            let gj = (gxy[1].floor().max(0.0) as usize).min(gh - 1);
            let b = t[0] as usize;
            out.index.push((((b * na + a) * gh + gj) * gw + gi) as i64);
            out.tbox.push([gxy[0] - gi as f32, gxy[1] - gj as f32, gwh[0], gwh[1]]);
            out.anchors.push(anchor);
            out.tcls.push(t[1] as usize);
        }
    }
    out
}

/// Element-wise binary cross entropy on logits with a positive-class weight,
/// scaled by a focal term when `gamma > 0`.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
    pos_weight: f64,
    gamma: f64,
) -> Tensor<B, D> {
    // softplus(-x) computed without overflow
    let softplus_neg =
        logits.clone().abs().neg().exp().log1p() + logits.clone().neg().clamp_min(0.0);
    let log_weight = targets.clone().mul_scalar(pos_weight - 1.0).add_scalar(1.0);
    let negatives = targets.clone().neg().add_scalar(1.0);
    let loss = negatives.clone() * logits.clone() + log_weight * softplus_neg;
    if gamma <= 0.0 {
        return loss;
    }
    let p = sigmoid(logits);
    let p_t = targets.clone() * p.clone() + negatives.clone() * p.neg().add_scalar(1.0);
    let alpha = targets.mul_scalar(FOCAL_ALPHA) + negatives.mul_scalar(1.0 - FOCAL_ALPHA);
    let modulating = p_t.neg().add_scalar(1.0).powf_scalar(gamma);
    loss * alpha * modulating
}

/// Generalized IoU of `[n, 4]` center-size boxes, shape `[n, 1]`.
pub fn bbox_giou<B: Backend>(b1: Tensor<B, 2>, b2: Tensor<B, 2>) -> Tensor<B, 2> {
    let n = b1.dims()[0];
    let col = |t: &Tensor<B, 2>, c: usize| t.clone().slice([0..n, c..c + 1]);
    let corners = |t: &Tensor<B, 2>| {
        let (x, y, w, h) = (col(t, 0), col(t, 1), col(t, 2), col(t, 3));
        let hw = w.clone().div_scalar(2.0);
        let hh = h.clone().div_scalar(2.0);
        (
            x.clone() - hw.clone(),
            y.clone() - hh.clone(),
            x + hw,
            y + hh,
            w,
            h,
        )
    };
    let (ax1, ay1, ax2, ay2, aw, ah) = corners(&b1);
    let (bx1, by1, bx2, by2, bw, bh) = corners(&b2);

    let iw = (ax2.clone().min_pair(bx2.clone()) - ax1.clone().max_pair(bx1.clone())).clamp_min(0.0);
    let ih = (ay2.clone().min_pair(by2.clone()) - ay1.clone().max_pair(by1.clone())).clamp_min(0.0);
    let inter = iw * ih;
    let union = (aw * ah + bw * bh - inter.clone()).add_scalar(1e-16);
    let iou = inter / union.clone();

    let cw = ax2.max_pair(bx2) - ax1.min_pair(bx1);
    let ch = ay2.max_pair(by2) - ay1.min_pair(by1);
    let c_area = (cw * ch).add_scalar(1e-16);
    iou - (c_area.clone() - union) / c_area
}

pub(crate) fn host_values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default()
}

pub(crate) fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f32 {
    host_values(t.clone().detach())
        .first()
        .copied()
        .unwrap_or(f32::NAN)
}

/// Smooth-L1 (beta 1) between predicted and labelled depth, averaged over
/// images that have at least one object. Each image's first object carries
/// the depth of its region of interest.
pub fn depth_loss<B: Backend>(pred: Tensor<B, 2>, targets: &[TargetRow]) -> Tensor<B, 1> {
    let device = pred.device();
    let bs = pred.dims()[0];
    let mut target = vec![0.0f32; bs];
    let mut mask = vec![0.0f32; bs];
    for t in targets {
        let b = t[0] as usize;
        if b < bs && mask[b] == 0.0 {
            target[b] = t[6];
            mask[b] = 1.0;
        }
    }
    let count: f32 = mask.iter().sum();
    if count == 0.0 {
        return Tensor::zeros([1], &device);
    }
    let target = Tensor::<B, 1>::from_data(TensorData::new(target, [bs]), &device);
    let mask = Tensor::<B, 1>::from_data(TensorData::new(mask, [bs]), &device);
    let diff = (pred.reshape([bs]) - target).abs();
    let quadratic = diff.clone().clamp_max(1.0);
    let loss = quadratic.clone().powf_scalar(2.0).mul_scalar(0.5) + (diff - quadratic);
    (loss * mask).sum().div_scalar(count)
}

/// Full training loss for one batch. Components are gain-weighted; `total`
/// is their sum.
pub fn compute_loss<B: Backend>(
    output: &DetectorOutput<B>,
    targets: &[TargetRow],
    heads: &[HeadInfo],
    ctx: &TrainingContext,
) -> LossOutput<B> {
    let device = output.depth.device();
    let hyp = &ctx.hyp;
    let gr = ctx.gr as f32;
    let mut lbox = Tensor::<B, 1>::zeros([1], &device);
    let mut lobj = Tensor::<B, 1>::zeros([1], &device);
    let mut lcls = Tensor::<B, 1>::zeros([1], &device);

    for (p, head) in output.heads.iter().zip(heads) {
        let [bs, na, gh, gw, no] = p.dims();
        let cells = bs * na * gh * gw;
        let flat = p.clone().reshape([cells, no]);
        let assigned = build_head_targets(targets, head, [bs, na, gh, gw], hyp.iou_t as f32);
        let mut tobj = vec![0.0f32; cells];

        let n = assigned.len();
        if n > 0 {
            let index = Tensor::<B, 1, Int>::from_data(
                TensorData::new(assigned.index.clone(), [n]),
                &device,
            );
            let ps = flat.clone().select(0, index);
            let anchors: Vec<f32> = assigned.anchors.iter().flatten().copied().collect();
            let anchors = Tensor::<B, 2>::from_data(TensorData::new(anchors, [n, 2]), &device);
            let pxy = sigmoid(ps.clone().slice([0..n, 0..2]));
            let pwh = ps.clone().slice([0..n, 2..4]).exp().clamp_max(1e3) * anchors;
            let pbox = Tensor::cat(vec![pxy, pwh], 1);
            let tbox: Vec<f32> = assigned.tbox.iter().flatten().copied().collect();
            let tbox = Tensor::<B, 2>::from_data(TensorData::new(tbox, [n, 4]), &device);
            let giou = bbox_giou(pbox, tbox);
            lbox = lbox + giou.clone().neg().add_scalar(1.0).mean();

            let giou = host_values(giou.detach());
            for (k, &cell) in assigned.index.iter().enumerate() {
                tobj[cell as usize] = (1.0 - gr) + gr * giou[k].max(0.0);
            }

            if ctx.nc > 1 && no > 5 {
                let mut onehot = vec![0.0f32; n * ctx.nc];
                for (k, &c) in assigned.tcls.iter().enumerate() {
                    if c < ctx.nc {
                        onehot[k * ctx.nc + c] = 1.0;
                    }
                }
                let tcls = Tensor::<B, 2>::from_data(TensorData::new(onehot, [n, ctx.nc]), &device);
                let pcls = ps.slice([0..n, 5..no]);
                lcls = lcls + bce_with_logits(pcls, tcls, hyp.cls_pw, hyp.fl_gamma).mean();
            }
        }

        let pobj = flat.slice([0..cells, 4..5]).reshape([cells]);
        let tobj = Tensor::<B, 1>::from_data(TensorData::new(tobj, [cells]), &device);
        lobj = lobj + bce_with_logits(pobj, tobj, hyp.obj_pw, hyp.fl_gamma).mean();
    }

    let lbox = lbox.mul_scalar(hyp.giou);
    let lobj = lobj.mul_scalar(hyp.obj);
    let lcls = lcls.mul_scalar(hyp.cls);
    let ldepth = depth_loss(output.depth.clone(), targets).mul_scalar(hyp.depth);
    let total = lbox.clone() + lobj.clone() + lcls.clone() + ldepth.clone();
    let items = LossItems {
        giou: scalar(&lbox),
        obj: scalar(&lobj),
        cls: scalar(&lcls),
        total: scalar(&total),
        depth: scalar(&ldepth),
    };
    LossOutput { total, items }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type B = NdArray<f32>;

    fn head() -> HeadInfo {
        HeadInfo {
            stride: 32,
            anchors: vec![[32.0, 32.0], [96.0, 64.0]],
        }
    }

    #[test]
    fn assignment_uses_shape_iou_and_clamps_cells() {
        // one box exactly one cell large at the far corner
        let targets = [[1.0, 2.0, 0.999, 0.999, 0.25, 0.25, 3.0]];
        let t = build_head_targets(&targets, &head(), [2, 2, 4, 4], 0.2);
        assert_eq!(t.len(), 1);
        // image 1, anchor 0, row 3, column 3
        assert_eq!(t.index[0], 47);
        assert_eq!(t.tcls, vec![2]);
        assert!((t.tbox[0][2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bce_matches_closed_form() {
        let device = Default::default();
        let x = Tensor::<B, 1>::from_floats([0.0, 2.0, -3.0], &device);
        let y = Tensor::<B, 1>::from_floats([1.0, 0.0, 1.0], &device);
        let got = host_values(bce_with_logits(x, y, 1.0, 0.0));
        let expect = [
            (2.0f32).ln(),
            (1.0 + 2.0f32.exp()).ln(),
            (1.0 + 3.0f32.exp()).ln(),
        ];
        for (g, e) in got.iter().zip(expect) {
            assert!((g - e).abs() < 1e-4, "{g} vs {e}");
        }
    }

    #[test]
    fn giou_of_identical_boxes_is_one() {
        let device = Default::default();
        let b = Tensor::<B, 2>::from_floats([[1.0, 1.0, 2.0, 2.0], [0.5, 0.5, 1.0, 3.0]], &device);
        let g = host_values(bbox_giou(b.clone(), b));
        assert!(g.iter().all(|v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn giou_penalizes_disjoint_boxes() {
        let device = Default::default();
        let a = Tensor::<B, 2>::from_floats([[0.5, 0.5, 1.0, 1.0]], &device);
        let b = Tensor::<B, 2>::from_floats([[2.5, 0.5, 1.0, 1.0]], &device);
        let g = host_values(bbox_giou(a, b))[0];
        // enclosing box 3x1, union 2
        assert!((g - (-1.0 / 3.0)).abs() < 1e-5);
    }

    #[test]
    fn depth_loss_is_smooth_l1_over_labelled_images() {
        let device = Default::default();
        let pred = Tensor::<B, 2>::from_floats([[1.5], [10.0], [0.0]], &device);
        let targets = [
            [0.0, 0.0, 0.5, 0.5, 0.1, 0.1, 1.0],
            [0.0, 0.0, 0.5, 0.5, 0.1, 0.1, 9.0],
            [1.0, 0.0, 0.5, 0.5, 0.1, 0.1, 7.0],
        ];
        let loss = scalar(&depth_loss(pred, &targets));
        // image 0: 0.5 * 0.25, image 1: 3 - 0.5, image 2 unlabelled
        assert!((loss - (0.125 + 2.5) / 2.0).abs() < 1e-5);
    }
}
