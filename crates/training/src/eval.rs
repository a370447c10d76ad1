//! Validation pass on the EMA model: decode, NMS, per-class average precision
//! at IoU 0.5 and the validation loss components.

use crate::context::TrainingContext;
use crate::error::TrainResult;
use crate::loss::{compute_loss, host_values};
use burn::tensor::backend::Backend;
use burn_dataset::{DataLoader, TargetRow};
use models::{Detector, HeadInfo};
use std::cmp::Ordering;
use tracing::debug;

/// Weights of P, R, mAP@0.5 and F1 in the fitness score.
pub const FITNESS_WEIGHTS: [f64; 4] = [0.0, 0.01, 0.99, 0.0];
const MIN_WH: f32 = 2.0;
const MAX_WH: f32 = 4096.0;
const MATCH_IOU: f32 = 0.5;
/// Confidence at which P and R are reported.
const PR_SCORE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSettings {
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub max_det: usize,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            conf_thres: 0.001,
            iou_thres: 0.35,
            max_det: 300,
        }
    }
}

/// `results` is `(P, R, mAP@0.5, F1, val GIoU, val obj, val cls)`; `maps`
/// holds per-class AP, defaulting to the mean for classes never seen.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub results: [f64; 7],
    pub maps: Vec<f64>,
}

impl Evaluation {
    pub fn empty(nc: usize) -> Self {
        Self {
            results: [0.0; 7],
            maps: vec![0.0; nc],
        }
    }
}

/// Weighted combination of the first four results; higher is better.
pub fn fitness(results: &[f64; 7]) -> f64 {
    results
        .iter()
        .zip(FITNESS_WEIGHTS)
        .map(|(v, w)| v * w)
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// `x1, y1, x2, y2` in input pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class: usize,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area = |r: &[f32; 4]| (r[2] - r[0]) * (r[3] - r[1]);
    inter / (area(a) + area(b) - inter + 1e-16)
}

/// Decodes one head's raw output (row-major `[bs, na, gh, gw, 5 + nc]`)
/// into per-image candidates scoring above `conf_thres`.
pub fn decode_head(
    values: &[f32],
    dims: [usize; 5],
    head: &HeadInfo,
    nc: usize,
    conf_thres: f32,
) -> Vec<Vec<Detection>> {
    let [bs, na, gh, gw, no] = dims;
    let stride = head.stride as f32;
    let mut out = vec![Vec::new(); bs];
    for (b, dets) in out.iter_mut().enumerate() {
        for (a, anchor) in head.anchors.iter().enumerate().take(na) {
            for j in 0..gh {
                for i in 0..gw {
                    let base = (((b * na + a) * gh + j) * gw + i) * no;
                    let v = &values[base..base + no];
                    let obj = sigmoid(v[4]);
                    if obj <= conf_thres {
                        continue;
                    }
                    let w = v[2].exp().min(1e3) * anchor[0];
                    let h = v[3].exp().min(1e3) * anchor[1];
                    if !(w > MIN_WH && h > MIN_WH && w < MAX_WH && h < MAX_WH) {
                        continue;
                    }
                    let x = (sigmoid(v[0]) + i as f32) * stride;
                    let y = (sigmoid(v[1]) + j as f32) * stride;
                    let bbox = [x - w / 2.0, y - h / 2.0, x + w / 2.0, y + h / 2.0];
                    if nc <= 1 || no <= 5 {
                        dets.push(Detection {
                            bbox,
                            score: obj,
                            class: 0,
                        });
                        continue;
                    }
                    for c in 0..nc.min(no - 5) {
                        let score = obj * sigmoid(v[5 + c]);
                        if score > conf_thres {
                            dets.push(Detection {
                                bbox,
                                score,
                                class: c,
                            });
                        }
                    }
                }
            }
        }
    }
    out
}

/// Class-aware greedy NMS; output sorted by descending score.
pub fn non_max_suppression(mut dets: Vec<Detection>, iou_thres: f32, max_det: usize) -> Vec<Detection> {
    dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::new();
    for d in dets {
        if keep.len() >= max_det {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|k| k.class == d.class && box_iou(&k.bbox, &d.bbox) > iou_thres);
        if !suppressed {
            keep.push(d);
        }
    }
    keep
}

/// Marks each detection (sorted by score) correct when it overlaps an
/// unmatched label of its class by more than IoU 0.5.
pub fn match_detections(dets: &[Detection], labels: &[(usize, [f32; 4])]) -> Vec<bool> {
    let mut correct = vec![false; dets.len()];
    let mut detected = vec![false; labels.len()];
    let mut matched = 0;
    for (k, d) in dets.iter().enumerate() {
        if matched == labels.len() {
            break;
        }
        let best = labels
            .iter()
            .enumerate()
            .filter(|(_, (c, _))| *c == d.class)
            .map(|(li, (_, b))| (li, box_iou(&d.bbox, b)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        if let Some((li, iou)) = best {
            if iou > MATCH_IOU && !detected[li] {
                detected[li] = true;
                correct[k] = true;
                matched += 1;
            }
        }
    }
    correct
}

/// numpy-style `interp` over an ascending `xp`.
fn interp_curve(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let (Some(&first), Some(&last)) = (xp.first(), xp.last()) else {
        return 0.0;
    };
    if x <= first {
        return fp[0];
    }
    if x >= last {
        return fp[fp.len() - 1];
    }
    let k = xp.partition_point(|v| *v <= x);
    let (x0, x1) = (xp[k - 1], xp[k]);
    fp[k - 1] + (x - x0) * (fp[k] - fp[k - 1]) / (x1 - x0)
}

/// Area under the precision envelope, sampled at 101 recall points.
pub fn compute_ap(recall: &[f64], precision: &[f64]) -> f64 {
    let last_recall = recall.last().copied().unwrap_or(0.0);
    let mut mrec = vec![0.0];
    mrec.extend_from_slice(recall);
    mrec.push((last_recall + 1e-3).min(1.0));
    let mut mpre = vec![0.0];
    mpre.extend_from_slice(precision);
    mpre.push(0.0);
    for i in (0..mpre.len() - 1).rev() {
        mpre[i] = mpre[i].max(mpre[i + 1]);
    }
    let xs: Vec<f64> = (0..101).map(|i| i as f64 / 100.0).collect();
    let ys: Vec<f64> = xs.iter().map(|x| interp_curve(*x, &mrec, &mpre)).collect();
    xs.windows(2)
        .zip(ys.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassStats {
    pub classes: Vec<usize>,
    pub p: Vec<f64>,
    pub r: Vec<f64>,
    pub ap: Vec<f64>,
    pub f1: Vec<f64>,
}

/// Precision, recall, AP and F1 for every class that has labels.
pub fn ap_per_class(tp: &[bool], conf: &[f32], pred_cls: &[usize], target_cls: &[usize]) -> ClassStats {
    let mut order: Vec<usize> = (0..tp.len()).collect();
    order.sort_by(|a, b| conf[*b].partial_cmp(&conf[*a]).unwrap_or(Ordering::Equal));
    let mut classes: Vec<usize> = target_cls.to_vec();
    classes.sort_unstable();
    classes.dedup();

    let mut stats = ClassStats::default();
    for &c in &classes {
        let picked: Vec<usize> = order.iter().copied().filter(|&i| pred_cls[i] == c).collect();
        let n_gt = target_cls.iter().filter(|&&t| t == c).count();
        let (mut p, mut r, mut ap) = (0.0, 0.0, 0.0);
        if !picked.is_empty() && n_gt > 0 {
            let mut tpc = 0.0;
            let mut fpc = 0.0;
            let mut recall = Vec::with_capacity(picked.len());
            let mut precision = Vec::with_capacity(picked.len());
            for &i in &picked {
                if tp[i] {
                    tpc += 1.0;
                } else {
                    fpc += 1.0;
                }
                recall.push(tpc / (n_gt as f64 + 1e-16));
                precision.push(tpc / (tpc + fpc));
            }
            let neg_conf: Vec<f64> = picked.iter().map(|&i| -(conf[i] as f64)).collect();
            r = interp_curve(-PR_SCORE, &neg_conf, &recall);
            p = interp_curve(-PR_SCORE, &neg_conf, &precision);
            ap = compute_ap(&recall, &precision);
        }
        stats.classes.push(c);
        stats.p.push(p);
        stats.r.push(r);
        stats.ap.push(ap);
        stats.f1.push(2.0 * p * r / (p + r + 1e-16));
    }
    stats
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

/// Labels of image `b` as `(class, x1y1x2y2)` in pixels of a `width x height` batch.
fn pixel_labels(targets: &[TargetRow], b: usize, width: f32, height: f32) -> Vec<(usize, [f32; 4])> {
    targets
        .iter()
        .filter(|t| t[0] as usize == b)
        .map(|t| {
            let (cx, cy, w, h) = (t[2] * width, t[3] * height, t[4] * width, t[5] * height);
            (
                t[1] as usize,
                [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            )
        })
        .collect()
}

/// Runs the detector over the whole loader.
pub fn evaluate<B, M>(
    model: &M,
    loader: &DataLoader,
    ctx: &TrainingContext,
    settings: EvalSettings,
    device: &B::Device,
) -> TrainResult<Evaluation>
where
    B: Backend,
    M: Detector<B>,
{
    let heads = model.head_info();
    let nc = ctx.nc;
    let mut tp = Vec::new();
    let mut conf = Vec::new();
    let mut pred_cls = Vec::new();
    let mut target_cls = Vec::new();
    let mut val_loss = [0.0f64; 3];
    let mut batches = 0usize;

    let mut iter = loader.epoch(0);
    while let Some(batch) = iter.next_batch::<B>(device)? {
        let [bs, _, height, width] = batch.images.dims();
        let images = batch.images.div_scalar(255.0);
        let output = model.forward_detect(images, batch.rois);
        let items = compute_loss(&output, &batch.targets, &heads, ctx).items;
        val_loss[0] += items.giou as f64;
        val_loss[1] += items.obj as f64;
        val_loss[2] += items.cls as f64;
        batches += 1;

        let mut per_image = vec![Vec::new(); bs];
        for (p, head) in output.heads.into_iter().zip(&heads) {
            let dims = p.dims();
            let values = host_values(p);
            for (b, dets) in decode_head(&values, dims, head, nc, settings.conf_thres)
                .into_iter()
                .enumerate()
            {
                per_image[b].extend(dets);
            }
        }
        for (b, candidates) in per_image.into_iter().enumerate() {
            let mut dets = non_max_suppression(candidates, settings.iou_thres, settings.max_det);
            for d in &mut dets {
                d.bbox[0] = d.bbox[0].clamp(0.0, width as f32);
                d.bbox[1] = d.bbox[1].clamp(0.0, height as f32);
                d.bbox[2] = d.bbox[2].clamp(0.0, width as f32);
                d.bbox[3] = d.bbox[3].clamp(0.0, height as f32);
            }
            let labels = pixel_labels(&batch.targets, b, width as f32, height as f32);
            target_cls.extend(labels.iter().map(|(c, _)| *c));
            tp.extend(match_detections(&dets, &labels));
            conf.extend(dets.iter().map(|d| d.score));
            pred_cls.extend(dets.iter().map(|d| d.class));
        }
    }

    let mut eval = Evaluation::empty(nc);
    if tp.iter().any(|t| *t) {
        let stats = ap_per_class(&tp, &conf, &pred_cls, &target_cls);
        let map = mean(&stats.ap);
        eval.results[0] = mean(&stats.p);
        eval.results[1] = mean(&stats.r);
        eval.results[2] = map;
        eval.results[3] = mean(&stats.f1);
        eval.maps = vec![map; nc];
        for (c, ap) in stats.classes.iter().zip(&stats.ap) {
            if *c < nc {
                eval.maps[*c] = *ap;
            }
        }
    }
    if batches > 0 {
        for (slot, v) in eval.results[4..].iter_mut().zip(val_loss) {
            *slot = v / batches as f64;
        }
    }
    debug!(
        "evaluated {} labels, {} detections over {} batches",
        target_cls.len(),
        conf.len(),
        batches
    );
    Ok(eval)
}
