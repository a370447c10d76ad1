//! Single-node multi-device coordination: the process group record and the
//! model handles the trainer drives (one device, or data-parallel replicas).

use crate::context::TrainingContext;
use crate::loss::{compute_loss, LossItems};
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use burn_dataset::TargetRow;
use models::Detector;
use tracing::info;

pub const INIT_METHOD: &str = "tcp://127.0.0.1:9999";

/// Membership of this process in the training group. Only one node is
/// supported, so the process is always rank 0 of a world of 1 and owns every
/// local device. No collective backend sits behind it: gradients are reduced
/// in-process by [`DataParallel::forward_backward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub init_method: String,
    pub world_size: usize,
    pub rank: usize,
    pub local_devices: usize,
}

impl ProcessGroup {
    /// Records the group and logs it; nothing is connected to `init_method`.
    pub fn init(local_devices: usize) -> Self {
        let group = Self {
            init_method: INIT_METHOD.to_string(),
            world_size: 1,
            rank: 0,
            local_devices,
        };
        info!(
            "process group up: {} (rank {}/{}, {} local devices)",
            group.init_method, group.rank, group.world_size, group.local_devices
        );
        group
    }

    /// Logs the teardown; there is no connection to close.
    pub fn destroy(self) {
        info!("process group {} destroyed", self.init_method);
    }
}

/// Loss items and (when the loss is finite) gradients on the primary device.
pub struct StepOutput {
    pub items: LossItems,
    pub grads: Option<GradientsParams>,
}

/// What the trainer needs from a model regardless of how it is replicated.
pub trait ModelHandle<B: AutodiffBackend, M: AutodiffModule<B> + Detector<B>> {
    /// The underlying model on the primary device.
    fn unwrap_module(&self) -> &M;

    fn replace_module(&mut self, model: M);

    fn world_size(&self) -> usize;

    fn yolo_layers(&self) -> Vec<usize> {
        self.unwrap_module().yolo_layers()
    }

    /// Forward, loss and backward on one batch. The loss is multiplied by
    /// `loss_scale` before backward. Non-finite losses skip backward.
    fn forward_backward(
        &self,
        images: Tensor<B, 4>,
        rois: Tensor<B, 2>,
        targets: &[TargetRow],
        ctx: &TrainingContext,
        loss_scale: f64,
    ) -> StepOutput;
}

pub struct SingleDevice<M> {
    model: M,
}

impl<M> SingleDevice<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<B, M> ModelHandle<B, M> for SingleDevice<M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
{
    fn unwrap_module(&self) -> &M {
        &self.model
    }

    fn replace_module(&mut self, model: M) {
        self.model = model;
    }

    fn world_size(&self) -> usize {
        1
    }

    fn forward_backward(
        &self,
        images: Tensor<B, 4>,
        rois: Tensor<B, 2>,
        targets: &[TargetRow],
        ctx: &TrainingContext,
        loss_scale: f64,
    ) -> StepOutput {
        replica_step(&self.model, images, rois, targets, ctx, loss_scale)
    }
}

fn replica_step<B, M>(
    model: &M,
    images: Tensor<B, 4>,
    rois: Tensor<B, 2>,
    targets: &[TargetRow],
    ctx: &TrainingContext,
    loss_scale: f64,
) -> StepOutput
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
{
    let output = model.forward_detect(images, rois);
    let loss = compute_loss(&output, targets, &model.head_info(), ctx);
    if !loss.items.total.is_finite() {
        return StepOutput {
            items: loss.items,
            grads: None,
        };
    }
    let grads = loss.total.mul_scalar(loss_scale).backward();
    StepOutput {
        items: loss.items,
        grads: Some(GradientsParams::from_grads(grads, model)),
    }
}

/// Splits every batch along dim 0 across devices, runs a forked replica per
/// shard and reduces the gradients onto the primary device.
pub struct DataParallel<B: AutodiffBackend, M> {
    model: M,
    devices: Vec<B::Device>,
}

impl<B, M> DataParallel<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
{
    /// `devices[0]` is the primary device and must hold `model`.
    pub fn new(model: M, devices: Vec<B::Device>) -> Self {
        Self { model, devices }
    }

    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }
}

/// Row ranges of a `batch`-sized tensor split into at most `parts` near-equal shards.
pub fn shard_ranges(batch: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    let parts = parts.clamp(1, batch.max(1));
    let base = batch / parts;
    let extra = batch % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// Targets belonging to images in `range`, re-indexed from 0.
pub fn shard_targets(targets: &[TargetRow], range: &std::ops::Range<usize>) -> Vec<TargetRow> {
    targets
        .iter()
        .filter(|t| range.contains(&(t[0] as usize)))
        .map(|t| {
            let mut row = *t;
            row[0] -= range.start as f32;
            row
        })
        .collect()
}

impl<B, M> ModelHandle<B, M> for DataParallel<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
{
    fn unwrap_module(&self) -> &M {
        &self.model
    }

    fn replace_module(&mut self, model: M) {
        self.model = model;
    }

    fn world_size(&self) -> usize {
        self.devices.len()
    }

    fn forward_backward(
        &self,
        images: Tensor<B, 4>,
        rois: Tensor<B, 2>,
        targets: &[TargetRow],
        ctx: &TrainingContext,
        loss_scale: f64,
    ) -> StepOutput {
        let [bs, c, h, w] = images.dims();
        let primary = images.device();
        let mut weighted = [0.0f32; 5];
        let mut accumulator = GradientsAccumulator::new();
        let mut finite = true;
        for (range, device) in shard_ranges(bs, self.devices.len()).into_iter().zip(&self.devices) {
            let share = range.len() as f64 / bs as f64;
            let replica = self.model.clone().fork(device);
            let shard_images = images
                .clone()
                .slice([range.clone(), 0..c, 0..h, 0..w])
                .to_device(device);
            let shard_rois = rois.clone().slice([range.clone(), 0..4]).to_device(device);
            let shard = replica_step(
                &replica,
                shard_images,
                shard_rois,
                &shard_targets(targets, &range),
                ctx,
                loss_scale * share,
            );
            for (acc, v) in weighted.iter_mut().zip(shard.items.to_array()) {
                *acc += v * share as f32;
            }
            match shard.grads {
                Some(grads) if finite => {
                    let grads = move_grads::<B, M>(&self.model, grads, &primary);
                    accumulator.accumulate(&self.model, grads);
                }
                _ => finite = false,
            }
        }
        StepOutput {
            items: LossItems::from_array(weighted),
            grads: finite.then(|| accumulator.grads()),
        }
    }
}

/// Moves every gradient of `module`'s parameters onto `device`.
pub fn move_grads<B, M>(module: &M, mut grads: GradientsParams, device: &B::Device) -> GradientsParams
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut moved = GradientsParams::new();
    let mut mover = MoveGrads::<B> {
        from: &mut grads,
        into: &mut moved,
        device: device.clone(),
    };
    module.visit(&mut mover);
    moved
}

struct MoveGrads<'a, B: AutodiffBackend> {
    from: &'a mut GradientsParams,
    into: &'a mut GradientsParams,
    device: B::Device,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for MoveGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.from.remove::<B::InnerBackend, D>(id) {
            self.into
                .register::<B::InnerBackend, D>(id, grad.to_device(&self.device));
        }
    }
}
