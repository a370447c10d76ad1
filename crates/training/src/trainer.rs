//! Training loop: setup, per-batch warm-up, multi-scale, accumulation and
//! EMA, then per-epoch evaluation and checkpointing.

use crate::checkpoint::{self, BestTracker, Checkpoint, ResumeState};
use crate::config::{normalize_image_sizes, TrainingConfig, WeightsSource};
use crate::context::TrainingContext;
use crate::distributed::{DataParallel, ModelHandle, ProcessGroup, SingleDevice};
use crate::ema::ModelEma;
use crate::error::{TrainError, TrainResult};
use crate::eval::{evaluate, fitness, EvalSettings, Evaluation};
use crate::hyp::Hyperparameters;
use crate::loss::host_values;
use crate::multiscale::MultiScale;
use crate::optim::{GroupedOptimizer, OptimizerKind};
use crate::param_groups::ParamGroups;
use crate::results::{append_results, memory_usage, progress_header, progress_line, results_line};
use crate::schedule::{AccumulationGate, CosineSchedule, WarmUp, NOMINAL_BATCH};
use crate::sink::{epoch_scalars, plot_batch, MetricsSink};
use crate::state_dict::StateDict;
use burn::optim::GradientsAccumulator;
use burn::tensor::backend::AutodiffBackend;
use burn_dataset::{
    labels_to_class_weights, labels_to_image_weights, weighted_choices, DataLoader,
    DetectionDataset, LoaderConfig,
};
use data_contracts::DatasetDescriptor;
use models::{load_darknet_weights, ArchConfig, Detector, RoiDepthNet, RoiDepthNetConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    /// `(P, R, mAP@0.5, F1, val GIoU, val obj, val cls)` of the last evaluated epoch.
    pub results: [f64; 7],
    /// Per-class mAP of the last evaluated epoch.
    pub maps: Vec<f64>,
    pub epochs_completed: usize,
    pub stopped_on_non_finite: bool,
    pub best_fitness: f64,
    /// Renamed artifacts when the run has a name.
    pub artifacts: Vec<PathBuf>,
    /// Batch size after clamping to the training set.
    pub batch_size: usize,
    /// Optimizer steps taken, each followed by one EMA update.
    pub optimizer_steps: u64,
}

/// A batch never exceeds the number of training images.
pub fn effective_batch_size(requested: usize, images: usize) -> usize {
    requested.min(images).max(1)
}

/// Data parallel over more than one device, otherwise the bare model.
pub fn default_handle<B: AutodiffBackend>(
    model: RoiDepthNet<B>,
    devices: &[B::Device],
) -> Box<dyn ModelHandle<B, RoiDepthNet<B>>> {
    if devices.len() > 1 {
        Box::new(DataParallel::new(model, devices.to_vec()))
    } else {
        Box::new(SingleDevice::new(model))
    }
}

/// Removes preview images and the results file left by a previous run.
fn clear_stale_artifacts(out_dir: &Path, results: &Path) -> TrainResult<()> {
    if let Ok(entries) = fs::read_dir(out_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains("_batch") && name.ends_with(".png") {
                let path = entry.path();
                fs::remove_file(&path).map_err(TrainError::io(&path))?;
            }
        }
    }
    if results.exists() {
        fs::remove_file(results).map_err(TrainError::io(results))?;
    }
    Ok(())
}

fn loader_config(
    cfg: &TrainingConfig,
    hyp: &Hyperparameters,
    img_size: u32,
    batch_size: usize,
    train: bool,
) -> LoaderConfig {
    LoaderConfig {
        img_size,
        batch_size,
        stride: cfg.grid,
        augment: train,
        rect: cfg.rect || !train,
        cache_images: cfg.cache_images,
        single_cls: cfg.single_cls,
        pad: 0.0,
        hsv_gains: hyp.hsv_gains(),
        flip_prob: 0.5,
    }
}

/// Runs a full training job on `devices` (the first is primary).
pub fn train<B: AutodiffBackend>(
    cfg: &TrainingConfig,
    hyp: &Hyperparameters,
    devices: &[B::Device],
    sink: &mut dyn MetricsSink,
) -> TrainResult<TrainOutcome> {
    train_with_handle(cfg, hyp, devices, sink, default_handle::<B>)
}

/// [`train`] with the model handle built by `make_handle`.
pub fn train_with_handle<B, F>(
    cfg: &TrainingConfig,
    hyp: &Hyperparameters,
    devices: &[B::Device],
    sink: &mut dyn MetricsSink,
    make_handle: F,
) -> TrainResult<TrainOutcome>
where
    B: AutodiffBackend,
    F: FnOnce(RoiDepthNet<B>, &[B::Device]) -> Box<dyn ModelHandle<B, RoiDepthNet<B>>>,
{
    let started = Instant::now();
    cfg.check_files()?;
    let Some(primary) = devices.first().cloned() else {
        return Err(TrainError::Other("no training device".into()));
    };
    let sizes = normalize_image_sizes(&cfg.img_size, cfg.grid, cfg.multi_scale)?;
    let descriptor = DatasetDescriptor::load(&cfg.data)?;
    let nc = if cfg.single_cls { 1 } else { descriptor.classes };

    let paths = cfg.paths();
    fs::create_dir_all(&paths.weights_dir).map_err(TrainError::io(&paths.weights_dir))?;
    clear_stale_artifacts(&cfg.out_dir, &paths.results)?;

    let arch = ArchConfig::load(&cfg.cfg)?;
    let mut model = RoiDepthNet::<B>::new(RoiDepthNetConfig { arch, num_classes: nc }, &primary);
    if model.grid_size() as u32 > cfg.grid {
        warn!(
            "model stride {} exceeds grid size {}; some feature maps will not divide evenly",
            model.grid_size(),
            cfg.grid
        );
    }

    let groups = ParamGroups::from_named(model.named_params());
    let [other, conv, bias] = groups.counts();
    info!("optimizer groups: {bias} .bias, {conv} Conv2d.weight, {other} other");
    let kind = if cfg.adam {
        OptimizerKind::adam()
    } else {
        OptimizerKind::Sgd
    };
    let mut optim = GroupedOptimizer::<B>::new(kind, groups, hyp.lr0, hyp.momentum, hyp.weight_decay);

    let mut resume = ResumeState::fresh(cfg.epochs);
    match cfg.weights_source() {
        WeightsSource::NoWeights => {}
        WeightsSource::ForeignWeights(path) => {
            let (loaded, header) = load_darknet_weights::<B, _>(model, &path)?;
            info!(
                "loaded darknet weights {} (v{}.{}.{}, seen {})",
                path.display(),
                header.major,
                header.minor,
                header.revision,
                header.seen
            );
            model = loaded;
        }
        WeightsSource::NativeCheckpoint(path) => {
            let (loaded, state) =
                checkpoint::resume::<B, _>(model, &path, &cfg.cfg, cfg.epochs, &paths.results)?;
            model = loaded;
            if let Some(saved) = &state.optimizer {
                optim.load_state(saved, &primary);
            }
            resume = state;
        }
    }
    let epochs = resume.epochs;
    let start_epoch = resume.start_epoch;

    if cfg.freeze_layers {
        model = model.freeze_non_output();
        info!("froze all layers except the YOLO outputs and their successors");
    }

    let mut schedule = CosineSchedule::new(&mut optim, epochs, start_epoch);

    let group = (devices.len() > 1).then(|| ProcessGroup::init(devices.len()));
    let mut handle = make_handle(model, devices);

    let requested = cfg.batch_size.max(1);
    // an oversized request already puts every image in one rect batch
    let dataset = DetectionDataset::open(
        &descriptor.train,
        loader_config(cfg, hyp, sizes.train(), requested, true),
    )?;
    let batch_size = effective_batch_size(requested, dataset.len());
    if batch_size != requested {
        info!(
            "batch size {requested} exceeds {} training images, using {batch_size}",
            dataset.len()
        );
    }
    dataset.check_classes(nc)?;
    let workers = DataLoader::default_workers(batch_size);
    let mut loader = DataLoader::new(dataset, batch_size, workers, !cfg.rect)?;
    let test_dataset = DetectionDataset::open(
        &descriptor.valid,
        loader_config(cfg, hyp, sizes.test, batch_size, false),
    )?;
    test_dataset.check_classes(nc)?;
    let test_loader = DataLoader::new(test_dataset, batch_size, workers, false)?;

    let mut ctx = TrainingContext::new(nc, hyp);
    ctx.class_weights = labels_to_class_weights(loader.dataset().labels(), nc);
    ctx.yolo_layers = handle.yolo_layers();

    let mut ema = ModelEma::<B, RoiDepthNet<B>>::new(handle.unwrap_module());
    let nb = loader.num_batches();
    let warm = WarmUp::new(nb, batch_size, epochs);
    let mut multiscale = MultiScale::new(&sizes, cfg.grid, cfg.seed);
    let settings = EvalSettings {
        conf_thres: cfg.conf_thres,
        iou_thres: cfg.iou_thres,
        ..Default::default()
    };
    let mut best = BestTracker::new(resume.best_fitness);
    let mut last = Evaluation::empty(nc);
    let mut gate = AccumulationGate::new(warm);
    let mut accumulator = GradientsAccumulator::new();
    let loss_scale = batch_size as f64 / NOMINAL_BATCH as f64;
    let mut epochs_completed = 0;

    info!(
        "image sizes {} - {} train, {} test",
        sizes.min, sizes.max, sizes.test
    );
    info!("using {} dataloader workers", loader.workers());
    info!("starting training for {epochs} epochs from epoch {start_epoch}");

    for epoch in start_epoch..epochs {
        if cfg.image_weights && nc > 0 {
            let class_weights: Vec<f32> = ctx
                .class_weights
                .iter()
                .zip(&last.maps)
                .map(|(w, m)| w * (1.0 - *m as f32).powi(2))
                .collect();
            let image_weights =
                labels_to_image_weights(loader.dataset().labels(), nc, &class_weights);
            let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(epoch as u64));
            let n = loader.dataset().len();
            loader.dataset_mut().indices = weighted_choices(&image_weights, n, &mut rng);
        }

        debug!("{}", progress_header());
        let mut mloss = [0.0f32; 5];
        let mut last_targets = 0;
        let mut last_img_size = sizes.train() as usize;
        let mut batches = loader.epoch(cfg.seed.wrapping_add(epoch as u64));
        let mut i = 0usize;
        while let Some(batch) = batches.next_batch::<B>(&primary)? {
            let ni = i + nb * epoch;
            let mut images = batch.images.div_scalar(255.0);

            if warm.active(ni) {
                ctx.gr = warm.apply(ni, epoch, hyp, &mut optim).gr;
            }
            let step_now = gate.observe(ni);
            if sizes.multi_scale {
                multiscale.maybe_resample(ni, gate.accumulate());
                images = multiscale.rescale(images);
            }
            let [_, _, _, width] = images.dims();
            if ni == 0 {
                let dims = images.dims();
                let preview = plot_batch(&host_values(images.clone().mul_scalar(255.0)), dims, &batch.targets);
                let path = cfg.out_dir.join("train_batch0.png");
                preview
                    .save(&path)
                    .map_err(|e| TrainError::Other(format!("write {}: {e}", path.display())))?;
                sink.add_image("train_batch0", &preview, epoch)?;
            }

            let out = handle.forward_backward(images, batch.rois, &batch.targets, &ctx, loss_scale);
            let Some(grads) = out.grads.filter(|_| out.items.is_finite()) else {
                warn!("non-finite loss, ending training: {:?}", out.items);
                if let Some(group) = group {
                    group.destroy();
                }
                return Ok(TrainOutcome {
                    results: last.results,
                    maps: last.maps,
                    epochs_completed,
                    stopped_on_non_finite: true,
                    best_fitness: best.best_fitness,
                    artifacts: Vec::new(),
                    batch_size,
                    optimizer_steps: ema.updates(),
                });
            };
            accumulator.accumulate(handle.unwrap_module(), grads);

            if step_now {
                let stepped = optim.step(handle.unwrap_module().clone(), accumulator.grads());
                handle.replace_module(stepped);
                ema.update(handle.unwrap_module());
            }

            for (m, v) in mloss.iter_mut().zip(out.items.to_array()) {
                *m = (*m * i as f32 + v) / (i + 1) as f32;
            }
            last_targets = batch.targets.len();
            last_img_size = width;
            debug!(
                "{}",
                progress_line(epoch, epochs, &memory_usage(), &mloss, last_targets, last_img_size)
            );
            i += 1;
        }

        schedule.step(&mut optim);

        let final_epoch = epoch + 1 == epochs;
        if !cfg.notest || final_epoch {
            last = evaluate::<B::InnerBackend, _>(ema.module(), &test_loader, &ctx, settings, &primary)?;
        }

        let progress = progress_line(epoch, epochs, &memory_usage(), &mloss, last_targets, last_img_size);
        let line = results_line(&progress, &last.results);
        info!("{line}");
        append_results(&paths.results, &line)?;
        for (tag, value) in epoch_scalars(&mloss, &last.results) {
            sink.add_scalar(tag, value, epoch)?;
        }

        let fi = fitness(&last.results);
        let save_best = best.observe(fi, final_epoch);
        let training_results = fs::read_to_string(&paths.results).ok();
        let ckpt = Checkpoint {
            epoch,
            best_fitness: best.best_fitness,
            training_results,
            model: StateDict::from_module::<B::InnerBackend, _>(ema.module()),
            optimizer: (!final_epoch).then(|| optim.to_state()),
        };
        checkpoint::save_epoch(&ckpt, &paths, save_best)?;
        epochs_completed += 1;
    }

    let artifacts = checkpoint::finalize_artifacts(&paths, &cfg.name)?;
    info!(
        "{} epochs completed in {:.3} hours",
        epochs_completed,
        started.elapsed().as_secs_f64() / 3600.0
    );
    if let Some(group) = group {
        group.destroy();
    }
    Ok(TrainOutcome {
        results: last.results,
        maps: last.maps,
        epochs_completed,
        stopped_on_non_finite: false,
        best_fitness: best.best_fitness,
        artifacts,
        batch_size,
        optimizer_steps: ema.updates(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_clamped_to_the_training_set() {
        assert_eq!(effective_batch_size(64, 6), 6);
        assert_eq!(effective_batch_size(4, 6), 4);
        assert_eq!(effective_batch_size(0, 6), 1);
        assert_eq!(effective_batch_size(16, 0), 1);
    }
}
