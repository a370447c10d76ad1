use burn::backend::{ndarray::NdArray, Autodiff};
use burn::tensor::Tensor;
use burn_dataset::TargetRow;
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use training::checkpoint::Checkpoint;
use training::distributed::{ModelHandle, StepOutput};
use training::results::format_g;
use training::sink::{JsonlSink, NullSink};
use training::{
    default_handle, resolve_devices, train, train_with_handle, Hyperparameters, RoiDepthNet, TrainingConfig,
    TrainingContext,
};

type ADBackend = Autodiff<NdArray<f32>>;

const ARCH: &str = r#"
channels = 3
depth_hidden = 8

[[backbone]]
filters = 4
stride = 2

[[backbone]]
filters = 4
stride = 2

[[backbone]]
filters = 8
stride = 2

[[backbone]]
filters = 8
stride = 2

[[backbone]]
filters = 8
stride = 2

[[heads]]
from = 4
anchors = [[32.0, 32.0], [56.0, 40.0]]

[[heads]]
from = 3
anchors = [[8.0, 8.0], [16.0, 20.0]]
"#;

/// Writes a two-class dataset with train/valid splits plus the arch descriptor.
fn synthetic_run(root: &Path) -> anyhow::Result<TrainingConfig> {
    for split in ["train", "valid"] {
        let images = root.join(split).join("images");
        let labels = root.join(split).join("labels");
        fs::create_dir_all(&images)?;
        fs::create_dir_all(&labels)?;
        for k in 0..6u32 {
            let img = image::RgbImage::from_fn(64, 48, |x, y| {
                let inside = (16..40).contains(&x) && (12..36).contains(&y);
                if inside {
                    image::Rgb([200, (k * 30) as u8, 40])
                } else {
                    image::Rgb([20, 20, (x + y) as u8])
                }
            });
            img.save(images.join(format!("{split}_{k}.png")))?;
            let class = k % 2;
            fs::write(
                labels.join(format!("{split}_{k}.txt")),
                format!("{class} 0.44 0.5 0.375 0.5 {}\nroi 0.25 0.25 0.625 0.75\n", 5 + k),
            )?;
        }
    }
    fs::write(
        root.join("toy.data"),
        "classes=2\ntrain=train/images\nvalid=valid/images\n",
    )?;
    fs::write(root.join("arch.toml"), ARCH)?;
    Ok(TrainingConfig {
        cfg: root.join("arch.toml"),
        data: root.join("toy.data"),
        img_size: vec![64],
        weights: String::new(),
        device: "cpu".into(),
        epochs: 2,
        batch_size: 4,
        out_dir: root.join("out"),
        ..Default::default()
    })
}

fn fitness_of_line(line: &str) -> f64 {
    let cols: Vec<f64> = line
        .split_whitespace()
        .skip(2)
        .map(|v| v.parse().unwrap())
        .collect();
    // cols: 5 losses, targets, img_size, then P R mAP F1 ...
    0.01 * cols[8] + 0.99 * cols[9]
}

#[test]
fn two_epoch_run_writes_results_and_checkpoints() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = synthetic_run(tmp.path())?;
    let devices = resolve_devices(&cfg.device)?;
    let mut sink = JsonlSink::create(&cfg.paths().runs_dir)?;
    let outcome = train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut sink)?;

    assert_eq!(outcome.epochs_completed, 2);
    assert!(!outcome.stopped_on_non_finite);
    assert_eq!(outcome.maps.len(), 2);
    // two batches per epoch, all inside burn-in where accumulate is 1
    assert_eq!(outcome.batch_size, 4);
    assert_eq!(outcome.optimizer_steps, 4);

    let paths = cfg.paths();
    let results = fs::read_to_string(&paths.results)?;
    let lines: Vec<&str> = results.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].trim_start().starts_with("0/1"));
    assert!(lines.iter().all(|l| l.split_whitespace().count() == 16));

    assert!(paths.last.is_file());
    let last = Checkpoint::load(&paths.last)?;
    assert_eq!(last.epoch, 1);
    assert!(last.optimizer.is_none());
    assert_eq!(last.training_results.as_deref(), Some(results.as_str()));
    assert_eq!(paths.best.is_file(), fitness_of_line(lines[0]) > 0.0);

    assert!(cfg.out_dir.join("train_batch0.png").is_file());
    let scalars = fs::read_to_string(paths.runs_dir.join("scalars.jsonl"))?;
    assert_eq!(scalars.lines().count(), 22);
    Ok(())
}

#[test]
fn resume_continues_from_saved_epoch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = synthetic_run(tmp.path())?;
    cfg.epochs = 1;
    let devices = resolve_devices("cpu")?;
    train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut NullSink)?;
    let saved: PathBuf = tmp.path().join("saved.pt");
    fs::copy(cfg.paths().last, &saved)?;

    cfg.weights = saved.to_string_lossy().into_owned();
    cfg.epochs = 3;
    let outcome = train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut NullSink)?;
    // saved epoch 0, so epochs 1 and 2 remain
    assert_eq!(outcome.epochs_completed, 2);
    let results = fs::read_to_string(cfg.paths().results)?;
    let lines: Vec<&str> = results.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[2].trim_start().starts_with("2/2"));
    assert_eq!(Checkpoint::load(&cfg.paths().last)?.epoch, 2);
    Ok(())
}

#[test]
fn non_finite_loss_stops_before_the_next_iteration() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let cfg = synthetic_run(tmp.path())?;
    let hyp = Hyperparameters {
        giou: f64::NAN,
        ..Default::default()
    };
    let devices = resolve_devices("cpu")?;
    let outcome = train::<ADBackend>(&cfg, &hyp, &devices, &mut NullSink)?;
    assert!(outcome.stopped_on_non_finite);
    assert_eq!(outcome.epochs_completed, 0);
    assert_eq!(outcome.results, [0.0; 7]);
    assert!(!cfg.paths().last.exists());
    assert!(!cfg.paths().results.exists());
    Ok(())
}

type Net = RoiDepthNet<ADBackend>;

/// Delegates to a real handle but reports a NaN loss from call `after` on.
struct NanAfter {
    inner: Box<dyn ModelHandle<ADBackend, Net>>,
    calls: Cell<usize>,
    after: usize,
}

impl ModelHandle<ADBackend, Net> for NanAfter {
    fn unwrap_module(&self) -> &Net {
        self.inner.unwrap_module()
    }

    fn replace_module(&mut self, model: Net) {
        self.inner.replace_module(model);
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn forward_backward(
        &self,
        images: Tensor<ADBackend, 4>,
        rois: Tensor<ADBackend, 2>,
        targets: &[TargetRow],
        ctx: &TrainingContext,
        loss_scale: f64,
    ) -> StepOutput {
        let call = self.calls.get();
        self.calls.set(call + 1);
        let mut out = self.inner.forward_backward(images, rois, targets, ctx, loss_scale);
        if call >= self.after {
            out.items.total = f32::NAN;
        }
        out
    }
}

#[test]
fn non_finite_loss_in_a_later_epoch_keeps_previous_results() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = synthetic_run(tmp.path())?;
    cfg.epochs = 3;
    let devices = resolve_devices("cpu")?;
    // 6 images at batch 4 is 2 iterations per epoch, so call 2 opens epoch 1
    let outcome = train_with_handle::<ADBackend, _>(
        &cfg,
        &Hyperparameters::default(),
        &devices,
        &mut NullSink,
        |model, devices| {
            Box::new(NanAfter {
                inner: default_handle::<ADBackend>(model, devices),
                calls: Cell::new(0),
                after: 2,
            })
        },
    )?;
    assert!(outcome.stopped_on_non_finite);
    assert_eq!(outcome.epochs_completed, 1);
    assert_eq!(outcome.optimizer_steps, 2);

    let paths = cfg.paths();
    let results = fs::read_to_string(&paths.results)?;
    let lines: Vec<&str> = results.lines().collect();
    assert_eq!(lines.len(), 1);
    let written: Vec<&str> = lines[0].split_whitespace().skip(9).collect();
    let reported: Vec<String> = outcome.results.iter().map(|v| format_g(*v, 3)).collect();
    assert_eq!(written, reported);
    assert_eq!(Checkpoint::load(&paths.last)?.epoch, 0);
    Ok(())
}

#[test]
fn oversized_batch_is_clamped_to_the_training_set() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = synthetic_run(tmp.path())?;
    cfg.epochs = 1;
    cfg.batch_size = 64;
    let devices = resolve_devices("cpu")?;
    let outcome = train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut NullSink)?;
    assert_eq!(outcome.batch_size, 6);
    assert_eq!(outcome.optimizer_steps, 1);
    assert_eq!(outcome.epochs_completed, 1);

    let results = fs::read_to_string(cfg.paths().results)?;
    let cols: Vec<&str> = results.lines().next().unwrap_or_default().split_whitespace().collect();
    assert_eq!(cols.len(), 16);
    // one box per image
    assert_eq!(cols[7], "6");
    Ok(())
}

#[test]
fn named_run_renames_and_strips_artifacts() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = synthetic_run(tmp.path())?;
    cfg.epochs = 1;
    cfg.name = "toy".into();
    cfg.adam = false;
    let devices = resolve_devices("cpu")?;
    let outcome = train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut NullSink)?;

    let paths = cfg.paths();
    let renamed_last = paths.weights_dir.join("last_toy.pt");
    assert!(renamed_last.is_file());
    assert!(!paths.last.exists());
    assert!(cfg.out_dir.join("results_toy.txt").is_file());
    assert!(outcome.artifacts.contains(&renamed_last));
    assert!(Checkpoint::load(&renamed_last)?.optimizer.is_none());
    Ok(())
}

#[test]
fn data_parallel_multiscale_run_completes() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = synthetic_run(tmp.path())?;
    cfg.epochs = 1;
    cfg.multi_scale = true;
    cfg.freeze_layers = true;
    cfg.image_weights = true;
    cfg.device = "0,1".into();
    let devices = resolve_devices(&cfg.device)?;
    assert_eq!(devices.len(), 2);
    let outcome = train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut NullSink)?;
    assert_eq!(outcome.epochs_completed, 1);
    assert!(cfg.paths().last.is_file());
    Ok(())
}

#[test]
fn missing_descriptor_is_reported() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = synthetic_run(tmp.path())?;
    cfg.data = tmp.path().join("nope.data");
    let devices = resolve_devices("cpu")?;
    let err = train::<ADBackend>(&cfg, &Hyperparameters::default(), &devices, &mut NullSink).unwrap_err();
    assert!(matches!(err, training::TrainError::MissingFile(p) if p == cfg.data));
    Ok(())
}
