use crate::config::TrainingConfig;
use crate::hyp::Hyperparameters;
use crate::sink::JsonlSink;
use crate::trainer::train;
use crate::{resolve_devices, TrainBackend};
use burn::backend::Autodiff;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug, Default)]
#[command(name = "train", about = "Train the ROI-depth detector")]
pub struct TrainArgs {
    /// Full run configuration (TOML); command-line options override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Hyperparameter overrides (TOML).
    #[arg(long)]
    pub hyp: Option<PathBuf>,
    /// Number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Architecture descriptor.
    #[arg(long)]
    pub cfg: Option<PathBuf>,
    /// Dataset descriptor.
    #[arg(long)]
    pub data: Option<PathBuf>,
    /// Train/test image sizes: `[min, max, test]`.
    #[arg(long, num_args = 1..=3)]
    pub img_size: Option<Vec<u32>>,
    /// Initial weights: empty, a `.pt` checkpoint or Darknet `.weights`.
    #[arg(long)]
    pub weights: Option<String>,
    /// `cpu` or comma-separated device ordinals.
    #[arg(long)]
    pub device: Option<String>,
    /// Suffix for the final artifacts.
    #[arg(long)]
    pub name: Option<String>,
    /// Output directory for weights, results and previews.
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub conf_thres: Option<f32>,
    #[arg(long)]
    pub iou_thres: Option<f32>,
    /// Vary the training size between the bounds.
    #[arg(long)]
    pub multi_scale: bool,
    /// Rectangular training batches.
    #[arg(long)]
    pub rect: bool,
    /// Keep resized images in memory.
    #[arg(long)]
    pub cache_images: bool,
    /// Use Adam (the default unless the config file says otherwise).
    #[arg(long, conflicts_with = "sgd")]
    pub adam: bool,
    /// Use SGD with Nesterov momentum instead of Adam.
    #[arg(long)]
    pub sgd: bool,
    /// Train as a single-class detector.
    #[arg(long)]
    pub single_cls: bool,
    /// Freeze everything except the YOLO outputs.
    #[arg(long)]
    pub freeze_layers: bool,
    /// Resample images by class rarity every epoch.
    #[arg(long)]
    pub image_weights: bool,
    /// Only evaluate after the final epoch.
    #[arg(long)]
    pub notest: bool,
}

impl TrainArgs {
    /// Layers explicit options over the config file (or defaults).
    pub fn to_config(&self) -> anyhow::Result<TrainingConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(v) = self.epochs {
            cfg.epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = &self.cfg {
            cfg.cfg = v.clone();
        }
        if let Some(v) = &self.data {
            cfg.data = v.clone();
        }
        if let Some(v) = &self.img_size {
            cfg.img_size = v.clone();
        }
        if let Some(v) = &self.weights {
            cfg.weights = v.clone();
        }
        if let Some(v) = &self.device {
            cfg.device = v.clone();
        }
        if let Some(v) = &self.name {
            cfg.name = v.clone();
        }
        if let Some(v) = &self.out_dir {
            cfg.out_dir = v.clone();
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.conf_thres {
            cfg.conf_thres = v;
        }
        if let Some(v) = self.iou_thres {
            cfg.iou_thres = v;
        }
        cfg.multi_scale |= self.multi_scale;
        cfg.rect |= self.rect;
        cfg.cache_images |= self.cache_images;
        if self.adam {
            cfg.adam = true;
        }
        if self.sgd {
            cfg.adam = false;
        }
        cfg.single_cls |= self.single_cls;
        cfg.freeze_layers |= self.freeze_layers;
        cfg.image_weights |= self.image_weights;
        cfg.notest |= self.notest;
        Ok(cfg)
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = args.to_config()?;
    let hyp = match &args.hyp {
        Some(path) => Hyperparameters::load(path)?,
        None => Hyperparameters::default(),
    };
    info!("{cfg:?}");
    info!("{hyp:?}");
    let devices = resolve_devices(&cfg.device)?;
    let mut sink = JsonlSink::create(&cfg.paths().runs_dir)?;
    let outcome = train::<Autodiff<TrainBackend>>(&cfg, &hyp, &devices, &mut sink)?;
    if outcome.stopped_on_non_finite {
        anyhow::bail!(
            "training stopped on a non-finite loss after {} epochs",
            outcome.epochs_completed
        );
    }
    info!(
        "finished {} epochs; best fitness {:.4}; P {:.3} R {:.3} mAP {:.3} F1 {:.3}",
        outcome.epochs_completed,
        outcome.best_fitness,
        outcome.results[0],
        outcome.results[1],
        outcome.results[2],
        outcome.results[3]
    );
    for path in &outcome.artifacts {
        info!("wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_defaults() {
        let args = TrainArgs::parse_from([
            "train",
            "--epochs",
            "2",
            "--img-size",
            "128",
            "256",
            "--rect",
            "--name",
            "run1",
        ]);
        let cfg = args.to_config().unwrap();
        assert_eq!(cfg.epochs, 2);
        assert_eq!(cfg.img_size, vec![128, 256]);
        assert!(cfg.rect);
        assert!(cfg.adam);
        assert_eq!(cfg.name, "run1");
        assert_eq!(cfg.batch_size, TrainingConfig::default().batch_size);
    }

    #[test]
    fn optimizer_flags_select_the_optimizer() {
        assert!(!TrainArgs::parse_from(["train", "--sgd"]).to_config().unwrap().adam);
        assert!(TrainArgs::parse_from(["train", "--adam"]).to_config().unwrap().adam);
        assert!(TrainArgs::try_parse_from(["train", "--adam", "--sgd"]).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "adam = false\n").unwrap();
        let from_file = TrainArgs::parse_from(["train", "--config", path.to_str().unwrap()]);
        assert!(!from_file.to_config().unwrap().adam);
        let overridden =
            TrainArgs::parse_from(["train", "--config", path.to_str().unwrap(), "--adam"]);
        assert!(overridden.to_config().unwrap().adam);
    }

    #[test]
    fn config_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "epochs = 9\nbatch_size = 4\nweights = \"\"\n").unwrap();
        let args = TrainArgs::parse_from([
            "train",
            "--config",
            path.to_str().unwrap(),
            "--batch-size",
            "8",
        ]);
        let cfg = args.to_config().unwrap();
        assert_eq!((cfg.epochs, cfg.batch_size), (9, 8));
        assert!(cfg.weights.is_empty());
    }
}
