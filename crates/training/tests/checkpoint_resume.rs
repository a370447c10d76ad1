use burn::backend::{ndarray::NdArray, Autodiff};
use burn::tensor::backend::Backend;
use models::{ArchConfig, Detector, RoiDepthNet, RoiDepthNetConfig};
use std::fs;
use std::path::Path;
use training::checkpoint::{resume, Checkpoint};
use training::optim::{GroupSettings, GroupedOptimizer, OptimizerKind, OptimizerState};
use training::param_groups::{ParamGroup, ParamGroups};
use training::state_dict::{NamedTensor, StateDict};
use training::TrainError;

type Inner = NdArray<f32>;
type ADBackend = Autodiff<NdArray<f32>>;

fn net<B: Backend>(nc: usize) -> RoiDepthNet<B> {
    RoiDepthNet::new(
        RoiDepthNetConfig {
            arch: ArchConfig::default(),
            num_classes: nc,
        },
        &B::Device::default(),
    )
}

fn optimizer_state(lr: f64) -> OptimizerState {
    let group = |weight_decay| GroupSettings {
        lr,
        initial_lr: 0.01,
        momentum: 0.9,
        weight_decay,
    };
    OptimizerState {
        kind: OptimizerKind::adam(),
        groups: vec![group(0.0), group(0.0005), group(0.0)],
        params: Vec::new(),
    }
}

fn checkpoint_of(model: &RoiDepthNet<Inner>, optimizer: Option<OptimizerState>) -> Checkpoint {
    Checkpoint {
        epoch: 4,
        best_fitness: 0.3,
        training_results: Some("     4/4 results\n".to_string()),
        model: StateDict::from_module::<Inner, _>(model),
        optimizer,
    }
}

fn resume_into(
    model: RoiDepthNet<Inner>,
    weights: &Path,
    epochs: usize,
    results: &Path,
) -> Result<(RoiDepthNet<Inner>, training::ResumeState), TrainError> {
    resume::<Inner, RoiDepthNet<Inner>>(model, weights, Path::new("arch.toml"), epochs, results)
}

#[test]
fn resume_restores_weights_optimizer_and_extends_epochs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("last.pt");
    let results = dir.path().join("results.txt");
    let trained = net::<Inner>(3);
    let saved = checkpoint_of(&trained, Some(optimizer_state(0.004)));
    saved.save(&weights)?;

    let (model, state) = resume_into(net::<Inner>(3), &weights, 3, &results)?;
    assert_eq!(StateDict::from_module::<Inner, _>(&model), saved.model);
    assert_eq!(state.start_epoch, 5);
    assert_eq!(state.epochs, 7);
    assert_eq!(state.best_fitness, 0.3);
    assert_eq!(fs::read_to_string(&results)?, "     4/4 results\n");

    let restored = state.optimizer.as_ref().expect("optimizer state restored");
    let live = net::<ADBackend>(3);
    let groups = ParamGroups::from_named(live.named_params());
    let mut optim = GroupedOptimizer::<ADBackend>::new(OptimizerKind::adam(), groups, 0.01, 0.9, 0.0005);
    optim.load_state(restored, &Default::default());
    assert_eq!(optim.group(ParamGroup::Other).lr, 0.004);
    assert_eq!(optim.group(ParamGroup::ConvWeight).weight_decay, 0.0005);
    Ok(())
}

#[test]
fn resume_keeps_requested_epochs_beyond_the_saved_one() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("last.pt");
    checkpoint_of(&net::<Inner>(2), None).save(&weights)?;

    let (_, state) = resume_into(net::<Inner>(2), &weights, 10, &dir.path().join("results.txt"))?;
    assert_eq!(state.start_epoch, 5);
    assert_eq!(state.epochs, 10);
    Ok(())
}

#[test]
fn checkpoint_without_optimizer_leaves_best_fitness_unset() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("best.pt");
    checkpoint_of(&net::<Inner>(2), None).save(&weights)?;

    let (_, state) = resume_into(net::<Inner>(2), &weights, 3, &dir.path().join("results.txt"))?;
    assert_eq!(state.best_fitness, 0.0);
    assert!(state.optimizer.is_none());
    Ok(())
}

#[test]
fn mismatched_head_shapes_are_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("last.pt");
    let saved = checkpoint_of(&net::<Inner>(3), None);
    saved.save(&weights)?;

    let target = net::<Inner>(5);
    let before = StateDict::from_module::<Inner, _>(&target);
    let (model, _) = resume_into(target, &weights, 3, &dir.path().join("results.txt"))?;
    let after = StateDict::from_module::<Inner, _>(&model);

    let mut skipped = 0;
    for tensor in &after.tensors {
        let from_ckpt = saved.model.get(&tensor.name).expect("name in checkpoint");
        if from_ckpt.shape == tensor.shape {
            assert_eq!(tensor.values, from_ckpt.values, "{}", tensor.name);
        } else {
            skipped += 1;
            let own = before.get(&tensor.name).expect("name in model");
            assert_eq!(tensor.values, own.values, "{}", tensor.name);
        }
    }
    // weight and bias of both head convolutions
    assert_eq!(skipped, 4);
    Ok(())
}

#[test]
fn unknown_tensor_names_are_incompatible() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let weights = dir.path().join("last.pt");
    let mut saved = checkpoint_of(&net::<Inner>(3), None);
    saved.model.tensors.push(NamedTensor {
        name: "bogus".to_string(),
        shape: vec![1],
        values: vec![0.0],
    });
    saved.save(&weights)?;

    let err = resume_into(net::<Inner>(3), &weights, 3, &dir.path().join("results.txt"))
        .err()
        .expect("unknown name rejected");
    match err {
        TrainError::IncompatibleWeights { reason, .. } => assert!(reason.contains("bogus")),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}
