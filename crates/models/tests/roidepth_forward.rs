use burn::backend::{ndarray::NdArray, Autodiff};
use burn::module::{Module, ModuleVisitor, ParamId};
use burn::tensor::{backend::Backend, Tensor};
use models::darknet::{encode_darknet, load_darknet_weights, DarknetHeader};
use models::{collect_params, ArchConfig, Detector, RoiDepthNet, RoiDepthNetConfig};
use std::collections::HashMap;

type ADBackend = Autodiff<NdArray<f32>>;

fn net<B: Backend>(nc: usize) -> RoiDepthNet<B> {
    let device = B::Device::default();
    RoiDepthNet::new(
        RoiDepthNetConfig {
            arch: ArchConfig::default(),
            num_classes: nc,
        },
        &device,
    )
}

#[test]
fn head_shapes_follow_strides() {
    let model = net::<NdArray<f32>>(3);
    let device = Default::default();
    let images = Tensor::<NdArray<f32>, 4>::zeros([2, 3, 64, 96], &device);
    let rois = Tensor::<NdArray<f32>, 2>::ones([2, 4], &device);
    let out = model.forward_detect(images, rois);
    assert_eq!(out.heads.len(), 2);
    assert_eq!(out.heads[0].dims(), [2, 3, 2, 3, 8]);
    assert_eq!(out.heads[1].dims(), [2, 3, 4, 6, 8]);
    assert_eq!(out.depth.dims(), [2, 1]);
    let info = model.head_info();
    assert_eq!(info[0].stride, 32);
    assert_eq!(info[1].stride, 16);
    assert_eq!(model.yolo_layers(), vec![6, 8]);
}

#[test]
fn parameter_names_are_unique_and_cover_the_model() {
    let model = net::<NdArray<f32>>(1);
    let named = model.named_params();
    let params = collect_params(&model);
    assert_eq!(named.len(), params.len());
    let names: std::collections::HashSet<_> = named.iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names.len(), named.len());
    assert!(names.contains("module_list.0.Conv2d.weight"));
    assert!(names.contains("module_list.5.Conv2d.bias"));
    assert!(names.contains("depth_head.fc2.weight"));
}

struct GradFlags(HashMap<ParamId, bool>);

impl<B: Backend> ModuleVisitor<B> for GradFlags {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.0.insert(id, tensor.is_require_grad());
    }
}

#[test]
fn freezing_keeps_heads_and_depth_trainable() {
    let model = net::<ADBackend>(2).freeze_non_output();
    let mut flags = GradFlags(HashMap::new());
    model.visit(&mut flags);
    for (name, id) in model.named_params() {
        let trainable = flags.0[&id];
        let backbone = ["module_list.0.", "module_list.1.", "module_list.2.", "module_list.3.", "module_list.4."]
            .iter()
            .any(|p| name.starts_with(p));
        assert_eq!(trainable, !backbone, "{name}");
    }
}

#[test]
fn darknet_weights_round_trip() {
    let source = net::<NdArray<f32>>(2);
    let params = collect_params(&source);
    let by_name: HashMap<String, ParamId> = source.named_params().into_iter().collect();
    let mut values = Vec::new();
    for (name, _) in source
        .named_params()
        .iter()
        .filter(|(n, _)| n.ends_with(".Conv2d.weight"))
    {
        let bias = name.replace(".weight", ".bias");
        values.extend_from_slice(&params[&by_name[&bias]].values);
        values.extend_from_slice(&params[&by_name[name]].values);
    }
    let header = DarknetHeader {
        major: 0,
        minor: 2,
        revision: 5,
        seen: 32_013_312,
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("net.weights");
    std::fs::write(&path, encode_darknet(header, &values)).unwrap();

    let target = net::<NdArray<f32>>(2);
    let (loaded, read_header) = load_darknet_weights(target, &path).unwrap();
    assert_eq!(read_header, header);
    let loaded_params = collect_params(&loaded);
    let loaded_names: HashMap<String, ParamId> = loaded.named_params().into_iter().collect();
    for (name, id) in &by_name {
        if name.contains("Conv2d") {
            assert_eq!(params[id].values, loaded_params[&loaded_names[name]].values, "{name}");
        }
    }
}

#[test]
fn truncated_darknet_file_loads_a_prefix() {
    let source = net::<NdArray<f32>>(1);
    let params = collect_params(&source);
    let by_name: HashMap<String, ParamId> = source.named_params().into_iter().collect();
    let mut values = params[&by_name["module_list.0.Conv2d.bias"]].values.clone();
    values.extend_from_slice(&params[&by_name["module_list.0.Conv2d.weight"]].values);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backbone.weights");
    let header = DarknetHeader {
        major: 0,
        minor: 1,
        revision: 0,
        seen: 0,
    };
    std::fs::write(&path, encode_darknet(header, &values)).unwrap();
    let (loaded, _) = load_darknet_weights(net::<NdArray<f32>>(1), &path).unwrap();
    let loaded_params = collect_params(&loaded);
    let names: HashMap<String, ParamId> = loaded.named_params().into_iter().collect();
    assert_eq!(
        loaded_params[&names["module_list.0.Conv2d.weight"]].values,
        params[&by_name["module_list.0.Conv2d.weight"]].values
    );
}
