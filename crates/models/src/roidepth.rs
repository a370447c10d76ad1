//! Darknet-style detector with an auxiliary depth regressor conditioned on a region of interest.

use crate::arch::ArchConfig;
use crate::detector::{Detector, DetectorOutput, HeadInfo};
use burn::module::{Ignored, Module, ParamId};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::{leaky_relu, relu};
use burn::tensor::{backend::Backend, Tensor};

#[derive(Debug, Clone)]
pub struct RoiDepthNetConfig {
    pub arch: ArchConfig,
    pub num_classes: usize,
}

#[derive(Debug, Clone)]
pub struct NetLayout {
    pub arch: ArchConfig,
    pub num_classes: usize,
}

impl NetLayout {
    /// Outputs per anchor: box (4), objectness (1), classes.
    pub fn outputs(&self) -> usize {
        5 + self.num_classes
    }

    /// Flat layer list: backbone convs, then a (head conv, YOLO output) pair per head.
    pub fn head_conv_index(&self, head: usize) -> usize {
        self.arch.backbone.len() + 2 * head
    }
}

#[derive(Debug, Module)]
pub struct RoiDepthNet<B: Backend> {
    backbone: Vec<Conv2d<B>>,
    heads: Vec<Conv2d<B>>,
    depth_fc1: Linear<B>,
    depth_fc2: Linear<B>,
    layout: Ignored<NetLayout>,
}

impl<B: Backend> RoiDepthNet<B> {
    pub fn new(cfg: RoiDepthNetConfig, device: &B::Device) -> Self {
        let arch = &cfg.arch;
        let mut backbone = Vec::with_capacity(arch.backbone.len());
        let mut in_ch = arch.channels;
        for spec in &arch.backbone {
            let pad = spec.size / 2;
            let conv = Conv2dConfig::new([in_ch, spec.filters], [spec.size, spec.size])
                .with_stride([spec.stride, spec.stride])
                .with_padding(PaddingConfig2d::Explicit(pad, pad))
                .init(device);
            backbone.push(conv);
            in_ch = spec.filters;
        }
        let outputs = 5 + cfg.num_classes;
        let heads = arch
            .heads
            .iter()
            .map(|h| {
                let feat = arch.backbone[h.from].filters;
                Conv2dConfig::new([feat, h.anchors.len() * outputs], [1, 1]).init(device)
            })
            .collect();
        let last = arch.backbone.last().map(|c| c.filters).unwrap_or(arch.channels);
        let depth_fc1 = LinearConfig::new(last + 4, arch.depth_hidden).init(device);
        let depth_fc2 = LinearConfig::new(arch.depth_hidden, 1).init(device);
        Self {
            backbone,
            heads,
            depth_fc1,
            depth_fc2,
            layout: Ignored(NetLayout {
                arch: cfg.arch,
                num_classes: cfg.num_classes,
            }),
        }
    }

    pub fn layout(&self) -> &NetLayout {
        &self.layout.0
    }

    /// Stops gradients for every layer except the head convolutions and the
    /// layer following each of them. The depth regressor stays trainable.
    pub fn freeze_non_output(mut self) -> Self {
        let layout = self.layout.0.clone();
        let outputs: Vec<usize> = (0..layout.arch.heads.len())
            .map(|j| layout.head_conv_index(j))
            .collect();
        let keep = |x: usize| outputs.contains(&x) || (x > 0 && outputs.contains(&(x - 1)));
        self.backbone = self
            .backbone
            .into_iter()
            .enumerate()
            .map(|(i, conv)| if keep(i) { conv } else { conv.no_grad() })
            .collect();
        self
    }
}

impl<B: Backend> Detector<B> for RoiDepthNet<B> {
    fn forward_detect(&self, images: Tensor<B, 4>, rois: Tensor<B, 2>) -> DetectorOutput<B> {
        let layout = &self.layout.0;
        let mut feats = Vec::with_capacity(self.backbone.len());
        let mut x = images;
        for conv in &self.backbone {
            x = leaky_relu(conv.forward(x), 0.1);
            feats.push(x.clone());
        }
        let no = layout.outputs();
        let heads = self
            .heads
            .iter()
            .zip(&layout.arch.heads)
            .map(|(conv, spec)| {
                let p = conv.forward(feats[spec.from].clone());
                let [b, _, gh, gw] = p.dims();
                p.reshape([b, spec.anchors.len(), no, gh, gw])
                    .permute([0, 1, 3, 4, 2])
            })
            .collect();

        let [b, c, _, _] = x.dims();
        let pooled = x.mean_dim(3).mean_dim(2).reshape([b, c]);
        let z = Tensor::cat(vec![pooled, rois], 1);
        let depth = self.depth_fc2.forward(relu(self.depth_fc1.forward(z)));
        DetectorOutput { heads, depth }
    }

    fn head_info(&self) -> Vec<HeadInfo> {
        let arch = &self.layout.0.arch;
        arch.heads
            .iter()
            .map(|h| HeadInfo {
                stride: arch.stride_at(h.from),
                anchors: h.anchors.clone(),
            })
            .collect()
    }

    fn num_classes(&self) -> usize {
        self.layout.0.num_classes
    }

    fn yolo_layers(&self) -> Vec<usize> {
        let layout = &self.layout.0;
        (0..layout.arch.heads.len())
            .map(|j| layout.head_conv_index(j) + 1)
            .collect()
    }

    fn grid_size(&self) -> usize {
        self.layout.0.arch.grid_size()
    }

    fn named_params(&self) -> Vec<(String, ParamId)> {
        let mut out = Vec::new();
        let mut push_conv = |idx: usize, conv: &Conv2d<B>| {
            out.push((format!("module_list.{idx}.Conv2d.weight"), conv.weight.id));
            if let Some(bias) = &conv.bias {
                out.push((format!("module_list.{idx}.Conv2d.bias"), bias.id));
            }
        };
        for (i, conv) in self.backbone.iter().enumerate() {
            push_conv(i, conv);
        }
        for (j, conv) in self.heads.iter().enumerate() {
            push_conv(self.layout.0.head_conv_index(j), conv);
        }
        for (name, fc) in [("fc1", &self.depth_fc1), ("fc2", &self.depth_fc2)] {
            out.push((format!("depth_head.{name}.weight"), fc.weight.id));
            if let Some(bias) = &fc.bias {
                out.push((format!("depth_head.{name}.bias"), bias.id));
            }
        }
        out
    }
}
