//! Architecture descriptor: a TOML file listing backbone convolutions and the
//! layers that feed each YOLO head.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid architecture: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub filters: usize,
    #[serde(default = "default_kernel")]
    pub size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
}

fn default_kernel() -> usize {
    3
}

fn default_stride() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadSpec {
    /// Backbone layer whose output feeds this head.
    pub from: usize,
    /// Anchor (width, height) pairs in input pixels.
    pub anchors: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchConfig {
    #[serde(default = "default_channels")]
    pub channels: usize,
    pub backbone: Vec<ConvSpec>,
    pub heads: Vec<HeadSpec>,
    #[serde(default = "default_depth_hidden")]
    pub depth_hidden: usize,
}

fn default_channels() -> usize {
    3
}

fn default_depth_hidden() -> usize {
    64
}

impl Default for ArchConfig {
    /// Five stride-2 stages (grid 32) with heads at strides 16 and 32.
    fn default() -> Self {
        let conv = |filters| ConvSpec {
            filters,
            size: 3,
            stride: 2,
        };
        Self {
            channels: 3,
            backbone: vec![conv(8), conv(16), conv(16), conv(32), conv(32)],
            heads: vec![
                HeadSpec {
                    from: 4,
                    anchors: vec![[81.0, 82.0], [135.0, 169.0], [344.0, 319.0]],
                },
                HeadSpec {
                    from: 3,
                    anchors: vec![[10.0, 14.0], [23.0, 27.0], [37.0, 58.0]],
                },
            ],
            depth_hidden: 32,
        }
    }
}

impl ArchConfig {
    pub fn load(path: &Path) -> Result<Self, ArchError> {
        let text = fs::read_to_string(path).map_err(|source| ArchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ArchConfig = toml::from_str(&text).map_err(|source| ArchError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ArchError> {
        if self.backbone.is_empty() {
            return Err(ArchError::Invalid("backbone has no layers".into()));
        }
        if self.heads.is_empty() {
            return Err(ArchError::Invalid("no detection heads".into()));
        }
        for (i, c) in self.backbone.iter().enumerate() {
            if c.filters == 0 || c.stride == 0 || c.size % 2 == 0 {
                return Err(ArchError::Invalid(format!(
                    "backbone layer {i}: filters and stride must be positive and size odd ({c:?})"
                )));
            }
        }
        for (j, h) in self.heads.iter().enumerate() {
            if h.from >= self.backbone.len() {
                return Err(ArchError::Invalid(format!(
                    "head {j} reads layer {} but the backbone has {} layers",
                    h.from,
                    self.backbone.len()
                )));
            }
            if h.anchors.is_empty() {
                return Err(ArchError::Invalid(format!("head {j} has no anchors")));
            }
        }
        if self.channels == 0 || self.depth_hidden == 0 {
            return Err(ArchError::Invalid("channels and depth_hidden must be positive".into()));
        }
        Ok(())
    }

    /// Cumulative stride at the output of backbone layer `layer`.
    pub fn stride_at(&self, layer: usize) -> usize {
        self.backbone[..=layer].iter().map(|c| c.stride).product()
    }

    /// Total downsampling of the network; input sides must be multiples of it.
    pub fn grid_size(&self) -> usize {
        self.heads
            .iter()
            .map(|h| self.stride_at(h.from))
            .max()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grid_is_32() {
        let cfg = ArchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.grid_size(), 32);
        assert_eq!(cfg.stride_at(3), 16);
    }

    #[test]
    fn parses_toml_with_defaults() {
        let text = r#"
            [[backbone]]
            filters = 4
            stride = 2

            [[heads]]
            from = 0
            anchors = [[8.0, 8.0]]
        "#;
        let cfg: ArchConfig = toml::from_str(text).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.backbone[0].size, 3);
        assert_eq!(cfg.channels, 3);
        assert_eq!(cfg.grid_size(), 2);
    }

    #[test]
    fn head_out_of_range_rejected() {
        let mut cfg = ArchConfig::default();
        cfg.heads[0].from = 9;
        assert!(matches!(cfg.validate(), Err(ArchError::Invalid(_))));
    }
}
