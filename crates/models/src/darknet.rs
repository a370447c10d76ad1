//! Reader for Darknet `.weights` files (convolutions without batch norm).
//!
//! Layout: `major, minor, revision` as i32, a `seen` counter (i64 from version
//! 0.2 on, i32 before), then little-endian f32 values. Each convolution stores
//! its bias followed by its kernel, in layer order.

use crate::detector::Detector;
use crate::params::{collect_params, overwrite_params, HostTensor};
use burn::module::Module;
use burn::tensor::backend::Backend;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DarknetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: truncated header")]
    Header { path: PathBuf },
    #[error("{path}: {name} needs {needed} values, only {available} remain")]
    Truncated {
        path: PathBuf,
        name: String,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DarknetHeader {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    pub seen: i64,
}

fn read_i32(bytes: &[u8], at: usize) -> Option<i32> {
    bytes.get(at..at + 4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn parse_darknet(path: &Path, bytes: &[u8]) -> Result<(DarknetHeader, Vec<f32>), DarknetError> {
    let header_err = || DarknetError::Header {
        path: path.to_path_buf(),
    };
    let major = read_i32(bytes, 0).ok_or_else(header_err)?;
    let minor = read_i32(bytes, 4).ok_or_else(header_err)?;
    let revision = read_i32(bytes, 8).ok_or_else(header_err)?;
    let (seen, offset) = if major * 10 + minor >= 2 {
        let b = bytes.get(12..20).ok_or_else(header_err)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        (i64::from_le_bytes(buf), 20)
    } else {
        (read_i32(bytes, 12).ok_or_else(header_err)? as i64, 16)
    };
    let values = bytes[offset..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((
        DarknetHeader {
            major,
            minor,
            revision,
            seen,
        },
        values,
    ))
}

/// Serializes convolution parameters in Darknet order. Used to export backbones and in tests.
pub fn encode_darknet(header: DarknetHeader, values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + values.len() * 4);
    out.extend_from_slice(&header.major.to_le_bytes());
    out.extend_from_slice(&header.minor.to_le_bytes());
    out.extend_from_slice(&header.revision.to_le_bytes());
    if header.major * 10 + header.minor >= 2 {
        out.extend_from_slice(&header.seen.to_le_bytes());
    } else {
        out.extend_from_slice(&(header.seen as i32).to_le_bytes());
    }
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Loads Darknet weights into the convolution layers of `model`, in layer order.
/// The file may cover only a prefix of the layers (pretrained backbones).
pub fn load_darknet_weights<B, M>(model: M, path: &Path) -> Result<(M, DarknetHeader), DarknetError>
where
    B: Backend,
    M: Module<B> + Detector<B>,
{
    let bytes = fs::read(path).map_err(|source| DarknetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (header, values) = parse_darknet(path, &bytes)?;

    let current = collect_params::<B, M>(&model);
    let named = model.named_params();
    let by_name: HashMap<&str, _> = named.iter().map(|(n, id)| (n.as_str(), *id)).collect();

    let mut cursor = 0usize;
    let mut updates = HashMap::new();
    let mut layers = 0usize;
    'layers: for (name, _) in named.iter().filter(|(n, _)| n.ends_with(".Conv2d.weight")) {
        let prefix = name.trim_end_matches(".weight");
        let bias_name = format!("{prefix}.bias");
        let mut started = false;
        for part in [bias_name.as_str(), name.as_str()] {
            let Some(id) = by_name.get(part) else {
                continue;
            };
            let Some(existing) = current.get(id) else {
                continue;
            };
            let needed = existing.values.len();
            let available = values.len() - cursor;
            if available == 0 && !started {
                break 'layers;
            }
            if available < needed {
                return Err(DarknetError::Truncated {
                    path: path.to_path_buf(),
                    name: part.to_string(),
                    needed,
                    available,
                });
            }
            updates.insert(
                *id,
                HostTensor {
                    shape: existing.shape.clone(),
                    values: values[cursor..cursor + needed].to_vec(),
                },
            );
            cursor += needed;
            started = true;
        }
        layers += 1;
    }
    let (model, report) = overwrite_params::<B, M>(model, &updates);
    info!(
        "loaded {} darknet layers ({} tensors) from {}",
        layers,
        report.applied,
        path.display()
    );
    Ok((model, header))
}
