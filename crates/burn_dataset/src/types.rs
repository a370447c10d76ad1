//! Error definitions and the per-sample record produced by the loader.

use data_contracts::labels::{LabelParseError, ObjectLabel};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, BurnDatasetError>;

#[derive(Debug, Error)]
pub enum BurnDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("label error at {path}: {source}")]
    Label {
        path: PathBuf,
        #[source]
        source: LabelParseError,
    },
    #[error("label validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no images found under {path}")]
    Empty { path: PathBuf },
    #[error("{0}")]
    Other(String),
}

/// One letterboxed image with labels re-expressed in its final pixel frame.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    pub image: image::RgbImage,
    /// Normalized to the letterboxed image.
    pub objects: Vec<ObjectLabel>,
    /// Normalized [x0, y0, x1, y1] in the letterboxed image.
    pub roi: [f32; 4],
}
