use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("file not found: {0}")]
    MissingFile(PathBuf),
    #[error("image size {size} is not a multiple of grid size {grid}")]
    GridAlignment { size: u32, grid: u32 },
    #[error("{weights} is not compatible with {cfg}: {reason}")]
    IncompatibleWeights {
        weights: PathBuf,
        cfg: PathBuf,
        reason: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encoding error at {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
    #[error("config parse error at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Dataset(#[from] burn_dataset::BurnDatasetError),
    #[error(transparent)]
    Descriptor(#[from] data_contracts::DescriptorError),
    #[error(transparent)]
    Arch(#[from] models::ArchError),
    #[error(transparent)]
    Darknet(#[from] models::DarknetError),
    #[error("{0}")]
    Other(String),
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> TrainError {
        let path = path.into();
        move |source| TrainError::Io { path, source }
    }
}
