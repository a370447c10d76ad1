use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: missing required key `{key}`")]
    MissingKey { path: PathBuf, key: &'static str },
    #[error("{path}: line {line} is not `key=value`")]
    Malformed { path: PathBuf, line: usize },
    #[error("{path}: `classes` must be a positive integer, got {value:?}")]
    BadClassCount { path: PathBuf, value: String },
}

/// Dataset descriptor: a `key=value` file naming the class count and the
/// train/valid image sources. Relative paths resolve against the descriptor's directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub classes: usize,
    pub train: PathBuf,
    pub valid: PathBuf,
    pub names: Option<PathBuf>,
}

impl DatasetDescriptor {
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let text = fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, path, base)
    }

    pub fn parse(text: &str, origin: &Path, base: &Path) -> Result<Self, DescriptorError> {
        let mut classes = None;
        let mut train = None;
        let mut valid = None;
        let mut names = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(DescriptorError::Malformed {
                    path: origin.to_path_buf(),
                    line: idx + 1,
                });
            };
            let value = value.trim();
            match key.trim() {
                "classes" => {
                    let n = value.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                        DescriptorError::BadClassCount {
                            path: origin.to_path_buf(),
                            value: value.to_string(),
                        }
                    })?;
                    classes = Some(n);
                }
                "train" => train = Some(resolve(base, value)),
                "valid" => valid = Some(resolve(base, value)),
                "names" => names = Some(resolve(base, value)),
                // backup, eval and similar keys are accepted and ignored
                _ => {}
            }
        }
        let missing = |key| DescriptorError::MissingKey {
            path: origin.to_path_buf(),
            key,
        };
        Ok(Self {
            classes: classes.ok_or_else(|| missing("classes"))?,
            train: train.ok_or_else(|| missing("train"))?,
            valid: valid.ok_or_else(|| missing("valid"))?,
            names,
        })
    }

    /// Class names from the `names` file, falling back to the class index.
    pub fn class_names(&self) -> Vec<String> {
        let from_file = self
            .names
            .as_ref()
            .and_then(|p| fs::read_to_string(p).ok())
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|names| names.len() == self.classes);
        from_file.unwrap_or_else(|| (0..self.classes).map(|i| i.to_string()).collect())
    }
}

fn resolve(base: &Path, value: &str) -> PathBuf {
    let p = PathBuf::from(value);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}
