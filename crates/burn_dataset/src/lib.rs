//! Dataset loading and Burn-compatible batching for ROI-depth detection.
//!
//! This crate provides utilities for:
//! - Indexing image directories/lists and locating YOLO-style label files
//! - Letterboxing, HSV and flip augmentation
//! - Rectangular batching and in-memory image caching
//! - Class/image weights for weighted resampling
//! - Parallel batch assembly into Burn tensors

pub mod dataset;
pub mod index;
pub mod transform;
pub mod types;
pub mod weights;

pub use dataset::{collate, Batch, BatchIter, DataLoader, DetectionDataset, LoaderConfig, TargetRow};
pub use index::{index_images, label_path_for};
pub use types::*;
pub use weights::{labels_to_class_weights, labels_to_image_weights, weighted_choices};
