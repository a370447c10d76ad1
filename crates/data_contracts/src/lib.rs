//! Shared data contracts for ROI-depth detection datasets: per-image label
//! files and the `.data` dataset descriptor.

pub mod descriptor;
pub mod labels;

pub use descriptor::{DatasetDescriptor, DescriptorError};
pub use labels::{ImageLabels, LabelParseError, ObjectLabel, ValidationError, FULL_FRAME_ROI};
