//! Voxel-level utilities shared by the connectivity and statistics code
//!
//! - `mask`: sphere, label and background masks; binarize, intersect, apply
//! - `smoothing`: Gaussian smoothing by FWHM in mm
//! - `labels`: connected components and cluster-extent filtering

pub mod labels;
pub mod mask;
pub mod smoothing;

pub use labels::{cluster_size_filter, label_components};
pub use mask::{apply_mask, background_mask, binarize, create_sphere_mask, intersect_masks, label_mask, resample_masks};
pub use smoothing::{smooth_series, smooth_volume};
