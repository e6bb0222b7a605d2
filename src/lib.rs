//! seedfc: seed-to-voxel functional connectivity for a longitudinal
//! stimulation trial
//!
//! # Modules
//! - `nifti_io`, `volume`: NIfTI reading/writing and 3D/4D images in world space
//! - `fft`, `signal`: band-pass filtering, cleaning and Welch spectra
//! - `utils`: masks, smoothing and connected components
//! - `connectivity`: maskers, seed-to-voxel maps and ALFF
//! - `study`: file layout, groups and subject selection
//! - `stats`: designs, GLM, thresholds, clusters, permutations and tests
//! - `analysis`: group-level stages of `seedfc analyze`
//! - `plot`, `surface`: stat maps, charts and surface rendering
//! - `cli`: command line parsing and dispatch

pub mod error;
pub mod config;
pub mod progress;

// Images
pub mod nifti_io;
pub mod volume;

// Signal processing
pub mod fft;
pub mod signal;
pub mod utils;

// Connectivity and statistics
pub mod connectivity;
pub mod study;
pub mod stats;
pub mod analysis;

// Figures
pub mod plot;
pub mod surface;

pub mod cli;

pub use error::{FcError, Result};
