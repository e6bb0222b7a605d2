use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("NIfTI error: {0}")]
    Nifti(String),
    #[error("Shape mismatch: {0}")]
    Shape(String),
    #[error("Statistics error: {0}")]
    Stats(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to read table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),
    #[error("Plotting failed: {0}")]
    Plot(String),
    #[error("Missing input: {}", .0.display())]
    MissingInput(PathBuf),
    #[error("External command failed: {0}")]
    Command(String),
}

pub type Result<T> = std::result::Result<T, FcError>;

impl FcError {
    pub(crate) fn plot<E: std::fmt::Display>(err: E) -> Self {
        FcError::Plot(err.to_string())
    }
}
