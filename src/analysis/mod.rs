//! Group-level analysis stages
//!
//! - `second_level`: parametric GLM with FPR/FDR thresholding and the
//!   two-pass within-group masking
//! - `non_parametric`: permutation inference and within-group masks
//! - `randomise`: FSL randomise inputs, command line and output figures
//! - `voi`: stimulation VOI connectivity, ALFF reports and figures
//! - `pipeline`: the `analyze` stage sequence

pub mod non_parametric;
pub mod pipeline;
pub mod randomise;
pub mod second_level;
pub mod voi;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::Serialize;

use crate::error::Result;
use crate::stats::design::DesignOptions;
use crate::study::{GroupTable, Layout};

pub use non_parametric::{
    compute_fc_within_masks, non_parametric_analysis, run_non_parametric, NonParametricResult, NonParametricResults,
};
pub use pipeline::{run_analysis, Stages};
pub use randomise::{plot_randomise_outputs, prep_fsl_randomise, use_randomise};
pub use second_level::{mask_imgs, plot_within_group_masks, run_second_level, SecondLevelOutput};
pub use voi::{compute_voi_corr, plot_alff, plot_voi_corr, print_alff_stats, print_voi_stats, VoiCorrRecord};

/// Template masks that restrict the group-level search space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskFlags {
    pub gm: bool,
    pub fspt: bool,
    pub cortical: bool,
    pub frontal: bool,
    pub seed_specific: bool,
}

/// Switches and thresholds of the group-level stages
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    pub masks: MaskFlags,
    pub design: DesignOptions,
    pub fdr_threshold: f64,
    pub fpr_threshold: f64,
    pub within_group_threshold: f64,
    pub use_within_group_mask: bool,
    pub use_spm_mask: bool,
    pub two_sided_within_group: bool,
    pub two_sided_between_group: bool,
    pub n_perm: usize,
    pub n_jobs: usize,
    pub cluster_thresh: f64,
    pub use_tfce: bool,
    pub min_time_after_scrubbing: Option<f64>,
    pub stim_radius: f64,
    pub save_outputs: bool,
    pub save_figs: bool,
    pub plot_figs: bool,
    /// Log external commands instead of running them
    pub dry_run: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            masks: MaskFlags::default(),
            design: DesignOptions::default(),
            fdr_threshold: 0.05,
            fpr_threshold: 0.001,
            within_group_threshold: 0.005,
            use_within_group_mask: false,
            use_spm_mask: false,
            two_sided_within_group: false,
            two_sided_between_group: false,
            n_perm: 5000,
            n_jobs: 10,
            cluster_thresh: 4.0,
            use_tfce: false,
            min_time_after_scrubbing: None,
            stim_radius: 5.0,
            save_outputs: false,
            save_figs: false,
            plot_figs: false,
            dry_run: false,
        }
    }
}

impl AnalysisOptions {
    /// Figures are written when either figure switch is on
    pub fn figures(&self) -> bool {
        self.plot_figs || self.save_figs
    }
}

/// Everything a stage needs: layout, options and the selected subjects
#[derive(Debug, Clone)]
pub struct AnalysisContext<'a> {
    pub layout: Layout<'a>,
    pub opts: AnalysisOptions,
    pub groups: GroupTable,
    pub subjs: Vec<String>,
    /// Subjects removed by the scrubbing filter
    pub revoked: Vec<String>,
}

impl<'a> AnalysisContext<'a> {
    pub fn figure_path(&self, name: &str) -> PathBuf {
        self.layout.figure_dir().join(name)
    }
}

/// Write `value` as gzipped JSON
pub fn write_json_gz<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Write serializable rows as a CSV table with a header
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Saved {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Read gzipped JSON written by [`write_json_gz`]
pub fn read_json_gz(path: &Path) -> Result<serde_json::Value> {
    let decoder = flate2::read::GzDecoder::new(File::open(path)?);
    Ok(serde_json::from_reader(decoder)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_gz_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("summary.json.gz");
        write_json_gz(&path, &serde_json::json!({"seed": "Acc", "n_voxels": 12})).unwrap();
        let back = read_json_gz(&path).unwrap();
        assert_eq!(back["seed"], "Acc");
        assert_eq!(back["n_voxels"], 12);
    }

    #[test]
    fn test_figures_switch() {
        let opts = AnalysisOptions::default();
        assert!(!opts.figures());
        assert!(AnalysisOptions { save_figs: true, ..opts }.figures());
    }
}
