//! Height and extent thresholding of statistical maps

use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::error::{FcError, Result};
use crate::stats::dist::{norm_isf, norm_sf};
use crate::utils::labels::cluster_size_filter;
use crate::volume::Volume;

/// Voxel-level error control used to pick the z threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightControl {
    Fpr,
    Fdr,
    Bonferroni,
}

impl fmt::Display for HeightControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeightControl::Fpr => "fpr",
            HeightControl::Fdr => "fdr",
            HeightControl::Bonferroni => "bonferroni",
        };
        f.write_str(name)
    }
}

impl FromStr for HeightControl {
    type Err = FcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fpr" => Ok(HeightControl::Fpr),
            "fdr" => Ok(HeightControl::Fdr),
            "bonferroni" => Ok(HeightControl::Bonferroni),
            other => Err(FcError::Config(format!("unknown height control '{}'", other))),
        }
    }
}

/// Smallest z such that the Benjamini-Hochberg procedure rejects every
/// value above it, or infinity when nothing survives
pub fn fdr_threshold(z_vals: &[f64], alpha: f64) -> Result<f64> {
    if !(0.0..1.0).contains(&alpha) {
        return Err(FcError::Stats(format!("alpha should be between 0 and 1, got {}", alpha)));
    }
    let mut sorted: Vec<f64> = z_vals.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let n = sorted.len();
    let mut last = None;
    for (i, &z) in sorted.iter().enumerate() {
        if norm_sf(z) < alpha * (i + 1) as f64 / n as f64 {
            last = Some(z);
        }
    }
    Ok(last.map_or(f64::INFINITY, |z| z - 1e-12))
}

/// Threshold a z map
///
/// Only voxels inside `mask` (or, without a mask, the non-zero voxels of
/// `z_map`) take part in FDR and Bonferroni. Two-sided thresholding keeps
/// `|z| > thr` and, for FDR, works on `|z|`.
///
/// # Returns
/// The thresholded map with clusters of `cluster_threshold` voxels or fewer
/// removed, and the z threshold.
pub fn threshold_stats_img(
    z_map: &Volume,
    mask: Option<&Volume>,
    alpha: f64,
    height_control: HeightControl,
    cluster_threshold: usize,
    two_sided: bool,
) -> Result<(Volume, f64)> {
    let in_mask: Vec<bool> = match mask {
        Some(m) => {
            let m = m.resample_nearest(z_map)?;
            m.data.iter().map(|&v| v != 0.0).collect()
        }
        None => z_map.data.iter().map(|&v| v != 0.0 && v.is_finite()).collect(),
    };
    let values: Vec<f64> = z_map
        .data
        .iter()
        .zip(&in_mask)
        .filter(|(_, &m)| m)
        .map(|(&v, _)| if two_sided { v.abs() } else { v })
        .collect();

    // two-sided tests spend half of alpha on each tail
    let alpha_ = if two_sided { alpha / 2.0 } else { alpha };
    let threshold = match height_control {
        HeightControl::Fpr => norm_isf(alpha_),
        HeightControl::Fdr => fdr_threshold(&values, alpha_)?,
        HeightControl::Bonferroni => norm_isf(alpha_ / values.len().max(1) as f64),
    };

    let mut data: Vec<f64> = z_map
        .data
        .iter()
        .zip(&in_mask)
        .map(|(&v, &m)| {
            let keep = m && if two_sided { v.abs() > threshold } else { v > threshold };
            if keep {
                v
            } else {
                0.0
            }
        })
        .collect();
    if cluster_threshold > 0 {
        cluster_size_filter(&mut data, z_map.dims, cluster_threshold);
    }
    debug!(
        "{} threshold at alpha {}: z > {:.3}, {} voxels survive",
        height_control,
        alpha,
        threshold,
        data.iter().filter(|&&v| v != 0.0).count()
    );
    Ok((z_map.with_data(data)?, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(values: Vec<f64>) -> Volume {
        let n = values.len();
        let affine = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        Volume::new(values, (n, 1, 1), (1.0, 1.0, 1.0), affine).unwrap()
    }

    #[test]
    fn test_fdr_threshold() {
        // one very strong value among nulls
        let z = [8.0, 0.1, -0.2, 0.3, 0.0, -0.5];
        let thr = fdr_threshold(&z, 0.05).unwrap();
        assert!(thr < 8.0 && thr > 7.9);
        assert_eq!(fdr_threshold(&[0.1, 0.2], 0.05).unwrap(), f64::INFINITY);
        assert!(fdr_threshold(&z, 1.5).is_err());
    }

    #[test]
    fn test_fpr_two_sided() {
        let z = line(vec![4.0, -4.0, 1.0, 0.0, 3.0]);
        let (out, thr) = threshold_stats_img(&z, None, 0.001, HeightControl::Fpr, 0, true).unwrap();
        assert!((thr - 3.2905267).abs() < 1e-6);
        assert_eq!(out.data, vec![4.0, -4.0, 0.0, 0.0, 0.0]);

        let (out, thr) = threshold_stats_img(&z, None, 0.001, HeightControl::Fpr, 0, false).unwrap();
        assert!((thr - 3.0902323).abs() < 1e-6);
        assert_eq!(out.data, vec![4.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_fdr_two_sided_uses_half_alpha() {
        // p(2.46) is about 0.00695: BH at 0.05 keeps the 200 strong voxels
        // (cut-off 0.01), at 0.025 it keeps none (cut-off 0.005)
        let mut values = vec![2.46; 200];
        values.extend((0..800).map(|i| 0.5 + (i % 10) as f64 * 0.01));
        let z = line(values);
        let (_, one) = threshold_stats_img(&z, None, 0.05, HeightControl::Fdr, 0, false).unwrap();
        assert!(one < 2.46 && one > 2.45);
        let (out, two) = threshold_stats_img(&z, None, 0.05, HeightControl::Fdr, 0, true).unwrap();
        assert_eq!(two, f64::INFINITY);
        assert!(out.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_cluster_threshold_removes_small_clusters() {
        let z = line(vec![5.0, 5.0, 5.0, 0.0, 5.0, 0.0, -5.0, -5.0]);
        let (out, _) = threshold_stats_img(&z, None, 0.001, HeightControl::Fpr, 1, true).unwrap();
        assert_eq!(out.data, vec![5.0, 5.0, 5.0, 0.0, 0.0, 0.0, -5.0, -5.0]);
    }

    #[test]
    fn test_mask_restricts_thresholding() {
        let z = line(vec![5.0, 5.0, 5.0]);
        let mask = line(vec![1.0, 0.0, 1.0]);
        let (out, _) = threshold_stats_img(&z, Some(&mask), 0.05, HeightControl::Bonferroni, 0, true).unwrap();
        assert_eq!(out.data, vec![5.0, 0.0, 5.0]);
    }

    #[test]
    fn test_height_control_parse() {
        assert_eq!("FDR".parse::<HeightControl>().unwrap(), HeightControl::Fdr);
        assert!("fwe".parse::<HeightControl>().is_err());
        assert_eq!(HeightControl::Fpr.to_string(), "fpr");
    }
}
