//! Permuted OLS with max-statistic family-wise error control
//!
//! The tested regressor and every target column are residualised against
//! the confounds (an intercept when requested) and scaled to unit norm, so
//! the regression coefficient of a column is a dot product and
//! `t = b / sqrt((1 - b^2) / dof)`. Intercept-only tests flip signs of
//! whole observations; other tests permute the tested regressor.

use std::time::Instant;

use log::info;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{FcError, Result};
use crate::progress;
use crate::stats::glm::masked_matrix;
use crate::utils::mask::background_mask;
use crate::volume::{mean_volumes, Volume};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PermutationOptions {
    pub n_perm: usize,
    pub two_sided: bool,
    /// Add an intercept confound unless the tested variable is constant
    pub model_intercept: bool,
    pub random_state: u64,
    /// Number of independent random streams; results depend on it, not on the thread pool
    pub n_jobs: usize,
}

impl Default for PermutationOptions {
    fn default() -> Self {
        Self { n_perm: 5000, two_sided: true, model_intercept: true, random_state: 0, n_jobs: 10 }
    }
}

#[derive(Debug, Clone)]
pub struct PermutedOls {
    /// Unpermuted t score per target column
    pub t_scores: Vec<f64>,
    /// -log10 of the FWE-corrected p-value per target column
    pub neg_log10_pvals: Vec<f64>,
    /// Null distribution of the maximum statistic
    pub h0_max: Vec<f64>,
}

fn unit_norm(v: &mut [f64]) -> f64 {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

fn t_from_beta(beta: f64, dof: f64) -> f64 {
    let rss = (1.0 - beta * beta).max(f64::MIN_POSITIVE);
    beta / (rss / dof).sqrt()
}

/// Max statistic of `betas` after conversion to t
fn max_stat(betas: &DVector<f64>, dof: f64, two_sided: bool) -> f64 {
    betas.iter().fold(f64::NEG_INFINITY, |acc, &b| {
        let t = t_from_beta(b, dof);
        acc.max(if two_sided { t.abs() } else { t })
    })
}

/// Permutation test of one regressor against every column of `target` (n x v)
pub fn permuted_ols(tested: &[f64], target: &DMatrix<f64>, opts: &PermutationOptions) -> Result<PermutedOls> {
    let n = tested.len();
    if n != target.nrows() {
        return Err(FcError::Shape(format!(
            "tested variable has {} rows, targets have {}",
            n,
            target.nrows()
        )));
    }
    if opts.n_jobs == 0 {
        return Err(FcError::Config("n_jobs must be at least 1".to_string()));
    }

    let intercept_test = tested.iter().all(|&v| (v - tested[0]).abs() < 1e-12);
    let n_confounds = usize::from(opts.model_intercept && !intercept_test);
    if n <= 1 + n_confounds {
        return Err(FcError::Stats(format!("{} observations leave no degrees of freedom", n)));
    }
    let dof = (n - 1 - n_confounds) as f64;

    let mut x: Vec<f64> = tested.to_vec();
    let mut y = target.clone();
    if n_confounds == 1 {
        let mean = x.iter().sum::<f64>() / n as f64;
        x.iter_mut().for_each(|v| *v -= mean);
        for mut col in y.column_iter_mut() {
            let mean = col.mean();
            col.add_scalar_mut(-mean);
        }
    }
    if unit_norm(&mut x) == 0.0 {
        return Err(FcError::Stats("tested variable has zero variance after confound removal".to_string()));
    }
    for mut col in y.column_iter_mut() {
        let norm = col.norm();
        if norm > 0.0 {
            col /= norm;
        }
    }

    let x_vec = DVector::from_vec(x.clone());
    let t_scores: Vec<f64> = y.tr_mul(&x_vec).iter().map(|&b| t_from_beta(b, dof)).collect();

    let t0 = Instant::now();
    let pb = progress::bar(opts.n_perm, "permutations");
    let per_job = |job: usize| opts.n_perm / opts.n_jobs + usize::from(job < opts.n_perm % opts.n_jobs);
    let h0_max: Vec<f64> = (0..opts.n_jobs)
        .into_par_iter()
        .flat_map_iter(|job| {
            let mut rng = StdRng::seed_from_u64(opts.random_state + job as u64);
            let mut perm_x = x.clone();
            let mut maxima = Vec::with_capacity(per_job(job));
            for _ in 0..per_job(job) {
                if intercept_test {
                    for (p, &v) in perm_x.iter_mut().zip(&x) {
                        *p = if rng.gen::<bool>() { v } else { -v };
                    }
                } else {
                    perm_x.shuffle(&mut rng);
                }
                let betas = y.tr_mul(&DVector::from_column_slice(&perm_x));
                maxima.push(max_stat(&betas, dof, opts.two_sided));
                pb.inc(1);
            }
            maxima
        })
        .collect();
    pb.finish_and_clear();

    let mut sorted = h0_max.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n_perm = sorted.len() as f64;
    let neg_log10_pvals = t_scores
        .iter()
        .map(|&t| {
            let score = if opts.two_sided { t.abs() } else { t };
            let below = sorted.partition_point(|&h| h < score);
            let exceed = (sorted.len() - below) as f64;
            -((exceed + 1.0) / (n_perm + 1.0)).log10()
        })
        .collect();

    info!(
        "{} permutations over {} voxels in {:.2?}",
        opts.n_perm,
        target.ncols(),
        t0.elapsed()
    );
    Ok(PermutedOls { t_scores, neg_log10_pvals, h0_max })
}

/// Voxel-wise permutation test of `design_column` across `maps`
///
/// Maps are resampled to the first one. Without `mask` the background mask
/// of the mean map is used.
///
/// # Returns
/// `-log10(p_FWE)` inside the mask, zero elsewhere.
pub fn non_parametric_inference(
    maps: &[Volume],
    design_column: &[f64],
    mask: Option<&Volume>,
    opts: &PermutationOptions,
) -> Result<Volume> {
    let first = maps
        .first()
        .ok_or_else(|| FcError::Shape("permutation test needs at least one map".to_string()))?;
    let maps: Vec<Volume> = maps
        .iter()
        .map(|m| m.resample_linear(first))
        .collect::<Result<_>>()?;
    let mask = match mask {
        Some(m) => m.resample_nearest(first)?,
        None => background_mask(&mean_volumes(&maps)?)?,
    };
    let voxels = mask.nonzero();
    if voxels.is_empty() {
        return Err(FcError::Stats("mask is empty".to_string()));
    }
    let target = masked_matrix(&maps, &voxels);
    let result = permuted_ols(design_column, &target, opts)?;

    let mut out = first.zeros_like();
    for (&idx, &v) in voxels.iter().zip(&result.neg_log10_pvals) {
        out.data[idx] = v;
    }
    Ok(out)
}
