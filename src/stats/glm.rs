//! Second-level ordinary least squares model
//!
//! Maps are stacked into a subjects x voxels matrix restricted to a mask and
//! fitted against a design with a rank-aware pseudo-inverse. Residual
//! variance uses `n - rank` degrees of freedom.

use std::time::Instant;

use log::{debug, info};
use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::error::{FcError, Result};
use crate::stats::design::DesignMatrix;
use crate::stats::dist::{f_sf_pair, t_sf_pair, z_from_p};
use crate::utils::mask::background_mask;
use crate::volume::{mean_volumes, Volume};

const RANK_TOL: f64 = 1e-10;

/// t for a single row, F for several
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContrastKind {
    T,
    F,
}

/// Voxel-wise outputs of a contrast, zero outside the mask
#[derive(Debug, Clone)]
pub struct ContrastMaps {
    pub kind: ContrastKind,
    pub stat: Volume,
    pub z_score: Volume,
    pub p_value: Volume,
    /// Effect of the first contrast row
    pub effect_size: Volume,
    pub effect_variance: Volume,
}

/// Fitted second-level model
#[derive(Debug, Clone)]
pub struct SecondLevelModel {
    pub mask: Volume,
    voxels: Vec<usize>,
    beta: DMatrix<f64>,
    sigma2: Vec<f64>,
    /// (X'X)^+
    xtx_pinv: DMatrix<f64>,
    pub dof: f64,
    pub rank: usize,
}

/// Subjects x voxels matrix of `imgs` inside `voxels`
pub fn masked_matrix(imgs: &[Volume], voxels: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(imgs.len(), voxels.len(), |r, c| imgs[r].data[voxels[c]])
}

fn pinv(m: &DMatrix<f64>) -> Result<(DMatrix<f64>, usize)> {
    let svd = m.clone().svd(true, true);
    let max_sv = svd.singular_values.iter().fold(0.0f64, |a, &b| a.max(b));
    let tol = RANK_TOL * max_sv.max(1.0) * m.nrows().max(m.ncols()) as f64;
    let rank = svd.singular_values.iter().filter(|&&s| s > tol).count();
    let inv = svd
        .pseudo_inverse(tol)
        .map_err(|e| FcError::Stats(format!("pseudo-inverse failed: {}", e)))?;
    Ok((inv, rank))
}

impl SecondLevelModel {
    /// Fit on maps resampled to the first map's grid
    ///
    /// Without a mask the background mask of the mean map is used.
    pub fn fit(imgs: &[Volume], design: &DesignMatrix, mask: Option<&Volume>) -> Result<Self> {
        let t0 = Instant::now();
        let first = imgs
            .first()
            .ok_or_else(|| FcError::Shape("second-level model needs at least one map".to_string()))?;
        if design.n_rows() != imgs.len() {
            return Err(FcError::Shape(format!(
                "design has {} rows for {} maps",
                design.n_rows(),
                imgs.len()
            )));
        }

        let imgs: Vec<Volume> = imgs
            .iter()
            .map(|img| img.resample_linear(first))
            .collect::<Result<_>>()?;
        let mask = match mask {
            Some(m) => m.resample_nearest(first)?,
            None => background_mask(&mean_volumes(&imgs)?)?,
        };
        let voxels = mask.nonzero();
        if voxels.is_empty() {
            return Err(FcError::Stats("mask is empty".to_string()));
        }

        let x = &design.data;
        let y = masked_matrix(&imgs, &voxels);
        let (x_pinv, rank) = pinv(x)?;
        let n = x.nrows();
        if rank >= n {
            return Err(FcError::Stats(format!(
                "design of rank {} leaves no residual degrees of freedom for {} maps",
                rank, n
            )));
        }
        let dof = (n - rank) as f64;

        let beta = &x_pinv * &y;
        let residuals = &y - x * &beta;
        let sigma2: Vec<f64> = residuals
            .column_iter()
            .map(|r| r.iter().map(|v| v * v).sum::<f64>() / dof)
            .collect();
        let xtx_pinv = &x_pinv * x_pinv.transpose();

        debug!("GLM design {}x{}, rank {}, {} voxels", n, x.ncols(), rank, voxels.len());
        info!("GLM fitting took {:.2?}", t0.elapsed());

        Ok(Self { mask, voxels, beta, sigma2, xtx_pinv, dof, rank })
    }

    /// Number of voxels in the analysis mask
    pub fn n_voxels(&self) -> usize {
        self.voxels.len()
    }

    fn to_volume(&self, values: &[f64]) -> Volume {
        let mut out = self.mask.zeros_like();
        for (&idx, &v) in self.voxels.iter().zip(values) {
            out.data[idx] = v;
        }
        out
    }

    /// Compute a t (one row) or F (several rows) contrast
    pub fn compute_contrast(&self, contrast: &[Vec<f64>]) -> Result<ContrastMaps> {
        let p = self.beta.nrows();
        if contrast.is_empty() || contrast.iter().any(|r| r.len() != p) {
            return Err(FcError::Shape(format!("contrast rows must have {} entries", p)));
        }
        let q = contrast.len();
        let c = DMatrix::from_fn(q, p, |r, k| contrast[r][k]);
        let effects = &c * &self.beta; // q x v
        let cov = &c * &self.xtx_pinv * c.transpose(); // q x q, times sigma2 per voxel

        let kind = if q == 1 { ContrastKind::T } else { ContrastKind::F };
        let cov_inv = if kind == ContrastKind::F {
            Some(pinv(&cov)?.0)
        } else {
            None
        };
        let dof = self.dof;
        let var0 = cov[(0, 0)];

        // per voxel: stat, z, p, effect, variance
        let per_voxel: Vec<[f64; 5]> = (0..self.voxels.len())
            .into_par_iter()
            .map(|v| {
                let s2 = self.sigma2[v];
                let effect = effects[(0, v)];
                let variance = var0 * s2;
                let (stat, p_val, z) = match &cov_inv {
                    None => {
                        let t = if variance > 0.0 { effect / variance.sqrt() } else { 0.0 };
                        let (p_val, one_minus) = t_sf_pair(t, dof)?;
                        (t, p_val, z_from_p(p_val, one_minus))
                    }
                    Some(ci) => {
                        let e = effects.column(v);
                        let quad = (e.transpose() * ci * e)[(0, 0)];
                        let f = if s2 > 0.0 { quad / (q as f64 * s2) } else { 0.0 };
                        let (p_val, one_minus) = f_sf_pair(f, q as f64, dof)?;
                        (f, p_val, z_from_p(p_val, one_minus))
                    }
                };
                Ok([stat, z, p_val, effect, variance])
            })
            .collect::<Result<_>>()?;

        let column = |i: usize| -> Volume {
            let values: Vec<f64> = per_voxel.iter().map(|r| r[i]).collect();
            self.to_volume(&values)
        };
        Ok(ContrastMaps {
            kind,
            stat: column(0),
            z_score: column(1),
            p_value: column(2),
            effect_size: column(3),
            effect_variance: column(4),
        })
    }
}
