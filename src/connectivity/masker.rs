//! Extraction of cleaned time series from 4D BOLD series
//!
//! All maskers share [`MaskerOptions`]: optional spatial smoothing of the
//! series before extraction, then temporal cleaning of every extracted
//! signal.

use crate::error::{FcError, Result};
use crate::signal::{clean, CleanOptions};
use crate::utils::mask::{background_mask, create_sphere_mask, label_mask};
use crate::utils::smoothing::smooth_series;
use crate::volume::{Series, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaskerOptions {
    pub smoothing_fwhm: Option<f64>,
    pub clean: CleanOptions,
}

fn smoothed<'a>(bold: &'a Series, fwhm: Option<f64>, buffer: &'a mut Option<Series>) -> &'a Series {
    match fwhm {
        Some(f) if f > 0.0 => {
            let mut copy = bold.clone();
            smooth_series(&mut copy, f);
            buffer.insert(copy)
        }
        _ => bold,
    }
}

/// Mean signal over the voxels of `mask` (a volume on the series grid)
fn region_signal(bold: &Series, voxels: &[usize]) -> Vec<f64> {
    let n = bold.n_voxels();
    (0..bold.n_vols)
        .map(|t| {
            let frame = &bold.data[t * n..(t + 1) * n];
            voxels.iter().map(|&i| frame[i]).sum::<f64>() / voxels.len() as f64
        })
        .collect()
}

/// Whole-brain voxel masker
#[derive(Debug, Clone)]
pub struct BrainMasker {
    pub mask: Volume,
    voxels: Vec<usize>,
    opts: MaskerOptions,
}

impl BrainMasker {
    /// Mask from the background of the temporal mean image
    pub fn fit(bold: &Series, opts: MaskerOptions) -> Result<Self> {
        let mask = background_mask(&bold.mean_volume())?;
        Self::with_mask(mask, opts)
    }

    pub fn with_mask(mask: Volume, opts: MaskerOptions) -> Result<Self> {
        let voxels = mask.nonzero();
        if voxels.is_empty() {
            return Err(FcError::Stats("brain mask is empty".to_string()));
        }
        Ok(Self { mask, voxels, opts })
    }

    pub fn n_voxels(&self) -> usize {
        self.voxels.len()
    }

    /// Cleaned time series of every in-mask voxel
    pub fn transform(&self, bold: &Series) -> Result<Vec<Vec<f64>>> {
        if bold.dims != self.mask.dims {
            return Err(FcError::Shape("series and brain mask grids differ".to_string()));
        }
        let mut buffer = None;
        let bold = smoothed(bold, self.opts.smoothing_fwhm, &mut buffer);
        let mut signals: Vec<Vec<f64>> = self.voxels.iter().map(|&i| bold.voxel_series(i)).collect();
        clean(&mut signals, &self.opts.clean)?;
        Ok(signals)
    }

    /// Put one value per in-mask voxel back on the grid
    pub fn inverse_transform(&self, values: &[f64]) -> Result<Volume> {
        if values.len() != self.voxels.len() {
            return Err(FcError::Shape(format!(
                "{} values for {} mask voxels",
                values.len(),
                self.voxels.len()
            )));
        }
        let mut out = self.mask.zeros_like();
        for (&idx, &v) in self.voxels.iter().zip(values) {
            out.data[idx] = v;
        }
        Ok(out)
    }
}

/// Mean signal inside spheres around world coordinates
#[derive(Debug, Clone)]
pub struct SphereMasker {
    pub centers: Vec<[f64; 3]>,
    pub radius: f64,
    opts: MaskerOptions,
}

impl SphereMasker {
    pub fn new(centers: Vec<[f64; 3]>, radius: f64, opts: MaskerOptions) -> Self {
        Self { centers, radius, opts }
    }

    /// One cleaned signal per sphere
    pub fn transform(&self, bold: &Series) -> Result<Vec<Vec<f64>>> {
        let mut buffer = None;
        let bold = smoothed(bold, self.opts.smoothing_fwhm, &mut buffer);
        let reference = bold.volume(0);
        let mut signals = Vec::with_capacity(self.centers.len());
        for &center in &self.centers {
            let voxels = create_sphere_mask(&reference, center, self.radius)?.nonzero();
            if voxels.is_empty() {
                return Err(FcError::Stats(format!(
                    "sphere at ({:.1}, {:.1}, {:.1}) lies outside the image",
                    center[0], center[1], center[2]
                )));
            }
            signals.push(region_signal(bold, &voxels));
        }
        clean(&mut signals, &self.opts.clean)?;
        Ok(signals)
    }
}

/// Mean signal inside groups of atlas labels
#[derive(Debug, Clone)]
pub struct LabelsMasker {
    pub atlas: Volume,
    /// Each entry is one region made of the listed labels
    pub regions: Vec<Vec<u32>>,
    opts: MaskerOptions,
}

impl LabelsMasker {
    pub fn new(atlas: Volume, regions: Vec<Vec<u32>>, opts: MaskerOptions) -> Self {
        Self { atlas, regions, opts }
    }

    pub fn transform(&self, bold: &Series) -> Result<Vec<Vec<f64>>> {
        let mut buffer = None;
        let bold = smoothed(bold, self.opts.smoothing_fwhm, &mut buffer);
        let atlas = self.atlas.resample_nearest(&bold.volume(0))?;
        let mut signals = Vec::with_capacity(self.regions.len());
        for labels in &self.regions {
            let voxels = label_mask(&atlas, labels)?.nonzero();
            if voxels.is_empty() {
                return Err(FcError::Stats(format!("atlas labels {:?} are empty on the BOLD grid", labels)));
            }
            signals.push(region_signal(bold, &voxels));
        }
        clean(&mut signals, &self.opts.clean)?;
        Ok(signals)
    }
}
