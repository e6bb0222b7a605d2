//! Separable Gaussian smoothing of volumes
//!
//! Kernel width is given as FWHM in mm and converted per axis using the voxel
//! size. Boundaries are reflected (d c b a | a b c d | d c b a) and the kernel
//! is truncated at 4 sigma.

use rayon::prelude::*;

use crate::volume::{idx3d, Series, Volume};

/// FWHM (mm) to standard deviation (mm)
pub fn fwhm_to_sigma(fwhm: f64) -> f64 {
    fwhm / (8.0 * 2f64.ln()).sqrt()
}

/// Normalised 1D Gaussian kernel, radius = round(4 sigma)
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (4.0 * sigma + 0.5) as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

#[inline]
fn reflect(i: i64, n: i64) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * n;
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - 1 - i;
    }
    i as usize
}

fn convolve_line(line: &[f64], kernel: &[f64], out: &mut [f64]) {
    let n = line.len() as i64;
    let radius = (kernel.len() / 2) as i64;
    for (x, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (t, &k) in kernel.iter().enumerate() {
            acc += k * line[reflect(x as i64 + t as i64 - radius, n)];
        }
        *o = acc;
    }
}

/// Smooth a 3D array in place
pub fn smooth_array(data: &mut [f64], dims: (usize, usize, usize), voxel_size: (f64, f64, f64), fwhm: f64) {
    let (nx, ny, nz) = dims;
    let sigma = fwhm_to_sigma(fwhm);
    let kernels = [
        gaussian_kernel(sigma / voxel_size.0.abs().max(1e-6)),
        gaussian_kernel(sigma / voxel_size.1.abs().max(1e-6)),
        gaussian_kernel(sigma / voxel_size.2.abs().max(1e-6)),
    ];

    // x axis
    if kernels[0].len() > 1 {
        let mut line = vec![0.0; nx];
        let mut out = vec![0.0; nx];
        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                line.copy_from_slice(&data[start..start + nx]);
                convolve_line(&line, &kernels[0], &mut out);
                data[start..start + nx].copy_from_slice(&out);
            }
        }
    }

    // y axis
    if kernels[1].len() > 1 {
        let mut line = vec![0.0; ny];
        let mut out = vec![0.0; ny];
        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    line[j] = data[idx3d(i, j, k, nx, ny)];
                }
                convolve_line(&line, &kernels[1], &mut out);
                for j in 0..ny {
                    data[idx3d(i, j, k, nx, ny)] = out[j];
                }
            }
        }
    }

    // z axis
    if kernels[2].len() > 1 {
        let mut line = vec![0.0; nz];
        let mut out = vec![0.0; nz];
        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    line[k] = data[idx3d(i, j, k, nx, ny)];
                }
                convolve_line(&line, &kernels[2], &mut out);
                for k in 0..nz {
                    data[idx3d(i, j, k, nx, ny)] = out[k];
                }
            }
        }
    }
}

pub fn smooth_volume(vol: &Volume, fwhm: f64) -> Volume {
    let mut out = vol.clone();
    smooth_array(&mut out.data, vol.dims, vol.voxel_size, fwhm);
    out
}

/// Smooth every volume of a series, in parallel over time points
pub fn smooth_series(series: &mut Series, fwhm: f64) {
    let n = series.n_voxels();
    if n == 0 {
        return;
    }
    let (dims, voxel_size) = (series.dims, series.voxel_size);
    series
        .data
        .par_chunks_mut(n)
        .for_each(|vol| smooth_array(vol, dims, voxel_size, fwhm));
}
