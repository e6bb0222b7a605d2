//! In-memory volumes and series on a voxel grid with a world affine
//!
//! Data layout follows NIfTI: index = i + j*nx + k*nx*ny (+ t*nx*ny*nz).

use std::path::Path;

use nalgebra::{Matrix4, Vector4};

use crate::error::{FcError, Result};
use crate::nifti_io::{read_nifti_file, read_series_file, save_nifti_to_file};

/// A 3D image
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Vec<f64>,
    pub dims: (usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    /// Row-major 4x4 voxel-to-world affine (mm)
    pub affine: [f64; 16],
}

/// A 4D image: `n_vols` volumes on the same grid
#[derive(Debug, Clone)]
pub struct Series {
    pub data: Vec<f64>,
    pub dims: (usize, usize, usize),
    pub n_vols: usize,
    pub voxel_size: (f64, f64, f64),
    pub affine: [f64; 16],
    /// Repetition time in seconds, 0 when unknown
    pub tr: f64,
}

#[inline]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

fn affine_matrix(affine: &[f64; 16]) -> Matrix4<f64> {
    Matrix4::from_row_slice(affine)
}

impl Volume {
    pub fn new(
        data: Vec<f64>,
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Result<Self> {
        if data.len() != dims.0 * dims.1 * dims.2 {
            return Err(FcError::Shape(format!(
                "{} values for a {}x{}x{} grid",
                data.len(),
                dims.0,
                dims.1,
                dims.2
            )));
        }
        Ok(Self { data, dims, voxel_size, affine })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let nii = read_nifti_file(path)?;
        Ok(Self {
            data: nii.data,
            dims: nii.dims,
            voxel_size: nii.voxel_size,
            affine: nii.affine,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let (nx, ny, nz) = self.dims;
        save_nifti_to_file(path, &self.data, &[nx, ny, nz], self.voxel_size, &self.affine, 0.0)
    }

    /// A volume on the same grid with new data
    pub fn with_data(&self, data: Vec<f64>) -> Result<Self> {
        Self::new(data, self.dims, self.voxel_size, self.affine)
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            data: vec![0.0; self.data.len()],
            dims: self.dims,
            voxel_size: self.voxel_size,
            affine: self.affine,
        }
    }

    pub fn n_voxels(&self) -> usize {
        self.data.len()
    }

    /// Volume of one voxel in mm^3
    pub fn voxel_volume(&self) -> f64 {
        let m = affine_matrix(&self.affine);
        m.fixed_view::<3, 3>(0, 0).determinant().abs()
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        idx3d(i, j, k, self.dims.0, self.dims.1)
    }

    /// (i, j, k) of a flat index
    pub fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let (nx, ny, _) = self.dims;
        (idx % nx, (idx / nx) % ny, idx / (nx * ny))
    }

    pub fn voxel_to_world(&self, i: f64, j: f64, k: f64) -> [f64; 3] {
        voxel_to_world(&self.affine, i, j, k)
    }

    pub fn world_to_voxel(&self, x: f64, y: f64, z: f64) -> Result<[f64; 3]> {
        world_to_voxel(&self.affine, x, y, z)
    }

    pub fn same_grid(&self, other: &Volume) -> bool {
        self.dims == other.dims
            && self
                .affine
                .iter()
                .zip(other.affine.iter())
                .all(|(a, b)| (a - b).abs() < 1e-4)
    }

    /// Trilinear sample at continuous voxel coordinates; NaN outside the grid
    pub fn sample_voxel(&self, ci: f64, cj: f64, ck: f64) -> f64 {
        let (nx, ny, nz) = self.dims;
        let max = |n: usize| (n as f64) - 1.0;
        if ci < -1e-6 || cj < -1e-6 || ck < -1e-6
            || ci > max(nx) + 1e-6 || cj > max(ny) + 1e-6 || ck > max(nz) + 1e-6
        {
            return f64::NAN;
        }
        let ci = ci.clamp(0.0, max(nx));
        let cj = cj.clamp(0.0, max(ny));
        let ck = ck.clamp(0.0, max(nz));

        let i0 = ci.floor() as usize;
        let j0 = cj.floor() as usize;
        let k0 = ck.floor() as usize;
        let i1 = (i0 + 1).min(nx - 1);
        let j1 = (j0 + 1).min(ny - 1);
        let k1 = (k0 + 1).min(nz - 1);
        let (fx, fy, fz) = (ci - i0 as f64, cj - j0 as f64, ck - k0 as f64);

        let v = |i: usize, j: usize, k: usize| self.data[idx3d(i, j, k, nx, ny)];
        let c00 = v(i0, j0, k0) * (1.0 - fx) + v(i1, j0, k0) * fx;
        let c10 = v(i0, j1, k0) * (1.0 - fx) + v(i1, j1, k0) * fx;
        let c01 = v(i0, j0, k1) * (1.0 - fx) + v(i1, j0, k1) * fx;
        let c11 = v(i0, j1, k1) * (1.0 - fx) + v(i1, j1, k1) * fx;
        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        c0 * (1.0 - fz) + c1 * fz
    }

    /// Trilinear sample at a world coordinate (mm); NaN outside the grid
    pub fn sample_world(&self, x: f64, y: f64, z: f64) -> Result<f64> {
        let [ci, cj, ck] = self.world_to_voxel(x, y, z)?;
        Ok(self.sample_voxel(ci, cj, ck))
    }

    /// Nearest-neighbour resampling onto `reference`'s grid (masks, labels)
    pub fn resample_nearest(&self, reference: &Volume) -> Result<Volume> {
        if self.same_grid(reference) {
            return Ok(self.clone());
        }
        let to_src = self.world_to_source(reference)?;
        let (nx, ny, nz) = self.dims;
        let mut out = reference.zeros_like();
        for idx in 0..out.data.len() {
            let (i, j, k) = reference.coords(idx);
            let src = to_src * Vector4::new(i as f64, j as f64, k as f64, 1.0);
            let (si, sj, sk) = (src[0].round(), src[1].round(), src[2].round());
            if si >= 0.0 && sj >= 0.0 && sk >= 0.0 {
                let (si, sj, sk) = (si as usize, sj as usize, sk as usize);
                if si < nx && sj < ny && sk < nz {
                    out.data[idx] = self.data[idx3d(si, sj, sk, nx, ny)];
                }
            }
        }
        Ok(out)
    }

    /// Trilinear resampling onto `reference`'s grid (continuous maps), zero outside
    pub fn resample_linear(&self, reference: &Volume) -> Result<Volume> {
        if self.same_grid(reference) {
            return Ok(self.clone());
        }
        let to_src = self.world_to_source(reference)?;
        let mut out = reference.zeros_like();
        for idx in 0..out.data.len() {
            let (i, j, k) = reference.coords(idx);
            let src = to_src * Vector4::new(i as f64, j as f64, k as f64, 1.0);
            let v = self.sample_voxel(src[0], src[1], src[2]);
            out.data[idx] = if v.is_finite() { v } else { 0.0 };
        }
        Ok(out)
    }

    /// Maps reference voxel coordinates to this volume's voxel coordinates
    fn world_to_source(&self, reference: &Volume) -> Result<Matrix4<f64>> {
        let inv = affine_matrix(&self.affine)
            .try_inverse()
            .ok_or_else(|| FcError::Shape("singular affine".to_string()))?;
        Ok(inv * affine_matrix(&reference.affine))
    }

    /// Indices of voxels with a non-zero value
    pub fn nonzero(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, _)| i)
            .collect()
    }
}

pub fn voxel_to_world(affine: &[f64; 16], i: f64, j: f64, k: f64) -> [f64; 3] {
    [
        affine[0] * i + affine[1] * j + affine[2] * k + affine[3],
        affine[4] * i + affine[5] * j + affine[6] * k + affine[7],
        affine[8] * i + affine[9] * j + affine[10] * k + affine[11],
    ]
}

pub fn world_to_voxel(affine: &[f64; 16], x: f64, y: f64, z: f64) -> Result<[f64; 3]> {
    let inv = affine_matrix(affine)
        .try_inverse()
        .ok_or_else(|| FcError::Shape("singular affine".to_string()))?;
    let v = inv * Vector4::new(x, y, z, 1.0);
    Ok([v[0], v[1], v[2]])
}

/// Voxel-wise mean of volumes, resampled linearly onto the first one's grid
pub fn mean_volumes(volumes: &[Volume]) -> Result<Volume> {
    let first = volumes
        .first()
        .ok_or_else(|| FcError::Shape("cannot average an empty list of volumes".to_string()))?;
    let mut acc = vec![0.0; first.n_voxels()];
    for vol in volumes {
        let vol = vol.resample_linear(first)?;
        for (a, v) in acc.iter_mut().zip(&vol.data) {
            *a += v;
        }
    }
    let n = volumes.len() as f64;
    acc.iter_mut().for_each(|a| *a /= n);
    first.with_data(acc)
}

impl Series {
    pub fn load(path: &Path) -> Result<Self> {
        let nii = read_series_file(path)?;
        let (nx, ny, nz, nt) = nii.dims;
        Ok(Self {
            data: nii.data,
            dims: (nx, ny, nz),
            n_vols: nt,
            voxel_size: nii.voxel_size,
            affine: nii.affine,
            tr: nii.tr,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let (nx, ny, nz) = self.dims;
        save_nifti_to_file(
            path,
            &self.data,
            &[nx, ny, nz, self.n_vols],
            self.voxel_size,
            &self.affine,
            self.tr,
        )
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn volume(&self, t: usize) -> Volume {
        let n = self.n_voxels();
        Volume {
            data: self.data[t * n..(t + 1) * n].to_vec(),
            dims: self.dims,
            voxel_size: self.voxel_size,
            affine: self.affine,
        }
    }

    pub fn volumes(&self) -> Vec<Volume> {
        (0..self.n_vols).map(|t| self.volume(t)).collect()
    }

    /// Time course of one voxel
    pub fn voxel_series(&self, idx: usize) -> Vec<f64> {
        let n = self.n_voxels();
        (0..self.n_vols).map(|t| self.data[t * n + idx]).collect()
    }

    /// Temporal mean image
    pub fn mean_volume(&self) -> Volume {
        let n = self.n_voxels();
        let mut mean = vec![0.0; n];
        for t in 0..self.n_vols {
            for (m, v) in mean.iter_mut().zip(&self.data[t * n..(t + 1) * n]) {
                *m += v;
            }
        }
        let nt = self.n_vols.max(1) as f64;
        mean.iter_mut().for_each(|m| *m /= nt);
        Volume {
            data: mean,
            dims: self.dims,
            voxel_size: self.voxel_size,
            affine: self.affine,
        }
    }

    /// Stack 3D volumes into a series on the first volume's grid
    pub fn from_volumes(volumes: &[Volume]) -> Result<Self> {
        let first = volumes
            .first()
            .ok_or_else(|| FcError::Shape("cannot concatenate zero volumes".to_string()))?;
        let mut data = Vec::with_capacity(first.n_voxels() * volumes.len());
        for vol in volumes {
            let vol = vol.resample_linear(first)?;
            data.extend_from_slice(&vol.data);
        }
        Ok(Self {
            data,
            dims: first.dims,
            n_vols: volumes.len(),
            voxel_size: first.voxel_size,
            affine: first.affine,
            tr: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(dims: (usize, usize, usize), vs: f64, origin: [f64; 3]) -> Volume {
        let affine = [
            vs, 0.0, 0.0, origin[0],
            0.0, vs, 0.0, origin[1],
            0.0, 0.0, vs, origin[2],
            0.0, 0.0, 0.0, 1.0,
        ];
        Volume::new(vec![0.0; dims.0 * dims.1 * dims.2], dims, (vs, vs, vs), affine).unwrap()
    }

    #[test]
    fn test_world_voxel_roundtrip() {
        let vol = grid((10, 10, 10), 2.0, [-10.0, -12.0, -8.0]);
        let w = vol.voxel_to_world(3.0, 4.0, 5.0);
        assert_eq!(w, [-4.0, -4.0, 2.0]);
        let v = vol.world_to_voxel(w[0], w[1], w[2]).unwrap();
        assert!((v[0] - 3.0).abs() < 1e-9 && (v[1] - 4.0).abs() < 1e-9 && (v[2] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_voxel_volume() {
        assert!((grid((2, 2, 2), 2.0, [0.0; 3]).voxel_volume() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_trilinear_sample() {
        let mut vol = grid((2, 2, 2), 1.0, [0.0; 3]);
        vol.data = (0..8).map(|i| i as f64).collect();
        // midpoint is the mean of all corners
        assert!((vol.sample_voxel(0.5, 0.5, 0.5) - 3.5).abs() < 1e-9);
        assert!(vol.sample_voxel(-1.0, 0.0, 0.0).is_nan());
    }

    #[test]
    fn test_resample_nearest_to_coarser_grid() {
        let mut fine = grid((4, 4, 4), 1.0, [0.0; 3]);
        let i = fine.index(2, 2, 2);
        fine.data[i] = 1.0;
        let coarse = grid((2, 2, 2), 2.0, [0.0; 3]);
        let out = fine.resample_nearest(&coarse).unwrap();
        assert_eq!(out.data[coarse.index(1, 1, 1)], 1.0);
        assert_eq!(out.data.iter().sum::<f64>(), 1.0);
    }

    #[test]
    fn test_mean_volumes() {
        let mut a = grid((2, 1, 1), 1.0, [0.0; 3]);
        let mut b = a.clone();
        a.data = vec![1.0, 3.0];
        b.data = vec![3.0, 5.0];
        assert_eq!(mean_volumes(&[a, b]).unwrap().data, vec![2.0, 4.0]);
        assert!(mean_volumes(&[]).is_err());
    }

    #[test]
    fn test_series_stack_and_split() {
        let mut a = grid((2, 2, 1), 1.0, [0.0; 3]);
        a.data = vec![1.0, 2.0, 3.0, 4.0];
        let b = a.with_data(vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let series = Series::from_volumes(&[a.clone(), b]).unwrap();
        assert_eq!(series.n_vols, 2);
        assert_eq!(series.voxel_series(1), vec![2.0, 6.0]);
        assert_eq!(series.volume(0), a);
        assert_eq!(series.mean_volume().data, vec![3.0, 4.0, 5.0, 6.0]);
    }
}
