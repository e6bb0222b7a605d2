//! Volume to surface projection

use nalgebra::{Matrix4, Vector4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{FcError, Result};
use crate::surface::mesh::SurfaceMesh;
use crate::volume::Volume;

/// Number of sample points per vertex, the vertex itself included
pub const N_SAMPLES: usize = 20;

/// Offsets (mm) spread uniformly in a ball of `radius`, the first one at the centre
pub fn ball_offsets(radius: f64, n: usize) -> Vec<[f64; 3]> {
    let mut rng = StdRng::seed_from_u64(0);
    let mut offsets = vec![[0.0; 3]];
    while offsets.len() < n {
        let p: [f64; 3] = [rng.gen_range(-1.0..=1.0), rng.gen_range(-1.0..=1.0), rng.gen_range(-1.0..=1.0)];
        if p[0] * p[0] + p[1] * p[1] + p[2] * p[2] <= 1.0 {
            offsets.push([p[0] * radius, p[1] * radius, p[2] * radius]);
        }
    }
    offsets.truncate(n);
    offsets
}

/// Mean of the linearly interpolated values in a ball around each vertex
///
/// Samples outside the volume are ignored; a vertex with no sample inside
/// gets NaN.
pub fn vol_to_surf(vol: &Volume, mesh: &SurfaceMesh, radius: f64) -> Result<Vec<f64>> {
    let inv = Matrix4::from_row_slice(&vol.affine)
        .try_inverse()
        .ok_or_else(|| FcError::Shape("singular affine".to_string()))?;
    let offsets = ball_offsets(radius, N_SAMPLES);

    Ok(mesh
        .vertices
        .par_iter()
        .map(|v| {
            let (sum, n) = offsets
                .iter()
                .map(|o| {
                    let p = inv * Vector4::new(v[0] + o[0], v[1] + o[1], v[2] + o[2], 1.0);
                    vol.sample_voxel(p[0], p[1], p[2])
                })
                .filter(|s| s.is_finite())
                .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        })
        .collect())
}

/// Zero texture values are not drawn
pub fn zeros_to_nan(values: &mut [f64]) {
    values.iter_mut().filter(|v| **v == 0.0).for_each(|v| *v = f64::NAN);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(n: usize, value: impl Fn(usize, usize, usize) -> f64) -> Volume {
        let mut data = vec![0.0; n * n * n];
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    data[i + j * n + k * n * n] = value(i, j, k);
                }
            }
        }
        let affine = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        Volume::new(data, (n, n, n), (1.0, 1.0, 1.0), affine).unwrap()
    }

    #[test]
    fn test_ball_offsets() {
        let o = ball_offsets(5.0, N_SAMPLES);
        assert_eq!(o.len(), 20);
        assert_eq!(o[0], [0.0; 3]);
        assert!(o.iter().all(|p| (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt() <= 5.0 + 1e-12));
        assert_eq!(o, ball_offsets(5.0, N_SAMPLES));
    }

    #[test]
    fn test_constant_volume_projects_constant() {
        let vol = cube(20, |_, _, _| 2.5);
        let mesh = SurfaceMesh { vertices: vec![[10.0, 10.0, 10.0], [9.5, 8.0, 11.0]], faces: vec![] };
        let values = vol_to_surf(&vol, &mesh, 3.0).unwrap();
        assert!(values.iter().all(|v| (v - 2.5).abs() < 1e-12));
    }

    #[test]
    fn test_outside_vertex_is_nan() {
        let vol = cube(10, |i, _, _| i as f64);
        let mesh = SurfaceMesh { vertices: vec![[100.0, 100.0, 100.0]], faces: vec![] };
        assert!(vol_to_surf(&vol, &mesh, 2.0).unwrap()[0].is_nan());
    }

    #[test]
    fn test_linear_field_mean() {
        // symmetric offsets are not guaranteed, so only check the value range
        let vol = cube(30, |i, _, _| i as f64);
        let mesh = SurfaceMesh { vertices: vec![[15.0, 15.0, 15.0]], faces: vec![] };
        let v = vol_to_surf(&vol, &mesh, 5.0).unwrap()[0];
        assert!(v > 10.0 && v < 20.0);
    }

    #[test]
    fn test_zeros_to_nan() {
        let mut v = vec![0.0, 1.0, 0.0];
        zeros_to_nan(&mut v);
        assert!(v[0].is_nan() && v[2].is_nan());
        assert_eq!(v[1], 1.0);
    }
}
