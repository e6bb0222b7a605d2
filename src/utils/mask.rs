//! Mask generation and combination
//!
//! Masks are [`Volume`]s holding 0/1 values. Spheres are defined in world
//! (mm) coordinates on the grid of a reference volume.

use std::collections::HashMap;

use crate::error::{FcError, Result};
use crate::volume::Volume;

/// Create a binary sphere mask on the grid of `reference`
///
/// Voxels whose world-space centre lies within `radius` mm of `center` are set
/// to 1. When the sphere is smaller than a voxel the nearest voxel is used so
/// the mask is never empty for a centre inside the field of view.
///
/// # Arguments
/// * `reference` - Volume defining grid and affine
/// * `center` - Sphere centre in world coordinates (mm)
/// * `radius` - Sphere radius in mm
pub fn create_sphere_mask(reference: &Volume, center: [f64; 3], radius: f64) -> Result<Volume> {
    let (nx, ny, nz) = reference.dims;
    let mut mask = reference.zeros_like();
    let r2 = radius * radius;

    // Bounding box in voxel space, padded by one voxel for oblique affines
    let c = reference.world_to_voxel(center[0], center[1], center[2])?;
    let min_vs = reference
        .voxel_size
        .0
        .min(reference.voxel_size.1)
        .min(reference.voxel_size.2)
        .max(1e-6);
    let reach = (radius / min_vs).ceil() + 1.0;
    let range = |c: f64, n: usize| {
        let lo = (c - reach).floor().max(0.0) as usize;
        let hi = ((c + reach).ceil().max(-1.0) + 1.0).min(n as f64) as usize;
        lo..hi
    };

    let mut found = false;
    for k in range(c[2], nz) {
        for j in range(c[1], ny) {
            for i in range(c[0], nx) {
                let w = reference.voxel_to_world(i as f64, j as f64, k as f64);
                let d2 = (w[0] - center[0]).powi(2) + (w[1] - center[1]).powi(2) + (w[2] - center[2]).powi(2);
                if d2 <= r2 {
                    let idx = reference.index(i, j, k);
                    mask.data[idx] = 1.0;
                    found = true;
                }
            }
        }
    }

    if !found {
        let (i, j, k) = (c[0].round(), c[1].round(), c[2].round());
        if i >= 0.0 && j >= 0.0 && k >= 0.0 && (i as usize) < nx && (j as usize) < ny && (k as usize) < nz {
            let idx = reference.index(i as usize, j as usize, k as usize);
            mask.data[idx] = 1.0;
        }
    }

    Ok(mask)
}

/// 1 where |value| >= threshold and value is non-zero, 0 elsewhere
pub fn binarize(vol: &Volume, threshold: f64) -> Volume {
    let data = vol
        .data
        .iter()
        .map(|&v| if v != 0.0 && v.is_finite() && v.abs() >= threshold { 1.0 } else { 0.0 })
        .collect();
    Volume { data, dims: vol.dims, voxel_size: vol.voxel_size, affine: vol.affine }
}

/// Combine binary masks on a common grid
///
/// `threshold` is the fraction of masks a voxel must belong to: 1 gives the
/// intersection, 0 the union.
pub fn intersect_masks(masks: &[Volume], threshold: f64) -> Result<Volume> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(FcError::Config(format!(
            "mask intersection threshold must be in [0, 1], got {}",
            threshold
        )));
    }
    let first = masks
        .first()
        .ok_or_else(|| FcError::Shape("no masks to intersect".to_string()))?;

    let mut counts = vec![0usize; first.n_voxels()];
    for mask in masks {
        if !mask.same_grid(first) {
            return Err(FcError::Shape("masks are not on the same grid".to_string()));
        }
        for (c, &v) in counts.iter_mut().zip(&mask.data) {
            if v != 0.0 {
                *c += 1;
            }
        }
    }

    let needed = ((threshold * masks.len() as f64).ceil() as usize).max(1);
    let data = counts.iter().map(|&c| if c >= needed { 1.0 } else { 0.0 }).collect();
    first.with_data(data)
}

/// Resample every mask onto the grid of the first one (nearest neighbour)
pub fn resample_masks(masks: &[Volume]) -> Result<Vec<Volume>> {
    let Some(reference) = masks.first() else {
        return Ok(Vec::new());
    };
    masks.iter().map(|m| m.resample_nearest(reference)).collect()
}

/// Zero every voxel outside `mask` (resampled to the image grid if needed)
pub fn apply_mask(img: &Volume, mask: &Volume) -> Result<Volume> {
    let mask = mask.resample_nearest(img)?;
    let data = img
        .data
        .iter()
        .zip(&mask.data)
        .map(|(&v, &m)| if m != 0.0 { v } else { 0.0 })
        .collect();
    img.with_data(data)
}

/// Brain mask of a mean functional image
///
/// The background value is the most frequent value on a two-voxel-wide
/// border of the volume; every voxel that differs from it (and is finite)
/// belongs to the mask.
pub fn background_mask(mean_img: &Volume) -> Result<Volume> {
    let (nx, ny, nz) = mean_img.dims;
    let border = 2usize;
    let mut hist: HashMap<u64, usize> = HashMap::new();
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let on_border = i < border || j < border || k < border
                    || i + border >= nx || j + border >= ny || k + border >= nz;
                if on_border {
                    let v = mean_img.data[mean_img.index(i, j, k)];
                    if v.is_finite() {
                        *hist.entry(v.to_bits()).or_insert(0) += 1;
                    }
                }
            }
        }
    }
    // ties resolved towards the smaller value
    let background = hist
        .into_iter()
        .map(|(bits, n)| (f64::from_bits(bits), n))
        .fold(None::<(f64, usize)>, |best, (v, n)| match best {
            Some((bv, bn)) if bn > n || (bn == n && bv <= v) => Some((bv, bn)),
            _ => Some((v, n)),
        })
        .map(|(v, _)| v)
        .unwrap_or(0.0);

    let data = mean_img
        .data
        .iter()
        .map(|&v| if v.is_finite() && v != background { 1.0 } else { 0.0 })
        .collect();
    mean_img.with_data(data)
}

/// Binary mask of the atlas voxels carrying any of `labels`
pub fn label_mask(atlas: &Volume, labels: &[u32]) -> Result<Volume> {
    let data = atlas
        .data
        .iter()
        .map(|&v| {
            let l = v.round();
            if l > 0.0 && labels.contains(&(l as u32)) { 1.0 } else { 0.0 }
        })
        .collect();
    atlas.with_data(data)
}

/// Number of voxels in a mask
pub fn count(mask: &Volume) -> usize {
    mask.data.iter().filter(|&&v| v != 0.0).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(n: usize, vs: f64) -> Volume {
        let half = (n as f64 - 1.0) / 2.0 * vs;
        let affine = [
            vs, 0.0, 0.0, -half,
            0.0, vs, 0.0, -half,
            0.0, 0.0, vs, -half,
            0.0, 0.0, 0.0, 1.0,
        ];
        Volume::new(vec![0.0; n * n * n], (n, n, n), (vs, vs, vs), affine).unwrap()
    }

    #[test]
    fn test_sphere_mask_basic() {
        let vol = reference(11, 2.0);
        let mask = create_sphere_mask(&vol, [0.0, 0.0, 0.0], 6.0).unwrap();
        // Centre voxel (5,5,5) is the origin
        assert_eq!(mask.data[vol.index(5, 5, 5)], 1.0);
        assert_eq!(mask.data[0], 0.0);
        // radius of 3 voxels
        let n = count(&mask);
        assert!(n > 50 && n < 200, "Sphere voxel count {} seems wrong", n);
    }

    #[test]
    fn test_sphere_mask_smaller_than_voxel() {
        let vol = reference(11, 2.0);
        let mask = create_sphere_mask(&vol, [0.6, 0.0, 0.0], 0.1).unwrap();
        assert_eq!(count(&mask), 1);
        assert_eq!(mask.data[vol.index(5, 5, 5)], 1.0);
    }

    #[test]
    fn test_binarize_two_sided() {
        let vol = reference(2, 1.0).with_data(vec![0.0, 3.0, -3.0, 1.0, 2.0, -0.5, 0.0, 5.0]).unwrap();
        assert_eq!(binarize(&vol, 2.0).data, vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        assert_eq!(count(&binarize(&vol, 0.0)), 6);
    }

    #[test]
    fn test_intersect_and_union() {
        let base = reference(2, 1.0);
        let a = base.with_data(vec![1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).unwrap();
        let b = base.with_data(vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0]).unwrap();
        let inter = intersect_masks(&[a.clone(), b.clone()], 1.0).unwrap();
        assert_eq!(count(&inter), 2);
        let union = intersect_masks(&[a.clone(), b.clone()], 0.0).unwrap();
        assert_eq!(count(&union), 4);
        assert!(intersect_masks(&[a, b], 1.5).is_err());
    }

    #[test]
    fn test_background_mask() {
        let mut vol = reference(8, 1.0);
        for k in 3..5 {
            for j in 3..5 {
                for i in 3..5 {
                    let idx = vol.index(i, j, k);
                    vol.data[idx] = 100.0;
                }
            }
        }
        let mask = background_mask(&vol).unwrap();
        assert_eq!(count(&mask), 8);
    }

    #[test]
    fn test_label_mask() {
        let atlas = reference(2, 1.0).with_data(vec![0.0, 1.0, 2.0, 3.0, 1.0, 2.0, 4.0, 0.0]).unwrap();
        let mask = label_mask(&atlas, &[1, 3]).unwrap();
        assert_eq!(mask.data, vec![0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_apply_mask() {
        let base = reference(2, 1.0);
        let img = base.with_data((1..=8).map(|v| v as f64).collect()).unwrap();
        let mask = base.with_data(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
        let out = apply_mask(&img, &mask).unwrap();
        assert_eq!(out.data, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 8.0]);
    }
}
