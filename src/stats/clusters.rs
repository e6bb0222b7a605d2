//! Cluster tables of thresholded statistical maps
//!
//! Each supra-threshold cluster yields one row for its peak followed by up to
//! three sub-peaks (`1a`, `1b`, `1c`) that are local maxima at least
//! `min_distance` mm away from every stronger peak of the cluster.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::utils::labels::{cluster_sizes, label_components};
use crate::volume::Volume;

const MAX_SUBPEAKS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterRow {
    #[serde(rename = "Cluster ID")]
    pub id: String,
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
    #[serde(rename = "Peak Stat")]
    pub peak_stat: f64,
    /// Cluster volume in mm3, absent on sub-peak rows
    #[serde(rename = "Cluster Size (mm3)")]
    pub size_mm3: Option<f64>,
}

/// Local maxima of `data` restricted to `members`, strongest first
fn local_maxima(data: &[f64], members: &[usize], dims: (usize, usize, usize), in_cluster: &[bool]) -> Vec<usize> {
    let (nx, ny, nz) = dims;
    let mut peaks: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&idx| {
            let i = idx % nx;
            let j = (idx / nx) % ny;
            let k = idx / (nx * ny);
            let v = data[idx];
            let mut lowest = v;
            for dk in -1i64..=1 {
                for dj in -1i64..=1 {
                    for di in -1i64..=1 {
                        let (ni, nj, nk) = (i as i64 + di, j as i64 + dj, k as i64 + dk);
                        if ni < 0 || nj < 0 || nk < 0 || ni >= nx as i64 || nj >= ny as i64 || nk >= nz as i64 {
                            continue;
                        }
                        // outside the cluster counts as zero
                        let nidx = ni as usize + nj as usize * nx + nk as usize * nx * ny;
                        let nv = if in_cluster[nidx] { data[nidx] } else { 0.0 };
                        if nv > v {
                            return false;
                        }
                        lowest = lowest.min(nv);
                    }
                }
            }
            v > lowest
        })
        .collect();
    peaks.sort_by(|&a, &b| data[b].total_cmp(&data[a]).then(a.cmp(&b)));
    peaks
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// Cluster table of `stat_map` above `stat_threshold`
///
/// Clusters of `cluster_threshold` voxels or fewer are skipped. With
/// `two_sided` negative clusters follow the positive ones, numbered on.
pub fn get_clusters_table(
    stat_map: &Volume,
    stat_threshold: f64,
    cluster_threshold: usize,
    two_sided: bool,
    min_distance: f64,
) -> Vec<ClusterRow> {
    let signs: &[f64] = if two_sided { &[1.0, -1.0] } else { &[1.0] };
    let voxel_volume = stat_map.voxel_volume();
    let mut rows = Vec::new();
    let mut next_id = 1;

    for &sign in signs {
        let signed: Vec<f64> = stat_map.data.iter().map(|&v| v * sign).collect();
        let supra: Vec<bool> = signed.iter().map(|&v| v > stat_threshold).collect();
        let (labels, n_labels) = label_components(&supra, stat_map.dims);
        let sizes = cluster_sizes(&labels, n_labels);

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_labels + 1];
        for (idx, &l) in labels.iter().enumerate() {
            if l > 0 {
                members[l].push(idx);
            }
        }
        let mut clusters: Vec<(usize, f64)> = (1..=n_labels)
            .filter(|&l| sizes[l] > cluster_threshold)
            .map(|l| {
                let peak = members[l].iter().map(|&i| signed[i]).fold(f64::NEG_INFINITY, f64::max);
                (l, peak)
            })
            .collect();
        clusters.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (label, _) in clusters {
            let in_cluster: Vec<bool> = labels.iter().map(|&l| l == label).collect();
            let peaks = local_maxima(&signed, &members[label], stat_map.dims, &in_cluster);

            let mut kept: Vec<(usize, [f64; 3])> = Vec::new();
            for idx in peaks {
                let (i, j, k) = stat_map.coords(idx);
                let xyz = stat_map.voxel_to_world(i as f64, j as f64, k as f64);
                if kept.iter().all(|&(_, other)| distance(xyz, other) > min_distance) {
                    kept.push((idx, xyz));
                }
                if kept.len() > MAX_SUBPEAKS {
                    break;
                }
            }

            for (n, &(idx, xyz)) in kept.iter().enumerate() {
                let (id, size_mm3) = if n == 0 {
                    (next_id.to_string(), Some((sizes[label] as f64 * voxel_volume).trunc()))
                } else {
                    (format!("{}{}", next_id, (b'a' + (n - 1) as u8) as char), None)
                };
                rows.push(ClusterRow {
                    id,
                    x: xyz[0],
                    y: xyz[1],
                    z: xyz[2],
                    peak_stat: signed[idx] * sign,
                    size_mm3,
                });
            }
            next_id += 1;
        }
    }
    rows
}

/// Aligned text rendering for logs
pub fn format_clusters_table(rows: &[ClusterRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>10} {:>8} {:>8} {:>8} {:>10} {:>18}",
        "Cluster ID", "X", "Y", "Z", "Peak Stat", "Cluster Size (mm3)"
    );
    for r in rows {
        let size = r.size_mm3.map_or_else(String::new, |s| format!("{:.0}", s));
        let _ = writeln!(
            out,
            "{:>10} {:>8.1} {:>8.1} {:>8.1} {:>10.3} {:>18}",
            r.id, r.x, r.y, r.z, r.peak_stat, size
        );
    }
    out
}

pub fn write_clusters_csv(path: &Path, rows: &[ClusterRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for r in rows {
        writer.serialize(r)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(values: Vec<f64>, dims: (usize, usize, usize), voxel: f64) -> Volume {
        let affine = [voxel, 0.0, 0.0, 0.0, 0.0, voxel, 0.0, 0.0, 0.0, 0.0, voxel, 0.0, 0.0, 0.0, 0.0, 1.0];
        Volume::new(values, dims, (voxel, voxel, voxel), affine).unwrap()
    }

    #[test]
    fn test_positive_and_negative_clusters() {
        let mut v = vec![0.0; 10];
        v[1] = 4.0;
        v[2] = 5.0;
        v[7] = -6.0;
        let stat = volume(v, (10, 1, 1), 2.0);
        let rows = get_clusters_table(&stat, 3.0, 0, true, 5.0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "1");
        assert_eq!(rows[0].peak_stat, 5.0);
        assert_eq!(rows[0].x, 4.0);
        assert_eq!(rows[0].size_mm3, Some(16.0));
        assert_eq!(rows[1].id, "2");
        assert_eq!(rows[1].peak_stat, -6.0);

        let one_sided = get_clusters_table(&stat, 3.0, 0, false, 5.0);
        assert_eq!(one_sided.len(), 1);
    }

    #[test]
    fn test_subpeaks_respect_min_distance() {
        // two maxima 8 mm apart and one 2 mm from the main peak
        let v = vec![0.0, 9.0, 4.0, 4.0, 4.0, 4.0, 4.0, 4.0, 4.0, 7.0, 0.0];
        let stat = volume(v, (11, 1, 1), 1.0);
        let rows = get_clusters_table(&stat, 3.0, 0, false, 5.0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "1");
        assert_eq!(rows[1].id, "1a");
        assert_eq!(rows[1].peak_stat, 7.0);
        assert_eq!(rows[1].size_mm3, None);
    }

    #[test]
    fn test_cluster_threshold_skips_small() {
        let v = vec![5.0, 0.0, 5.0, 5.0, 0.0];
        let stat = volume(v, (5, 1, 1), 1.0);
        let rows = get_clusters_table(&stat, 3.0, 1, true, 5.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size_mm3, Some(2.0));
        assert!(format_clusters_table(&rows).contains("Peak Stat"));
    }
}
