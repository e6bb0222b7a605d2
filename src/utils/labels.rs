//! Connected-component labelling (face connectivity) and cluster-extent filtering

use std::collections::VecDeque;

use crate::volume::idx3d;

/// Label connected components of `mask`
///
/// Returns a label per voxel (0 = background, 1..=n clusters) and the number
/// of clusters. Labels are assigned in scan order.
pub fn label_components(mask: &[bool], dims: (usize, usize, usize)) -> (Vec<usize>, usize) {
    let (nx, ny, nz) = dims;
    let mut labels = vec![0usize; mask.len()];
    let mut n_labels = 0;
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || labels[start] != 0 {
            continue;
        }
        n_labels += 1;
        labels[start] = n_labels;
        queue.push_back(start);

        while let Some(idx) = queue.pop_front() {
            let i = idx % nx;
            let j = (idx / nx) % ny;
            let k = idx / (nx * ny);

            let mut visit = |ni: usize, nj: usize, nk: usize| {
                let nidx = idx3d(ni, nj, nk, nx, ny);
                if mask[nidx] && labels[nidx] == 0 {
                    labels[nidx] = n_labels;
                    queue.push_back(nidx);
                }
            };
            if i > 0 { visit(i - 1, j, k); }
            if i + 1 < nx { visit(i + 1, j, k); }
            if j > 0 { visit(i, j - 1, k); }
            if j + 1 < ny { visit(i, j + 1, k); }
            if k > 0 { visit(i, j, k - 1); }
            if k + 1 < nz { visit(i, j, k + 1); }
        }
    }

    (labels, n_labels)
}

/// Voxel count per label; index 0 holds the background count
pub fn cluster_sizes(labels: &[usize], n_labels: usize) -> Vec<usize> {
    let mut sizes = vec![0usize; n_labels + 1];
    for &l in labels {
        sizes[l] += 1;
    }
    sizes
}

/// Zero clusters of at most `cluster_threshold` voxels
///
/// Positive and negative values are clustered separately.
pub fn cluster_size_filter(data: &mut [f64], dims: (usize, usize, usize), cluster_threshold: usize) {
    if cluster_threshold == 0 {
        return;
    }
    for sign in [1.0, -1.0] {
        let mask: Vec<bool> = data.iter().map(|&v| v * sign > 0.0).collect();
        let (labels, n) = label_components(&mask, dims);
        let sizes = cluster_sizes(&labels, n);
        for (v, &l) in data.iter_mut().zip(&labels) {
            if l > 0 && sizes[l] <= cluster_threshold {
                *v = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_components() {
        let dims = (5, 1, 1);
        let mask = [true, true, false, true, false];
        let (labels, n) = label_components(&mask, dims);
        assert_eq!(n, 2);
        assert_eq!(labels, vec![1, 1, 0, 2, 0]);
        assert_eq!(cluster_sizes(&labels, n), vec![2, 2, 1]);
    }

    #[test]
    fn test_diagonal_is_not_connected() {
        let dims = (2, 2, 1);
        let mask = [true, false, false, true];
        let (_, n) = label_components(&mask, dims);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_connectivity_across_slices() {
        let dims = (2, 2, 2);
        let mut mask = [false; 8];
        mask[idx3d(0, 0, 0, 2, 2)] = true;
        mask[idx3d(0, 0, 1, 2, 2)] = true;
        mask[idx3d(1, 0, 1, 2, 2)] = true;
        let (_, n) = label_components(&mask, dims);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_cluster_size_filter_signs_separately() {
        let dims = (6, 1, 1);
        // + + - - - 0 : the positive pair is a cluster of 2, the negatives of 3
        let mut data = vec![1.0, 2.0, -1.0, -1.0, -3.0, 0.0];
        cluster_size_filter(&mut data, dims, 2);
        assert_eq!(data, vec![0.0, 0.0, -1.0, -1.0, -3.0, 0.0]);
    }
}
