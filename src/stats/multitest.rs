//! Multiple-comparison corrections of p-value vectors

/// Benjamini-Hochberg adjusted p-values (same order as the input)
pub fn fdr_bh(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| pvals[a].total_cmp(&pvals[b]));

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0f64;
    for rank in (0..n).rev() {
        let i = order[rank];
        let candidate = pvals[i] * n as f64 / (rank + 1) as f64;
        running_min = running_min.min(candidate);
        adjusted[i] = running_min.min(1.0);
    }
    adjusted
}

/// Bonferroni adjusted p-values, capped at one
pub fn bonferroni(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len() as f64;
    pvals.iter().map(|&p| (p * n).min(1.0)).collect()
}

/// Rejection decisions at level `alpha` for adjusted p-values
pub fn reject(adjusted: &[f64], alpha: f64) -> Vec<bool> {
    adjusted.iter().map(|&p| p <= alpha).collect()
}
