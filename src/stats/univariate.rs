//! Two-sided univariate tests used in the result reports

use crate::error::{FcError, Result};
use crate::stats::dist::t_two_sided;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    pub statistic: f64,
    pub dof: f64,
    pub p_value: f64,
}

pub fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

/// Sample variance (n - 1 denominator)
pub fn variance(x: &[f64]) -> f64 {
    let m = mean(x);
    x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (x.len() as f64 - 1.0)
}

/// Standard error of the mean
pub fn sem(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    (variance(x) / x.len() as f64).sqrt()
}

fn require(x: &[f64], n: usize, what: &str) -> Result<()> {
    if x.len() < n {
        return Err(FcError::Stats(format!("{} needs at least {} values, got {}", what, n, x.len())));
    }
    Ok(())
}

/// Independent two-sample t-test with pooled variance
pub fn ttest_ind(a: &[f64], b: &[f64]) -> Result<TestResult> {
    require(a, 2, "ttest_ind")?;
    require(b, 2, "ttest_ind")?;
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let dof = na + nb - 2.0;
    let pooled = ((na - 1.0) * variance(a) + (nb - 1.0) * variance(b)) / dof;
    let se = (pooled * (1.0 / na + 1.0 / nb)).sqrt();
    let t = (mean(a) - mean(b)) / se;
    Ok(TestResult { statistic: t, dof, p_value: t_two_sided(t, dof)? })
}

/// Paired t-test of `a - b`
pub fn ttest_rel(a: &[f64], b: &[f64]) -> Result<TestResult> {
    if a.len() != b.len() {
        return Err(FcError::Shape(format!("paired samples differ in length: {} vs {}", a.len(), b.len())));
    }
    require(a, 2, "ttest_rel")?;
    let d: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    let dof = d.len() as f64 - 1.0;
    let t = mean(&d) / sem(&d);
    Ok(TestResult { statistic: t, dof, p_value: t_two_sided(t, dof)? })
}

/// Pearson correlation and its two-sided p-value
pub fn pearsonr(x: &[f64], y: &[f64]) -> Result<(f64, f64)> {
    if x.len() != y.len() {
        return Err(FcError::Shape(format!("pearsonr inputs differ in length: {} vs {}", x.len(), y.len())));
    }
    require(x, 3, "pearsonr")?;
    let (mx, my) = (mean(x), mean(y));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return Err(FcError::Stats("pearsonr of a constant input".to_string()));
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    let dof = x.len() as f64 - 2.0;
    if (1.0 - r.abs()) < 1e-15 {
        return Ok((r, 0.0));
    }
    let t = r * (dof / (1.0 - r * r)).sqrt();
    Ok((r, t_two_sided(t, dof)?))
}

/// Cohen's d with pooled standard deviation
pub fn cohen_d(a: &[f64], b: &[f64]) -> Result<f64> {
    require(a, 2, "cohen_d")?;
    require(b, 2, "cohen_d")?;
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let pooled = (((na - 1.0) * variance(a) + (nb - 1.0) * variance(b)) / (na + nb - 2.0)).sqrt();
    Ok((mean(a) - mean(b)) / pooled)
}
