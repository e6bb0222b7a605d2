//! Tail probabilities and z conversions on top of statrs

use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use statrs::function::erf::{erfc, erfc_inv};

use crate::error::{FcError, Result};

const P_FLOOR: f64 = 1e-300;

/// Upper tail of the standard normal
pub fn norm_sf(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Inverse upper tail of the standard normal, `isf(p) = Phi^-1(1 - p)`
pub fn norm_isf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::INFINITY;
    }
    if p >= 1.0 {
        return f64::NEG_INFINITY;
    }
    std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

fn students_t(dof: f64) -> Result<StudentsT> {
    StudentsT::new(0.0, 1.0, dof).map_err(|e| FcError::Stats(format!("Student t with {} dof: {}", dof, e)))
}

/// One-sided p-value and its complement for a t statistic
pub fn t_sf_pair(t: f64, dof: f64) -> Result<(f64, f64)> {
    let dist = students_t(dof)?;
    Ok((dist.cdf(-t), dist.cdf(t)))
}

/// Two-sided p-value of a t statistic
pub fn t_two_sided(t: f64, dof: f64) -> Result<f64> {
    let dist = students_t(dof)?;
    Ok((2.0 * dist.cdf(-t.abs())).min(1.0))
}

/// Upper tail of F(d1, d2) and its complement
pub fn f_sf_pair(f: f64, d1: f64, d2: f64) -> Result<(f64, f64)> {
    if f <= 0.0 || !f.is_finite() {
        return Ok(if f.is_finite() { (1.0, 0.0) } else { (0.0, 1.0) });
    }
    let dist = FisherSnedecor::new(d1, d2).map_err(|e| FcError::Stats(format!("F({}, {}): {}", d1, d2, e)))?;
    let cdf = dist.cdf(f);
    Ok((1.0 - cdf, cdf))
}

/// z score with the same upper tail probability
///
/// `p` is the upper tail and `one_minus_p` its complement, computed
/// separately so that both tails keep full precision.
pub fn z_from_p(p: f64, one_minus_p: f64) -> f64 {
    if p.is_nan() {
        return f64::NAN;
    }
    if p <= 0.5 {
        norm_isf(p.max(P_FLOOR))
    } else {
        -norm_isf(one_minus_p.max(P_FLOOR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norm_isf_known_values() {
        assert!((norm_isf(0.05) - 1.6448536).abs() < 1e-6);
        assert!((norm_isf(0.0005) - 3.2905267).abs() < 1e-6);
        assert!(norm_isf(0.5).abs() < 1e-12);
        assert!((norm_sf(1.959964) - 0.025).abs() < 1e-6);
    }

    #[test]
    fn test_t_tail() {
        // t(10) 97.5% quantile is 2.228139
        let (p, q) = t_sf_pair(2.228139, 10.0).unwrap();
        assert!((p - 0.025).abs() < 1e-6);
        assert!((p + q - 1.0).abs() < 1e-12);
        assert!((t_two_sided(-2.228139, 10.0).unwrap() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_z_from_p_symmetry() {
        let z_hi = z_from_p(0.01, 0.99);
        let z_lo = z_from_p(0.99, 0.01);
        assert!((z_hi + z_lo).abs() < 1e-9);
        assert!(z_from_p(0.0, 1.0).is_finite());
    }

    #[test]
    fn test_f_tail() {
        // F(1, d) equals t(d)^2
        let (p_f, _) = f_sf_pair(2.228139f64.powi(2), 1.0, 10.0).unwrap();
        assert!((p_f - 0.05).abs() < 1e-5);
        assert_eq!(f_sf_pair(0.0, 1.0, 10.0).unwrap(), (1.0, 0.0));
    }
}
