//! Temporal processing of voxel/region time series
//!
//! Cleaning runs in the order detrend -> band-pass -> standardize. The band-pass
//! is an ideal FFT filter between the high-pass and low-pass cut-offs.

use rayon::prelude::*;

use crate::error::{FcError, Result};
use crate::fft::{fftfreq, FftWorkspace};

/// Options for [`clean`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanOptions {
    pub detrend: bool,
    pub standardize: bool,
    pub high_pass: Option<f64>,
    pub low_pass: Option<f64>,
    /// Repetition time in seconds (required for filtering)
    pub t_r: Option<f64>,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            detrend: false,
            standardize: true,
            high_pass: None,
            low_pass: None,
            t_r: None,
        }
    }
}

impl CleanOptions {
    fn filters(&self) -> bool {
        self.high_pass.is_some() || self.low_pass.is_some()
    }
}

/// Frequency response of the ideal band-pass filter on `fftfreq(n, t_r)` bins
pub fn band_pass_gain(n: usize, t_r: f64, high_pass: Option<f64>, low_pass: Option<f64>) -> Vec<f64> {
    fftfreq(n, t_r)
        .into_iter()
        .map(|f| {
            let f = f.abs();
            let above = high_pass.map_or(true, |hp| f >= hp);
            let below = low_pass.map_or(true, |lp| f <= lp);
            if above && below { 1.0 } else { 0.0 }
        })
        .collect()
}

/// Remove the least-squares line (slope and offset)
pub fn detrend_linear(x: &mut [f64]) {
    let n = x.len();
    if n < 2 {
        x.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let t_mean = (n as f64 - 1.0) / 2.0;
    let x_mean = x.iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (t, &v) in x.iter().enumerate() {
        let dt = t as f64 - t_mean;
        sxy += dt * (v - x_mean);
        sxx += dt * dt;
    }
    let slope = sxy / sxx;
    for (t, v) in x.iter_mut().enumerate() {
        *v -= x_mean + slope * (t as f64 - t_mean);
    }
}

/// Z-score with population standard deviation; constant series become zeros
pub fn zscore_inplace(x: &mut [f64]) {
    let n = x.len() as f64;
    if n == 0.0 {
        return;
    }
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = var.sqrt();
    let std = if std < f64::EPSILON { 1.0 } else { std };
    x.iter_mut().for_each(|v| *v = (*v - mean) / std);
}

fn clean_one(x: &mut [f64], opts: &CleanOptions, gain: Option<&[f64]>, ws: &mut FftWorkspace) {
    if opts.detrend {
        detrend_linear(x);
    }
    if let Some(gain) = gain {
        ws.filter_real_inplace(x, gain);
    }
    if opts.standardize {
        zscore_inplace(x);
    }
}

/// Clean a set of time series (one `Vec` per voxel/region), in parallel
pub fn clean(signals: &mut [Vec<f64>], opts: &CleanOptions) -> Result<()> {
    let n_t = match signals.first() {
        Some(s) => s.len(),
        None => return Ok(()),
    };
    if signals.iter().any(|s| s.len() != n_t) {
        return Err(FcError::Shape("time series of unequal length".to_string()));
    }

    let gain = if opts.filters() {
        let t_r = opts
            .t_r
            .ok_or_else(|| FcError::Config("temporal filtering requires a repetition time".to_string()))?;
        Some(band_pass_gain(n_t, t_r, opts.high_pass, opts.low_pass))
    } else {
        None
    };

    signals.par_iter_mut().for_each_init(
        || FftWorkspace::new(n_t),
        |ws, s| clean_one(s, opts, gain.as_deref(), ws),
    );
    Ok(())
}

/// Clean a single time series
pub fn clean_series(signal: &mut Vec<f64>, opts: &CleanOptions) -> Result<()> {
    clean(std::slice::from_mut(signal), opts)
}

/// Welch power spectrum of a real signal
///
/// Periodic Hann window, segments of `min(256, n)` samples with 50% overlap,
/// no detrending, "spectrum" scaling, one-sided. Returns (frequencies, power).
pub fn welch_spectrum(x: &[f64], fs: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    let n = x.len();
    if n < 2 {
        return Err(FcError::Stats(format!("{} samples are too few for a spectrum", n)));
    }
    let nperseg = n.min(256);
    let step = nperseg - nperseg / 2;

    let window: Vec<f64> = (0..nperseg)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / nperseg as f64).cos())
        .collect();
    let win_sum: f64 = window.iter().sum();
    let scale = 1.0 / (win_sum * win_sum);

    let mut ws = FftWorkspace::new(nperseg);
    let n_freq = nperseg / 2 + 1;
    let mut acc = vec![0.0; n_freq];
    let mut n_seg = 0usize;
    let mut segment = vec![0.0; nperseg];

    let mut start = 0;
    while start + nperseg <= n {
        for (s, (&v, &w)) in segment.iter_mut().zip(x[start..start + nperseg].iter().zip(&window)) {
            *s = v * w;
        }
        for (a, p) in acc.iter_mut().zip(ws.power_one_sided(&segment)) {
            *a += p;
        }
        n_seg += 1;
        start += step;
    }

    let last_doubled = if nperseg % 2 == 0 { n_freq - 1 } else { n_freq };
    let power: Vec<f64> = acc
        .iter()
        .enumerate()
        .map(|(k, &a)| {
            let p = a * scale / n_seg as f64;
            if k > 0 && k < last_doubled { 2.0 * p } else { p }
        })
        .collect();

    let freqs = (0..n_freq).map(|k| k as f64 * fs / nperseg as f64).collect();
    Ok((freqs, power))
}

/// ALFF and fALFF of a (cleaned) time series
///
/// ALFF = sqrt(mean power in `band`), fALFF = ALFF / sqrt(mean power up to `total_max`).
pub fn alff(x: &[f64], t_r: f64, band: (f64, f64), total_max: f64) -> Result<(f64, f64)> {
    let (freqs, power) = welch_spectrum(x, 1.0 / t_r)?;

    let mean_where = |pred: &dyn Fn(f64) -> bool| -> Option<f64> {
        let vals: Vec<f64> = freqs
            .iter()
            .zip(&power)
            .filter(|(&f, _)| pred(f))
            .map(|(_, &p)| p)
            .collect();
        if vals.is_empty() {
            None
        } else {
            Some(vals.iter().sum::<f64>() / vals.len() as f64)
        }
    };

    let low = mean_where(&|f| f >= band.0 && f <= band.1)
        .ok_or_else(|| FcError::Stats("no frequency bin inside the ALFF band".to_string()))?;
    let total = mean_where(&|f| f <= total_max).unwrap_or(0.0);

    let alff = low.sqrt();
    let falff = if total > 0.0 { alff / total.sqrt() } else { f64::NAN };
    Ok((alff, falff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine(n: usize, t_r: f64, freq: f64) -> Vec<f64> {
        (0..n).map(|t| (2.0 * PI * freq * t as f64 * t_r).sin()).collect()
    }

    #[test]
    fn test_detrend_removes_line() {
        let mut x: Vec<f64> = (0..20).map(|t| 3.0 + 0.5 * t as f64).collect();
        detrend_linear(&mut x);
        assert!(x.iter().all(|v| v.abs() < 1e-10));
    }

    #[test]
    fn test_zscore() {
        let mut x = vec![1.0, 2.0, 3.0, 4.0];
        zscore_inplace(&mut x);
        let mean: f64 = x.iter().sum::<f64>() / 4.0;
        let var: f64 = x.iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-12);
        assert!((var - 1.0).abs() < 1e-12);

        let mut c = vec![2.0; 5];
        zscore_inplace(&mut c);
        assert!(c.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_band_pass_keeps_in_band_and_drops_out_of_band() {
        let n = 200;
        let t_r = 1.0;
        // 0.05 Hz and 0.3 Hz land exactly on bins for n = 200
        let slow = sine(n, t_r, 0.05);
        let fast = sine(n, t_r, 0.3);
        let mut mixed: Vec<f64> = slow.iter().zip(&fast).map(|(a, b)| a + b).collect();

        let opts = CleanOptions {
            detrend: false,
            standardize: false,
            high_pass: Some(0.01),
            low_pass: Some(0.1),
            t_r: Some(t_r),
        };
        clean_series(&mut mixed, &opts).unwrap();
        for (a, b) in mixed.iter().zip(&slow) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_filter_without_tr_is_an_error() {
        let mut s = vec![vec![0.0; 10]];
        let opts = CleanOptions { low_pass: Some(0.1), ..Default::default() };
        assert!(clean(&mut s, &opts).is_err());
    }

    #[test]
    fn test_welch_sine_peak() {
        let t_r = 0.5;
        let x = sine(512, t_r, 0.25);
        let (freqs, power) = welch_spectrum(&x, 1.0 / t_r).unwrap();
        assert_eq!(freqs.len(), 129);
        let peak = power
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &p)| if p > acc.1 { (i, p) } else { acc });
        assert!((freqs[peak.0] - 0.25).abs() < 1e-9);
        // spectrum scaling: amplitude-1 sine has power ~0.5 at its bin
        assert!((peak.1 - 0.5).abs() < 0.05, "peak power {}", peak.1);
    }

    #[test]
    fn test_alff_of_low_frequency_signal() {
        let t_r = 0.83;
        let slow = sine(300, t_r, 0.04);
        let (a, f) = alff(&slow, t_r, (0.01, 0.08), 0.25).unwrap();
        assert!(a > 0.0);
        assert!(f > 1.0, "fALFF {} should exceed one for in-band power", f);
    }
}
