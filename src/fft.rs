//! FFT wrapper for 1D transforms of voxel time series using rustfft
//!
//! Frequencies follow NumPy's conventions (`fftfreq`, `rfftfreq`).

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

/// FFT workspace that caches plans and scratch buffers for series of one length
pub struct FftWorkspace {
    n: usize,
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex64>,
    buffer: Vec<Complex64>,
}

impl FftWorkspace {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft(n, FftDirection::Forward);
        let ifft = planner.plan_fft(n, FftDirection::Inverse);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());

        Self {
            n,
            fft,
            ifft,
            scratch: vec![Complex64::new(0.0, 0.0); scratch_len],
            buffer: vec![Complex64::new(0.0, 0.0); n],
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// In-place forward FFT
    pub fn forward(&mut self, data: &mut [Complex64]) {
        self.fft.process_with_scratch(data, &mut self.scratch);
    }

    /// In-place inverse FFT (with 1/n normalization)
    pub fn inverse(&mut self, data: &mut [Complex64]) {
        self.ifft.process_with_scratch(data, &mut self.scratch);
        let scale = 1.0 / self.n as f64;
        for c in data.iter_mut() {
            *c *= scale;
        }
    }

    /// Multiply the spectrum of a real signal by a real gain (one value per
    /// `fftfreq` bin) and write the filtered signal back in place
    pub fn filter_real_inplace(&mut self, signal: &mut [f64], gain: &[f64]) {
        debug_assert_eq!(signal.len(), self.n);
        debug_assert_eq!(gain.len(), self.n);

        for (b, &x) in self.buffer.iter_mut().zip(signal.iter()) {
            *b = Complex64::new(x, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        for (b, &g) in self.buffer.iter_mut().zip(gain) {
            *b *= g;
        }
        self.ifft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / self.n as f64;
        for (x, b) in signal.iter_mut().zip(self.buffer.iter()) {
            *x = b.re * scale;
        }
    }

    /// |X_k|^2 for the non-negative frequency bins (length n/2 + 1)
    pub fn power_one_sided(&mut self, signal: &[f64]) -> Vec<f64> {
        for (b, &x) in self.buffer.iter_mut().zip(signal.iter()) {
            *b = Complex64::new(x, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        self.buffer[..self.n / 2 + 1]
            .iter()
            .map(|c| c.norm_sqr())
            .collect()
    }
}

/// Forward FFT of a real signal
pub fn fft_real(data: &[f64]) -> Vec<Complex64> {
    let mut ws = FftWorkspace::new(data.len());
    let mut out: Vec<Complex64> = data.iter().map(|&x| Complex64::new(x, 0.0)).collect();
    ws.forward(&mut out);
    out
}

/// Inverse FFT keeping only the real part
pub fn ifft_real(data: &[Complex64]) -> Vec<f64> {
    let mut ws = FftWorkspace::new(data.len());
    let mut buf = data.to_vec();
    ws.inverse(&mut buf);
    buf.iter().map(|c| c.re).collect()
}

/// Generate FFT frequency values
/// Matches numpy.fft.fftfreq(n, d)
pub fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let val = 1.0 / (n as f64 * d);
    let n_pos = (n + 1) / 2; // bins 0..=ceil(n/2)-1 are non-negative
    (0..n)
        .map(|i| {
            if i < n_pos {
                i as f64 * val
            } else {
                (i as i64 - n as i64) as f64 * val
            }
        })
        .collect()
}

/// Non-negative frequency values, numpy.fft.rfftfreq(n, d)
pub fn rfftfreq(n: usize, d: f64) -> Vec<f64> {
    let val = 1.0 / (n as f64 * d);
    (0..=n / 2).map(|i| i as f64 * val).collect()
}
