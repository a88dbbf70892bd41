//! Welch power spectral density and simple time-domain statistics.
//!
//! Shared by the bad-channel detector, the component scorer and QC.
use std::f64::consts::PI;

use rustfft::{num_complex::Complex, FftPlanner};

/// One-sided power spectrum.
#[derive(Debug, Clone)]
pub struct Psd {
    /// Bin centre frequencies in Hz, `0 ..= sfreq/2`.
    pub freqs: Vec<f64>,
    /// Power per bin (units² / Hz).
    pub power: Vec<f64>,
}

impl Psd {
    /// Summed power over bins with `lo <= f <= hi`.
    pub fn band_power(&self, lo: f64, hi: f64) -> f64 {
        self.freqs
            .iter()
            .zip(&self.power)
            .filter(|(f, _)| **f >= lo && **f <= hi)
            .map(|(_, p)| p)
            .sum()
    }

    /// Summed power over all bins except DC.
    pub fn total_power(&self) -> f64 {
        self.power.iter().skip(1).sum()
    }

    /// `band_power(lo, hi) / total_power()`, or 0 for a silent signal.
    pub fn band_ratio(&self, lo: f64, hi: f64) -> f64 {
        let total = self.total_power();
        if total > 0.0 { self.band_power(lo, hi) / total } else { 0.0 }
    }
}

/// Segment length used for a `sfreq` recording: about two seconds, rounded
/// up to a power of two and never longer than the signal.
pub fn default_nperseg(sfreq: f64, n: usize) -> usize {
    let target = (2.0 * sfreq).round().max(8.0) as usize;
    target.next_power_of_two().min(n.max(1))
}

/// Welch PSD: Hann-windowed segments of `nperseg` samples with 50 % overlap,
/// mean-detrended, averaged.  Density scaling as in `scipy.signal.welch`.
pub fn welch(x: &[f64], sfreq: f64, nperseg: usize) -> Psd {
    let nperseg = nperseg.clamp(1, x.len().max(1));
    let step = (nperseg / 2).max(1);
    let win = hann(nperseg);
    let win_pow: f64 = win.iter().map(|w| w * w).sum();
    let n_bins = nperseg / 2 + 1;

    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let fft = planner.plan_fft_forward(nperseg);
    let mut acc = vec![0.0_f64; n_bins];
    let mut n_seg = 0usize;
    let mut buf = vec![Complex::<f64>::default(); nperseg];

    let mut start = 0;
    while start + nperseg <= x.len() {
        let seg = &x[start..start + nperseg];
        let mean = seg.iter().sum::<f64>() / nperseg as f64;
        for ((b, &v), &w) in buf.iter_mut().zip(seg).zip(&win) {
            *b = Complex { re: (v - mean) * w, im: 0.0 };
        }
        fft.process(&mut buf);
        for (a, c) in acc.iter_mut().zip(&buf) {
            *a += c.norm_sqr();
        }
        n_seg += 1;
        start += step;
    }

    let scale = if n_seg > 0 && win_pow > 0.0 {
        1.0 / (sfreq * win_pow * n_seg as f64)
    } else {
        0.0
    };
    let power = acc
        .iter()
        .enumerate()
        .map(|(k, &p)| {
            // One-sided: double everything except DC and (even-length) Nyquist.
            let edge = k == 0 || (nperseg % 2 == 0 && k == n_bins - 1);
            p * scale * if edge { 1.0 } else { 2.0 }
        })
        .collect();
    let freqs = (0..n_bins).map(|k| k as f64 * sfreq / nperseg as f64).collect();
    Psd { freqs, power }
}

/// Symmetric Hann window.
pub fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos()))
        .collect()
}

pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() { 0.0 } else { x.iter().sum::<f64>() / x.len() as f64 }
}

/// Population standard deviation.
pub fn std(x: &[f64]) -> f64 {
    let m = mean(x);
    if x.is_empty() {
        return 0.0;
    }
    (x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
}

/// Excess kurtosis (0 for a Gaussian).
pub fn kurtosis(x: &[f64]) -> f64 {
    let n = x.len() as f64;
    if n < 4.0 {
        return 0.0;
    }
    let m = mean(x);
    let var = x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if var <= f64::EPSILON {
        return 0.0;
    }
    x.iter().map(|v| ((v - m) * (v - m) / var).powi(2)).sum::<f64>() / n - 3.0
}

/// Median of a slice (NaN-free input).
pub fn median(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let mut v = x.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n % 2 == 1 { v[n / 2] } else { 0.5 * (v[n / 2 - 1] + v[n / 2]) }
}

/// Pearson correlation; 0 when either side is constant.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let (ma, mb) = (mean(a), mean(b));
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    let denom = (saa * sbb).sqrt();
    if denom > 0.0 { sab / denom } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(freq: f64, sfreq: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / sfreq).sin()).collect()
    }

    #[test]
    fn welch_peak_at_sine_frequency() {
        let x = sine(10.0, 256.0, 256 * 8);
        let psd = welch(&x, 256.0, 512);
        let (k, _) = psd
            .power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_abs_diff_eq!(psd.freqs[k], 10.0, epsilon = 0.5);
        assert!(psd.band_ratio(9.0, 11.0) > 0.95);
    }

    #[test]
    fn welch_integrates_to_variance() {
        // Parseval: ∫ PSD df ≈ variance (0.5 for a unit sine).
        let x = sine(20.0, 200.0, 200 * 10);
        let psd = welch(&x, 200.0, 400);
        let df = psd.freqs[1] - psd.freqs[0];
        let var: f64 = psd.power.iter().sum::<f64>() * df;
        assert_abs_diff_eq!(var, 0.5, epsilon = 0.02);
    }

    #[test]
    fn silent_signal_has_zero_ratio() {
        let psd = welch(&vec![0.0; 1024], 256.0, 256);
        assert_eq!(psd.band_ratio(1.0, 4.0), 0.0);
    }

    #[test]
    fn kurtosis_of_spiky_signal_is_large() {
        let mut x = vec![0.0; 1000];
        for i in (0..1000).step_by(100) {
            x[i] = 10.0;
        }
        assert!(kurtosis(&x) > 5.0);
        assert_abs_diff_eq!(kurtosis(&sine(3.0, 100.0, 1000)), -1.5, epsilon = 0.05);
    }

    #[test]
    fn median_and_correlation() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        let a = sine(5.0, 100.0, 500);
        let b: Vec<f64> = a.iter().map(|v| -2.0 * v).collect();
        assert_abs_diff_eq!(correlation(&a, &b), -1.0, epsilon = 1e-12);
        assert_eq!(correlation(&a, &vec![1.0; 500]), 0.0);
    }
}
