//! FIR filter design matching MNE / `scipy.signal.firwin`.
//!
//! All kernels are Hamming-windowed sincs of odd length (linear phase):
//!   • low-edge transition  = min(max(0.25 · l_freq, 2), l_freq)
//!   • high-edge transition = min(max(0.25 · h_freq, 2), nyquist − h_freq)
//!   • filter length N      = ceil(3.3 / trans_bw · sfreq), rounded to odd
//! Band-pass kernels are differences of unit-DC low-passes; band-stop
//! kernels are a delta minus a band-pass.
use std::f64::consts::PI;

use crate::error::{CleanError, Result};

/// Transition bandwidth at a low (high-pass) edge.
pub fn low_trans_bandwidth(l_freq: f32) -> f32 {
    (0.25 * l_freq).max(2.0).min(l_freq)
}

/// Transition bandwidth at a high (low-pass) edge.
pub fn high_trans_bandwidth(h_freq: f32, sfreq: f32) -> f32 {
    (0.25 * h_freq).max(2.0).min(sfreq / 2.0 - h_freq)
}

/// Number of taps for a transition bandwidth; always odd.
pub fn auto_filter_length(trans_bw: f32, sfreq: f32) -> usize {
    let n_raw = (3.3 / trans_bw * sfreq).ceil() as usize;
    if n_raw % 2 == 0 { n_raw + 1 } else { n_raw }
}

/// Hamming-windowed sinc with the -6 dB point at `cutoff_hz`.
///
/// `pass_zero = true` gives a unit-DC low-pass, `false` its spectral
/// inversion.  `n` must be odd.
pub fn firwin(n: usize, cutoff_hz: f32, sfreq: f32, pass_zero: bool) -> Vec<f64> {
    debug_assert!(n % 2 == 1, "firwin requires odd N for a linear-phase filter");
    let alpha = (n - 1) as f64 / 2.0;
    let fc = cutoff_hz as f64 / (sfreq as f64 / 2.0);
    let win = hamming(n);

    let mut h: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - alpha;
            // sin(π·fc·x) / (π·x) → fc as x → 0
            let sinc = if x == 0.0 { fc } else { (PI * fc * x).sin() / (PI * x) };
            sinc * win[i]
        })
        .collect();

    let s: f64 = h.iter().sum();
    h.iter_mut().for_each(|v| *v /= s);

    if !pass_zero {
        h.iter_mut().for_each(|v| *v = -*v);
        h[n / 2] += 1.0;
    }
    h
}

/// Hamming window of length `n`.
pub fn hamming(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Zero-phase band-pass between `l_freq` and `h_freq`.
///
/// Fails with a configuration error when the band does not fit below the
/// Nyquist frequency of `sfreq`.
pub fn design_bandpass(l_freq: f32, h_freq: f32, sfreq: f32) -> Result<Vec<f32>> {
    let nyq = sfreq / 2.0;
    if !(l_freq > 0.0 && l_freq < h_freq && h_freq < nyq) {
        return Err(CleanError::Config(format!(
            "band-pass {l_freq}-{h_freq} Hz is invalid for a Nyquist frequency of {nyq} Hz"
        )));
    }
    let l_tb = low_trans_bandwidth(l_freq);
    let h_tb = high_trans_bandwidth(h_freq, sfreq);
    if h_tb <= 0.0 {
        return Err(CleanError::Config(format!(
            "no room for a transition band above {h_freq} Hz (Nyquist {nyq} Hz)"
        )));
    }
    let n = auto_filter_length(l_tb.min(h_tb), sfreq);
    let hi = firwin(n, h_freq + h_tb / 2.0, sfreq, true);
    let lo = firwin(n, l_freq - l_tb / 2.0, sfreq, true);
    Ok(hi.iter().zip(&lo).map(|(a, b)| (a - b) as f32).collect())
}

/// Zero-phase band-stop centred on `freq` with a stop band of `width` Hz.
pub fn design_bandstop(freq: f32, width: f32, trans_bw: f32, sfreq: f32) -> Result<Vec<f32>> {
    let nyq = sfreq / 2.0;
    let lo = freq - width / 2.0 - trans_bw / 2.0;
    let hi = freq + width / 2.0 + trans_bw / 2.0;
    if !(trans_bw > 0.0 && width >= 0.0 && lo > 0.0 && hi < nyq) {
        return Err(CleanError::Config(format!(
            "notch at {freq} Hz (width {width}, transition {trans_bw}) \
             does not fit below Nyquist {nyq} Hz"
        )));
    }
    let n = auto_filter_length(trans_bw, sfreq);
    let hp = firwin(n, hi, sfreq, true);
    let lp = firwin(n, lo, sfreq, true);
    let mut h: Vec<f64> = hp.iter().zip(&lp).map(|(a, b)| -(a - b)).collect();
    h[n / 2] += 1.0;
    Ok(h.into_iter().map(|v| v as f32).collect())
}

/// Magnitude response of `h` at `freq` Hz.
pub fn magnitude_at(h: &[f32], freq: f32, sfreq: f32) -> f64 {
    let w = 2.0 * PI * freq as f64 / sfreq as f64;
    let (re, im) = h.iter().enumerate().fold((0.0, 0.0), |(re, im), (i, &v)| {
        let phase = w * i as f64;
        (re + v as f64 * phase.cos(), im - v as f64 * phase.sin())
    });
    (re * re + im * im).sqrt()
}
