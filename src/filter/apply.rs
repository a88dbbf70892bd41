//! Overlap-add zero-phase FIR convolution.
//!
//! Matches MNE's `_overlap_add_filter` + `_1d_overlap_filter`.
//!
//! Zero-phase is achieved by shifting the output left by `(N-1)/2` samples,
//! NOT by running filtfilt. The edge transient is suppressed by
//! reflect-limited padding of `N-1` samples on each side.
use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// A kernel prepared for signals of one fixed length: the FFT block size,
/// the kernel spectrum and both FFT plans are computed once and reused for
/// every channel.
pub struct OverlapAdd {
    n_h: usize,
    n_fft: usize,
    h_fft: Vec<Complex<f32>>,
    fwd: Arc<dyn Fft<f32>>,
    inv: Arc<dyn Fft<f32>>,
}

impl OverlapAdd {
    /// Plan filtering of `n_x`-sample signals with the odd-length kernel `h`.
    pub fn new(h: &[f32], n_x: usize) -> Self {
        let n_h = h.len().max(1);
        let n_ext = n_x + 2 * (n_h - 1);
        let n_fft = choose_fft_len(n_h, n_ext.max(1));

        let mut planner: FftPlanner<f32> = FftPlanner::new();
        let fwd = planner.plan_fft_forward(n_fft);
        let inv = planner.plan_fft_inverse(n_fft);

        let mut h_fft = zero_padded(h, n_fft);
        fwd.process(&mut h_fft);

        Self { n_h, n_fft, h_fft, fwd, inv }
    }

    /// Filter one signal; the output has the same length as `x`.
    pub fn filter(&self, x: &[f32]) -> Vec<f32> {
        let n_x = x.len();
        if n_x == 0 {
            return vec![];
        }
        let shift = (self.n_h - 1) / 2;
        let n_edge = self.n_h - 1;

        let x_ext = reflect_limited_pad(x, n_edge, n_edge);
        let n_ext = x_ext.len();
        let n_seg = self.n_fft - self.n_h + 1;
        let inv_scale = 1.0 / self.n_fft as f32;
        let mut y = vec![0.0_f32; n_ext];

        for start in (0..n_ext).step_by(n_seg) {
            let stop = (start + n_seg).min(n_ext);
            let mut buf = zero_padded(&x_ext[start..stop], self.n_fft);
            self.fwd.process(&mut buf);
            for (b, &hf) in buf.iter_mut().zip(&self.h_fft) {
                *b *= hf;
            }
            self.inv.process(&mut buf);

            // Accumulate with the zero-phase shift applied.
            let out_start = start.saturating_sub(shift);
            let out_end = (out_start + self.n_fft).min(n_ext);
            let prod_start = shift.saturating_sub(start);
            for (o, p) in (out_start..out_end).zip(prod_start..self.n_fft) {
                y[o] += buf[p].re * inv_scale;
            }
        }

        y[n_edge..n_edge + n_x].to_vec()
    }
}

/// Apply a zero-phase FIR filter to every channel of `data` ([C, T]) in place.
pub fn apply_fir_zero_phase(data: &mut Array2<f32>, h: &[f32]) {
    let ola = OverlapAdd::new(h, data.ncols());
    for mut row in data.rows_mut() {
        let filtered = ola.filter(&row.to_vec());
        row.assign(&ndarray::ArrayView1::from(&filtered));
    }
}

/// Filter a single signal (convenience wrapper around [`OverlapAdd`]).
pub fn filter_1d(x: &[f32], h: &[f32]) -> Vec<f32> {
    OverlapAdd::new(h, x.len()).filter(x)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn zero_padded(x: &[f32], n: usize) -> Vec<Complex<f32>> {
    x.iter()
        .map(|&v| Complex { re: v, im: 0.0 })
        .chain(std::iter::repeat(Complex::default()))
        .take(n)
        .collect()
}

/// Reflect-limited padding (MNE's `_smart_pad`).
///
/// Left:  `pad[i] = 2*x[0] - x[n_l-i]`  for i in 1..=n_l
/// Right: `pad[i] = 2*x[-1] - x[-(i+1)]` for i in 1..=n_r
/// Requests longer than the signal are completed with zeros on the outside.
fn reflect_limited_pad(x: &[f32], n_l: usize, n_r: usize) -> Vec<f32> {
    let n = x.len();
    let actual_l = n_l.min(n - 1);
    let actual_r = n_r.min(n - 1);

    let mut out = Vec::with_capacity(n_l + n + n_r);
    out.extend(std::iter::repeat(0.0).take(n_l - actual_l));
    out.extend((1..=actual_l).rev().map(|i| 2.0 * x[0] - x[i]));
    out.extend_from_slice(x);
    let last = x[n - 1];
    out.extend((1..=actual_r).map(|i| 2.0 * last - x[(n - 1).saturating_sub(i)]));
    out.extend(std::iter::repeat(0.0).take(n_r - actual_r));
    out
}

/// Power-of-two FFT block size minimising MNE's cost estimate:
///   `cost = ceil(n_x / (N - n_h + 1)) * N * (log2(N) + 1) + 4e-5 * N * n_x`
fn choose_fft_len(n_h: usize, n_x: usize) -> usize {
    let min_fft = 2 * n_h - 1;
    let max_pow = (n_x as f64).log2().ceil() as u32 + 1;
    let min_pow = (min_fft as f64).log2().ceil() as u32;

    let mut best_n = 1_usize << max_pow.max(min_pow);
    let mut best_cost = f64::INFINITY;
    for pow in min_pow..=max_pow {
        let n = 1_usize << pow;
        if n < min_fft {
            continue;
        }
        let n_seg = (n - n_h + 1) as f64;
        let cost = (n_x as f64 / n_seg).ceil() * n as f64 * (pow as f64 + 1.0)
            + 4e-5 * n as f64 * n_x as f64;
        if cost < best_cost {
            best_cost = cost;
            best_n = n;
        }
    }
    best_n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::design::design_bandpass;

    #[test]
    fn filter_preserves_length() {
        let x: Vec<f32> = (0..1024).map(|i| (i as f32 / 1024.0).sin()).collect();
        let h = design_bandpass(1.0, 40.0, 256.0).unwrap();
        assert_eq!(filter_1d(&x, &h).len(), x.len());
    }

    #[test]
    fn filter_removes_dc() {
        let x = vec![1.0_f32; 4096];
        let h = design_bandpass(1.0, 40.0, 256.0).unwrap();
        let y = filter_1d(&x, &h);
        let n_h = h.len();
        let interior = &y[n_h..y.len() - n_h];
        let max_val: f32 = interior.iter().map(|v| v.abs()).fold(0.0_f32, f32::max);
        assert!(max_val < 1e-3, "DC not removed: max={max_val}");
    }

    #[test]
    fn identity_kernel_is_passthrough() {
        let x: Vec<f32> = (0..300).map(|i| (i as f32 * 0.37).cos()).collect();
        let y = filter_1d(&x, &[0.0, 1.0, 0.0]);
        for (a, b) in x.iter().zip(&y) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-5_f32);
        }
    }

    #[test]
    fn reflect_limited_left_pad() {
        let x = [1.0_f32, 2.0, 3.0, 4.0, 5.0];
        let padded = reflect_limited_pad(&x, 3, 0);
        assert_eq!(&padded[..3], &[-2.0_f32, -1.0, 0.0]);
        assert_eq!(&padded[3..], &x[..]);
    }

    #[test]
    fn overlong_pad_is_zero_filled_outside() {
        let x = [1.0_f32, 2.0];
        let padded = reflect_limited_pad(&x, 3, 2);
        assert_eq!(padded, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.0]);
    }
}
