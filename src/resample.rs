//! FFT resampler and event re-alignment.
//!
//! Signal path (MNE's `resample(..., method='fft')`):
//!   1. Pad with reflect-limited samples up to the next power of two.
//!   2. rfft the padded signal.
//!   3. Double (downsampling) or halve (upsampling) the Nyquist bin.
//!   4. Scale all bins by `new_len_padded / old_len_padded`.
//!   5. irfft to `new_len_padded`, which truncates or zero-pads the spectrum.
//!   6. Strip the resampled padding.
//!
//! Events move with the signal: every onset is mapped to
//! `round(onset · ratio)` and clamped into the new sample range.
use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::error::{CleanError, Result};
use crate::recording::{Event, Recording};

/// Padding MNE uses with `npad='auto'`: grow to the next power of two.
///
/// ```text
/// min_add = min(n // 8, 100) * 2
/// total   = 2^ceil(log2(n + min_add)) - n
/// npads   = [total // 2, total - total // 2]
/// ```
pub fn auto_npad(n: usize) -> (usize, usize) {
    let min_add = (n / 8).min(100) * 2;
    let sum = n + min_add;
    let next_pow2 = 1usize << ((sum as f64).log2().ceil() as u32);
    let total = next_pow2 - n;
    (total / 2, total - total / 2)
}

/// Output length for `n_in` samples at `ratio = dst / src`.
pub fn resampled_len(n_in: usize, ratio: f64) -> usize {
    (ratio * n_in as f64).round() as usize
}

/// Resample `data` ([C, T]) from `src_sfreq` to `dst_sfreq`.
pub fn resample(data: &Array2<f32>, src_sfreq: f32, dst_sfreq: f32) -> Result<Array2<f32>> {
    if !(src_sfreq > 0.0 && dst_sfreq > 0.0) {
        return Err(CleanError::Config(format!(
            "cannot resample {src_sfreq} Hz -> {dst_sfreq} Hz"
        )));
    }
    if (src_sfreq - dst_sfreq).abs() < 1e-6 {
        return Ok(data.clone());
    }
    let ratio = dst_sfreq as f64 / src_sfreq as f64;
    let n_in = data.ncols();
    let final_len = resampled_len(n_in, ratio);
    if final_len == 0 {
        return Err(CleanError::Input(format!(
            "{n_in} samples at {src_sfreq} Hz leave nothing at {dst_sfreq} Hz"
        )));
    }

    let (npad_l, npad_r) = auto_npad(n_in);
    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let mut out = Array2::<f32>::zeros((data.nrows(), final_len));
    for (row_in, mut row_out) in data.rows().into_iter().zip(out.rows_mut()) {
        let x: Vec<f32> = row_in.to_vec();
        let y = resample_1d(&mut planner, &x, ratio, npad_l, npad_r);
        row_out.assign(&ndarray::ArrayView1::from(&y));
    }
    Ok(out)
}

/// Resample one channel with explicit (possibly asymmetric) padding.
pub fn resample_1d(
    planner: &mut FftPlanner<f64>,
    x: &[f32],
    ratio: f64,
    npad_l: usize,
    npad_r: usize,
) -> Vec<f32> {
    let n_in = x.len();
    if n_in == 0 {
        return vec![];
    }
    let final_len = resampled_len(n_in, ratio);

    // Reflect-limited padding; requests beyond n_in-1 are clamped.
    let pad_l = npad_l.min(n_in - 1);
    let pad_r = npad_r.min(n_in - 1);
    let old_len = n_in + pad_l + pad_r;
    let mut x_ext: Vec<Complex<f64>> = Vec::with_capacity(old_len);
    for i in (1..=pad_l).rev() {
        x_ext.push(Complex { re: 2.0 * x[0] as f64 - x[i] as f64, im: 0.0 });
    }
    x_ext.extend(x.iter().map(|&v| Complex { re: v as f64, im: 0.0 }));
    let last = x[n_in - 1] as f64;
    for i in 1..=pad_r {
        let idx = (n_in - 1).saturating_sub(i);
        x_ext.push(Complex { re: 2.0 * last - x[idx] as f64, im: 0.0 });
    }

    let new_len_padded = resampled_len(old_len, ratio).max(1);
    let shorter = new_len_padded < old_len;
    let use_len = if shorter { new_len_padded } else { old_len };

    planner.plan_fft_forward(old_len).process(&mut x_ext);
    let rfft_len = old_len / 2 + 1;
    let mut spec: Vec<Complex<f64>> = x_ext[..rfft_len].to_vec();

    if use_len % 2 == 0 {
        let nyq = use_len / 2;
        if nyq < spec.len() {
            spec[nyq] *= if shorter { 2.0 } else { 0.5 };
        }
    }
    let scale = new_len_padded as f64 / old_len as f64;
    spec.iter_mut().for_each(|v| *v *= scale);

    // irfft(spec, n = new_len_padded) via a full complex inverse FFT.
    let new_rfft_len = new_len_padded / 2 + 1;
    let mut buf = vec![Complex::<f64>::default(); new_len_padded];
    let n_copy = spec.len().min(new_rfft_len);
    buf[..n_copy].copy_from_slice(&spec[..n_copy]);
    for i in 1..new_rfft_len {
        let idx = new_len_padded - i;
        if idx >= new_rfft_len {
            buf[idx] = buf[i].conj();
        }
    }
    planner.plan_fft_inverse(new_len_padded).process(&mut buf);
    let inv = 1.0 / new_len_padded as f64;

    let strip_l = ((ratio * npad_l.min(n_in - 1) as f64).round() as usize).min(new_len_padded);
    let mut y: Vec<f32> = buf[strip_l..]
        .iter()
        .take(final_len)
        .map(|c| (c.re * inv) as f32)
        .collect();
    y.resize(final_len, 0.0);
    y
}

/// Map events onto a resampled time axis of `new_len` samples.
///
/// Onsets that round past the end are clamped to the last sample; the number
/// of clamped events is returned so the caller can log it.
pub fn rescale_events(events: &[Event], ratio: f64, new_len: usize) -> (Vec<Event>, usize) {
    let last = new_len.saturating_sub(1);
    let mut clamped = 0;
    let out = events
        .iter()
        .map(|e| {
            let mut onset = (e.onset as f64 * ratio).round() as usize;
            if onset > last {
                onset = last;
                clamped += 1;
            }
            let duration = e.duration.map(|d| (d as f64 * ratio).round() as usize);
            Event { label: e.label.clone(), onset, duration }
        })
        .collect();
    (out, clamped)
}

/// Resample a whole recording to `dst_sfreq`, carrying the events along.
pub fn resample_recording(rec: &Recording, dst_sfreq: f32) -> Result<Recording> {
    if (rec.sfreq - dst_sfreq).abs() <= 1e-3 {
        return Ok(rec.clone());
    }
    let data = resample(&rec.data, rec.sfreq, dst_sfreq)?;
    let ratio = dst_sfreq as f64 / rec.sfreq as f64;
    let (events, clamped) = rescale_events(&rec.events, ratio, data.ncols());
    if clamped > 0 {
        log::warn!("{clamped} event onset(s) clamped to the last sample after resampling");
    }
    log::info!(
        "resampled {} Hz -> {} Hz: {} -> {} samples, {} events re-aligned",
        rec.sfreq,
        dst_sfreq,
        rec.n_samples(),
        data.ncols(),
        events.len()
    );
    Recording::new(data, dst_sfreq, rec.channels.clone(), events)
}
