//! Filter Stage: resample, band-pass, line notch, per-subject extra notches.
//!
//! - [`design`]: Hamming-windowed sinc FIR design, matching
//!   `mne.filter.create_filter(fir_window='hamming', phase='zero')`.
//! - [`apply`]: Overlap-add zero-phase convolution, matching MNE's
//!   `_overlap_add_filter` / `_1d_overlap_filter`.

pub mod apply;
pub mod design;

pub use apply::{apply_fir_zero_phase, filter_1d, OverlapAdd};
pub use design::{
    auto_filter_length, design_bandpass, design_bandstop, firwin, hamming, high_trans_bandwidth,
    low_trans_bandwidth, magnitude_at,
};

use std::time::Instant;

use crate::config::FilterConfig;
use crate::error::Result;
use crate::recording::Recording;
use crate::resample::resample_recording;

/// Run the Filter Stage on one subject's recording.
///
/// Every kernel is designed (and every cutoff validated against the Nyquist
/// frequency of `cfg.target_sfreq`) before the signal is touched, so an
/// invalid configuration fails without paying for the resampler.
///
/// The output has the same channels as `rec`; its events are re-aligned to
/// the new sample axis when the rate changes.
pub fn filter_recording(rec: &Recording, subject: &str, cfg: &FilterConfig) -> Result<Recording> {
    let sfreq = cfg.target_sfreq;
    let bandpass = design_bandpass(cfg.l_freq, cfg.h_freq, sfreq)?;

    let mut notches: Vec<(f32, Vec<f32>)> = Vec::new();
    if let Some(line) = cfg.line_freq {
        notches.push((line, design_bandstop(line, cfg.notch_width, cfg.notch_trans_bw, sfreq)?));
    }
    for freq in cfg.extra_notches_for(subject) {
        notches.push((freq, design_bandstop(freq, cfg.notch_width, cfg.notch_trans_bw, sfreq)?));
    }

    let t0 = Instant::now();
    let mut out = resample_recording(rec, sfreq)?;

    apply_fir_zero_phase(&mut out.data, &bandpass);
    log::debug!(
        "{subject}: band-pass {}-{} Hz ({} taps)",
        cfg.l_freq,
        cfg.h_freq,
        bandpass.len()
    );
    for (freq, h) in &notches {
        apply_fir_zero_phase(&mut out.data, h);
        log::debug!("{subject}: notch at {freq} Hz ({} taps)", h.len());
    }

    out.validate()?;
    log::info!(
        "{subject}: filtered {} ch x {} samples at {sfreq} Hz, {} notch(es) in {:.2}s",
        out.n_channels(),
        out.n_samples(),
        notches.len(),
        t0.elapsed().as_secs_f64()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtraNotch;
    use crate::error::CleanError;
    use crate::recording::{Channel, Event};
    use ndarray::Array2;

    fn sine_recording(freqs: &[f32], sfreq: f32, n: usize) -> Recording {
        let data = Array2::from_shape_fn((2, n), |(_, t)| {
            freqs
                .iter()
                .map(|f| (2.0 * std::f32::consts::PI * f * t as f32 / sfreq).sin())
                .sum()
        });
        let chans = vec![Channel::new("Cz", None), Channel::new("Pz", None)];
        Recording::new(data, sfreq, chans, vec![Event::new("start", 10)]).unwrap()
    }

    fn rms(x: &[f32]) -> f32 {
        (x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32).sqrt()
    }

    #[test]
    fn invalid_cutoff_fails_before_work() {
        let rec = sine_recording(&[10.0], 250.0, 500);
        let cfg = FilterConfig { target_sfreq: 100.0, h_freq: 60.0, ..FilterConfig::default() };
        assert!(matches!(filter_recording(&rec, "s1", &cfg), Err(CleanError::Config(_))));
    }

    #[test]
    fn line_noise_removed_signal_kept() {
        let rec = sine_recording(&[10.0, 60.0], 250.0, 250 * 20);
        let cfg = FilterConfig::default();
        let out = filter_recording(&rec, "s1", &cfg).unwrap();
        assert_eq!(out.n_samples(), rec.n_samples());
        assert_eq!(out.events, rec.events);

        // Middle section only: compare against a pure 10 Hz sine (rms 1/√2).
        let row = out.data.row(0).to_vec();
        let mid = &row[1000..4000];
        approx::assert_abs_diff_eq!(rms(mid), std::f32::consts::FRAC_1_SQRT_2, epsilon = 0.03);
    }

    #[test]
    fn extra_notch_only_for_listed_subject() {
        let rec = sine_recording(&[31.25], 250.0, 250 * 20);
        let cfg = FilterConfig {
            line_freq: None,
            extra_notches: vec![ExtraNotch { freq: 31.25, subjects: vec!["p07".into()] }],
            ..FilterConfig::default()
        };
        let hit = filter_recording(&rec, "P07", &cfg).unwrap();
        let miss = filter_recording(&rec, "P08", &cfg).unwrap();
        assert!(rms(&hit.data.row(0).to_vec()[1000..4000]) < 0.05);
        assert!(rms(&miss.data.row(0).to_vec()[1000..4000]) > 0.6);
    }

    #[test]
    fn resampling_keeps_events_in_bounds() {
        let mut rec = sine_recording(&[10.0], 500.0, 5000);
        rec.events.push(Event::new("end", 4999));
        let out = filter_recording(&rec, "s1", &FilterConfig::default()).unwrap();
        assert_eq!(out.n_samples(), 2500);
        assert_eq!(out.events[0].onset, 5);
        assert_eq!(out.events[1].onset, 2499);
    }
}
