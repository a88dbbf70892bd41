//! Shared helpers: synthetic recordings and engines with injected faults.
#![allow(dead_code)]

use std::f64::consts::PI;
use std::path::Path;

use eegclean::config::{DecompositionConfig, PipelineConfig};
use eegclean::decompose::{Decomposer, Decomposition, Infomax};
use eegclean::error::{CleanError, Result};
use eegclean::io::write_recording;
use eegclean::spectrum::{default_nperseg, welch};
use eegclean::{Channel, Event, Recording, SubjectSpec};
use ndarray::{Array2, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const LABELS: [&str; 8] = ["Fp1", "Fp2", "F3", "F4", "C3", "C4", "O1", "O2"];
pub const SFREQ: f32 = 250.0;

/// Eye-blink weight per channel: strongest at the front of the head.
pub const BLINK_LOADING: [f64; 8] = [1.0, 1.0, 0.5, 0.5, 0.15, 0.15, 0.05, 0.05];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gauss(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn laplace(rng: &mut StdRng) -> f64 {
    let u: f64 = rng.gen_range(-0.5..0.5);
    -u.signum() * (1.0 - 2.0 * u.abs()).max(1e-12).ln()
}

/// Blink train: 0.4 s raised-cosine pulses roughly every 3 s.
fn blink_train(n: usize, sfreq: f64, rng: &mut StdRng) -> Vec<f64> {
    let mut out = vec![0.0; n];
    let width = (0.4 * sfreq) as usize;
    let mut t = 1.0 + rng.gen_range(0.0..0.5);
    while ((t * sfreq) as usize) + width < n {
        let start = (t * sfreq) as usize;
        for k in 0..width {
            out[start + k] = 0.5 * (1.0 - (2.0 * PI * k as f64 / width as f64).cos());
        }
        t += 3.0 + rng.gen_range(-0.5..0.5);
    }
    out
}

/// Eight-channel 10-20 recording at [`SFREQ`] built from independent
/// sources: an eye blink, alpha, theta, beta, two more rhythms and a
/// broadband source, plus sensor noise.  Events: `stim` every 2 s and
/// `resp` every 5 s.
pub fn synthetic_recording(seconds: f64, seed: u64, blink_amplitude: f64) -> Recording {
    synthetic_recording_at(seconds, seed, blink_amplitude, SFREQ)
}

pub fn synthetic_recording_at(
    seconds: f64,
    seed: u64,
    blink_amplitude: f64,
    sfreq: f32,
) -> Recording {
    let fs = sfreq as f64;
    let n = (seconds * fs) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let phase: Vec<f64> = (0..6).map(|_| rng.gen_range(0.0..2.0 * PI)).collect();
    let time = |t: usize| t as f64 / fs;

    let blink = blink_train(n, fs, &mut rng);
    let broadband: Vec<f64> = (0..n).map(|_| laplace(&mut rng)).collect();
    let rhythm = |freq: f64, amp: f64, am: f64, p: f64| -> Vec<f64> {
        (0..n)
            .map(|t| {
                let x = time(t);
                amp * (1.0 + 0.5 * (2.0 * PI * am * x + p).sin()) * (2.0 * PI * freq * x + p).sin()
            })
            .collect()
    };
    let sources: Vec<(Vec<f64>, [f64; 8])> = vec![
        (blink.iter().map(|v| v * blink_amplitude).collect(), BLINK_LOADING),
        (rhythm(10.0, 15.0, 0.07, phase[0]), [0.6, 0.6, 0.7, 0.7, 0.9, 0.9, 1.0, 1.0]),
        (rhythm(6.0, 6.0, 0.05, phase[1]), [0.8, 0.7, 1.0, 0.9, 0.6, 0.5, 0.2, 0.2]),
        (rhythm(16.0, 4.0, 0.13, phase[2]), [0.3, 0.4, 0.6, 0.5, 1.0, 0.9, 0.5, 0.6]),
        (rhythm(12.0, 4.0, 0.11, phase[3]), [0.2, 0.5, 0.4, 0.9, 0.5, 1.0, 0.3, 0.6]),
        (rhythm(7.5, 4.0, 0.09, phase[4]), [0.5, 0.2, 0.9, 0.4, 1.0, 0.5, 0.6, 0.3]),
        (broadband.iter().map(|v| v * 3.0).collect(), [0.4, 0.4, 0.5, 0.5, 0.6, 0.6, 0.7, 0.7]),
    ];

    let mut data = Array2::<f32>::zeros((LABELS.len(), n));
    for c in 0..LABELS.len() {
        for t in 0..n {
            let mut v = 0.5 * gauss(&mut rng);
            for (s, load) in &sources {
                v += load[c] * s[t];
            }
            data[[c, t]] = v as f32;
        }
    }

    let channels: Vec<Channel> = LABELS.iter().map(|l| Channel::new(*l, None)).collect();
    let mut events = Vec::new();
    let mut onset = 0;
    while onset < n {
        events.push(Event::new("stim", onset));
        onset += (2.0 * fs) as usize;
    }
    let mut onset = (5.0 * fs) as usize;
    while onset < n {
        let mut ev = Event::new("resp", onset);
        ev.duration = Some((0.5 * fs) as usize);
        events.push(ev);
        onset += (5.0 * fs) as usize;
    }
    events.sort_by_key(|e| e.onset);
    match Recording::new(data, sfreq, channels, events) {
        Ok(r) => r,
        Err(e) => panic!("synthetic recording is invalid: {e}"),
    }
}

/// Write one synthetic recording per id into `dir`.
pub fn write_subjects(dir: &Path, ids: &[&str], seconds: f64) -> Vec<SubjectSpec> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let path = dir.join(format!("{id}.safetensors"));
            write_recording(&path, &synthetic_recording(seconds, 100 + i as u64, 60.0)).unwrap();
            SubjectSpec::new(*id, path)
        })
        .collect()
}

/// Defaults with a shorter, decimated decomposition.
pub fn fast_config(max_iter: usize, decimate: usize) -> PipelineConfig {
    PipelineConfig {
        decomposition: DecompositionConfig { max_iter, decimate, ..DecompositionConfig::default() },
        ..PipelineConfig::default()
    }
}

/// Power of one channel between `lo` and `hi` Hz.
pub fn band_power(row: &[f32], sfreq: f32, lo: f64, hi: f64) -> f64 {
    let x: Vec<f64> = row.iter().map(|&v| v as f64).collect();
    let fs = sfreq as f64;
    welch(&x, fs, default_nperseg(fs, x.len())).band_power(lo, hi)
}

/// Infomax, except for one subject whose fit "fails" numerically.
pub struct FailFor(pub &'static str);

impl Decomposer for FailFor {
    fn decompose(
        &self,
        subject: &str,
        data: ArrayView2<'_, f64>,
        params: &DecompositionConfig,
    ) -> Result<Decomposition> {
        if subject == self.0 {
            return Err(CleanError::Numerical("unmixing matrix contains NaN (injected)".into()));
        }
        Infomax.decompose(subject, data, params)
    }
}

/// Infomax, except for one subject whose fit panics.
pub struct PanicFor(pub &'static str);

impl Decomposer for PanicFor {
    fn decompose(
        &self,
        subject: &str,
        data: ArrayView2<'_, f64>,
        params: &DecompositionConfig,
    ) -> Result<Decomposition> {
        if subject == self.0 {
            panic!("injected panic for {subject}");
        }
        Infomax.decompose(subject, data, params)
    }
}
