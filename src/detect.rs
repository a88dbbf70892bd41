//! Bad-Channel Detector.
//!
//! A non-destructive scan that marks channels as unusable.  Three criteria
//! are checked and any one of them flags a channel:
//!
//! 1. **Flatline**: a run of at least `flatline_secs` in which every sample
//!    step is below `flatline_rel_jitter` times the typical step size of the
//!    recording.
//! 2. **Correlation**: the channel is poorly correlated with the mean of its
//!    spatial neighbours in more than `max_bad_window_fraction` of the
//!    `corr_window_secs` windows.
//! 3. **Line noise**: the share of power within ±1 Hz of the line frequency
//!    is an outlier (robust z-score) across channels.
//!
//! The detector never touches samples and never drops time windows: burst
//! repair and window rejection are deliberately not part of this stage, so
//! event alignment is preserved exactly and bad channels are handled only
//! by interpolation during reconstruction.
//!
//! Detector failures are not fatal.  [`detect_bad_channels`] degrades to an
//! empty mask with a warning when the scan errors, or when it would leave
//! fewer than [`MIN_GOOD_CHANNELS`] usable channels.
use serde::{Deserialize, Serialize};

use crate::config::DetectorConfig;
use crate::error::{CleanError, Result};
use crate::recording::{Channel, ChannelStatus, Recording};
use crate::spectrum::{correlation, default_nperseg, median, std, welch};
use crate::template::ChannelTemplate;

/// Fewest good channels the detector will leave behind.
pub const MIN_GOOD_CHANNELS: usize = 3;

/// MAD → standard deviation for Gaussian data.
const MAD_SCALE: f64 = 1.4826;

/// Why a channel was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadReason {
    Flatline,
    LowCorrelation,
    LineNoise,
}

impl BadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadReason::Flatline => "flatline",
            BadReason::LowCorrelation => "low_correlation",
            BadReason::LineNoise => "line_noise",
        }
    }
}

/// Boolean per-channel mask with the first criterion that fired.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMask {
    reasons: Vec<Option<BadReason>>,
}

impl ChannelMask {
    /// A mask of `n` channels with nothing flagged.
    pub fn none(n: usize) -> Self {
        Self { reasons: vec![None; n] }
    }

    /// Build a mask from explicit per-channel reasons.
    pub fn from_reasons(reasons: Vec<Option<BadReason>>) -> Self {
        Self { reasons }
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn is_bad(&self, idx: usize) -> bool {
        self.reasons.get(idx).is_some_and(|r| r.is_some())
    }

    pub fn reason(&self, idx: usize) -> Option<BadReason> {
        self.reasons.get(idx).copied().flatten()
    }

    pub fn as_bools(&self) -> Vec<bool> {
        self.reasons.iter().map(|r| r.is_some()).collect()
    }

    pub fn bad_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.is_bad(i)).collect()
    }

    pub fn good_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| !self.is_bad(i)).collect()
    }

    pub fn count(&self) -> usize {
        self.reasons.iter().filter(|r| r.is_some()).count()
    }

    /// Mark flagged channels as rejected.  Other statuses are left alone.
    pub fn annotate(&self, channels: &mut [Channel]) {
        for (i, ch) in channels.iter_mut().enumerate() {
            if self.is_bad(i) {
                ch.status = ChannelStatus::DataRejected;
            }
        }
    }
}

/// Run the detector on a filtered recording.
///
/// `line_freq` enables the line-noise criterion.  Never fails.
pub fn detect_bad_channels(
    rec: &Recording,
    template: &ChannelTemplate,
    line_freq: Option<f32>,
    cfg: &DetectorConfig,
) -> ChannelMask {
    let n = rec.n_channels();
    match scan(rec, template, line_freq, cfg) {
        Ok(mask) if n - mask.count() < MIN_GOOD_CHANNELS && mask.count() > 0 => {
            log::warn!(
                "detector flagged {} of {n} channels, leaving fewer than {MIN_GOOD_CHANNELS}; \
                 falling back to no channels flagged",
                mask.count()
            );
            ChannelMask::none(n)
        }
        Ok(mask) => mask,
        Err(e) => {
            log::warn!("bad-channel detector failed ({e}); falling back to no channels flagged");
            ChannelMask::none(n)
        }
    }
}

/// The full criterion scan; errors are left to the caller.
pub fn scan(
    rec: &Recording,
    template: &ChannelTemplate,
    line_freq: Option<f32>,
    cfg: &DetectorConfig,
) -> Result<ChannelMask> {
    template.verify(rec)?;
    let sfreq = rec.sfreq as f64;
    let rows: Vec<Vec<f64>> = rec
        .data
        .rows()
        .into_iter()
        .map(|r| r.iter().map(|&v| v as f64).collect())
        .collect();

    let mut reasons: Vec<Option<BadReason>> = vec![None; rows.len()];

    for (i, flat) in flatline_flags(&rows, sfreq, cfg).into_iter().enumerate() {
        if flat {
            reasons[i] = Some(BadReason::Flatline);
        }
    }

    let flat: Vec<bool> = reasons.iter().map(|r| r.is_some()).collect();
    let bad_fracs = correlation_bad_fractions(&rows, &flat, template, sfreq, cfg)?;
    for (i, frac) in bad_fracs.into_iter().enumerate() {
        if reasons[i].is_none() && frac > cfg.max_bad_window_fraction {
            log::debug!(
                "channel {}: {:.0}% of windows below r = {}",
                rec.channels[i].label,
                100.0 * frac,
                cfg.corr_threshold
            );
            reasons[i] = Some(BadReason::LowCorrelation);
        }
    }

    if let Some(line) = line_freq {
        let hits = line_noise_flags(&rows, &flat, line as f64, sfreq, cfg)?;
        for (i, hit) in hits.into_iter().enumerate() {
            if hit && reasons[i].is_none() {
                reasons[i] = Some(BadReason::LineNoise);
            }
        }
    }

    let mask = ChannelMask::from_reasons(reasons);
    for i in mask.bad_indices() {
        log::info!(
            "bad channel {} ({})",
            rec.channels[i].label,
            mask.reason(i).map_or("", |r| r.as_str())
        );
    }
    Ok(mask)
}

fn flatline_flags(rows: &[Vec<f64>], sfreq: f64, cfg: &DetectorConfig) -> Vec<bool> {
    let min_run = ((cfg.flatline_secs as f64 * sfreq).round() as usize).max(1);
    let steps: Vec<Vec<f64>> = rows
        .iter()
        .map(|r| r.windows(2).map(|w| (w[1] - w[0]).abs()).collect())
        .collect();
    let typical = median(&steps.iter().map(|s| median(s)).collect::<Vec<_>>());
    let thr = cfg.flatline_rel_jitter * typical;

    steps
        .iter()
        .map(|s| {
            let mut run = 0usize;
            for &d in s {
                run = if d <= thr { run + 1 } else { 0 };
                if run >= min_run {
                    return true;
                }
            }
            false
        })
        .collect()
}

/// Fraction of evaluated windows in which each channel correlates below
/// threshold with its neighbour mean.  Flat channels never serve as
/// neighbours and flat windows are skipped.
fn correlation_bad_fractions(
    rows: &[Vec<f64>],
    flat: &[bool],
    template: &ChannelTemplate,
    sfreq: f64,
    cfg: &DetectorConfig,
) -> Result<Vec<f64>> {
    let n_ch = rows.len();
    let n_t = rows.first().map_or(0, |r| r.len());
    let win = ((cfg.corr_window_secs as f64 * sfreq).round() as usize).clamp(2, n_t.max(2));

    let mut out = vec![0.0; n_ch];
    for i in 0..n_ch {
        if flat[i] {
            continue;
        }
        let mut nbrs = template.neighbours_where(i, cfg.n_neighbours, |j| !flat[j]);
        if nbrs.is_empty() {
            nbrs = (0..n_ch).filter(|&j| j != i && !flat[j]).collect();
        }
        if nbrs.is_empty() {
            continue;
        }
        let reference: Vec<f64> = (0..n_t)
            .map(|t| nbrs.iter().map(|&j| rows[j][t]).sum::<f64>() / nbrs.len() as f64)
            .collect();

        let (mut evaluated, mut below) = (0usize, 0usize);
        let mut start = 0;
        while start < n_t {
            let stop = (start + win).min(n_t);
            if stop - start < 2 {
                break;
            }
            let a = &rows[i][start..stop];
            let b = &reference[start..stop];
            if std(a) > 0.0 && std(b) > 0.0 {
                let r = correlation(a, b);
                if !r.is_finite() {
                    return Err(CleanError::Numerical(format!(
                        "non-finite correlation for channel {i}"
                    )));
                }
                evaluated += 1;
                if r < cfg.corr_threshold {
                    below += 1;
                }
            }
            start = stop;
        }
        if evaluated > 0 {
            out[i] = below as f64 / evaluated as f64;
        }
    }
    Ok(out)
}

fn line_noise_flags(
    rows: &[Vec<f64>],
    flat: &[bool],
    line: f64,
    sfreq: f64,
    cfg: &DetectorConfig,
) -> Result<Vec<bool>> {
    if line + 1.0 >= sfreq / 2.0 {
        log::debug!("line frequency {line} Hz is above Nyquist; line-noise criterion skipped");
        return Ok(vec![false; rows.len()]);
    }
    let ratios: Vec<f64> = rows
        .iter()
        .map(|r| {
            welch(r, sfreq, default_nperseg(sfreq, r.len())).band_ratio(line - 1.0, line + 1.0)
        })
        .collect();
    if ratios.iter().any(|v| !v.is_finite()) {
        return Err(CleanError::Numerical("non-finite line-noise ratio".into()));
    }
    let live: Vec<f64> = ratios.iter().zip(flat).filter(|(_, f)| !**f).map(|(r, _)| *r).collect();
    let med = median(&live);
    let mad = median(&live.iter().map(|v| (v - med).abs()).collect::<Vec<_>>());
    let sigma = (MAD_SCALE * mad).max(1e-6);

    Ok(ratios
        .iter()
        .zip(flat)
        .map(|(&r, &f)| !f && r > cfg.line_noise_floor && (r - med) / sigma > cfg.line_noise_z)
        .collect())
}
