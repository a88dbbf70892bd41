//! Reconstruction Stage.
//!
//! 1. Project the removed components out of the filtered signal:
//!    `X' = X − A[:, r] · (W S)[r, :] · X`.
//! 2. Rebuild flagged channels by spherical-spline interpolation.
//! 3. Re-reference to the common average.
//!
//! After each step the channel count, label order and sample count are
//! checked against the template and the filtered input; any drift is an
//! invariant violation.
use ndarray::{Array2, Axis};

use crate::decompose::Decomposition;
use crate::detect::ChannelMask;
use crate::error::{CleanError, Result};
use crate::interpolate::interpolate_bad_channels;
use crate::linalg::all_finite;
use crate::recording::{ChannelStatus, Recording};
use crate::template::ChannelTemplate;

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub recording: Recording,
    /// Channels rebuilt by interpolation.
    pub interpolated: Vec<usize>,
}

/// Subtract the contribution of `removed` components from `data`.
pub fn remove_components(
    data: &Array2<f64>,
    decomposition: &Decomposition,
    removed: &[usize],
) -> Result<Array2<f64>> {
    let k = decomposition.n_components();
    if let Some(bad) = removed.iter().find(|&&i| i >= k) {
        return Err(CleanError::Invariant(format!("component {bad} flagged but only {k} exist")));
    }
    if data.nrows() != decomposition.mixing.nrows() {
        return Err(CleanError::Invariant(format!(
            "decomposition covers {} channels but the signal has {}",
            decomposition.mixing.nrows(),
            data.nrows()
        )));
    }
    if removed.is_empty() {
        return Ok(data.clone());
    }
    let unmix = decomposition.full_unmixing().select(Axis(0), removed);
    let topo = decomposition.mixing.select(Axis(1), removed);
    let artifact = topo.dot(&unmix.dot(data));
    Ok(data - &artifact)
}

fn check_layout(
    step: &str,
    data: &Array2<f64>,
    template: &ChannelTemplate,
    n_samples: usize,
) -> Result<()> {
    if data.nrows() != template.len() || data.ncols() != n_samples {
        return Err(CleanError::Invariant(format!(
            "after {step}: {} channels x {} samples, expected {} x {n_samples}",
            data.nrows(),
            data.ncols(),
            template.len()
        )));
    }
    Ok(())
}

/// Common average reference: at every sample, subtract the mean over
/// channels.  A matrix without channels is left alone.
pub fn average_reference_inplace(data: &mut Array2<f64>) {
    for mut column in data.columns_mut() {
        if let Some(mean) = column.mean() {
            column -= mean;
        }
    }
}

/// Run the three reconstruction steps on the filtered recording.
pub fn reconstruct(
    filtered: &Recording,
    template: &ChannelTemplate,
    decomposition: &Decomposition,
    removed: &[usize],
    mask: &ChannelMask,
) -> Result<Reconstruction> {
    template.verify(filtered)?;
    let n_t = filtered.n_samples();

    let mut x = remove_components(&filtered.data_f64(), decomposition, removed)?;
    check_layout("component removal", &x, template, n_t)?;

    let interpolated = interpolate_bad_channels(&mut x, template, mask)?;
    check_layout("interpolation", &x, template, n_t)?;

    average_reference_inplace(&mut x);
    check_layout("re-referencing", &x, template, n_t)?;

    if !all_finite(&x) {
        return Err(CleanError::Numerical("reconstructed signal contains NaN or Inf".into()));
    }

    let mut channels = template.channels().to_vec();
    mask.annotate(&mut channels);
    for &i in &interpolated {
        channels[i].status = ChannelStatus::Interpolated;
    }
    let recording =
        Recording::new(x.mapv(|v| v as f32), filtered.sfreq, channels, filtered.events.clone())?;
    template.verify(&recording)?;

    log::info!(
        "reconstructed {} ch x {n_t} samples: {} component(s) removed, {} channel(s) interpolated",
        recording.n_channels(),
        removed.len(),
        interpolated.len()
    );
    Ok(Reconstruction { recording, interpolated })
}
