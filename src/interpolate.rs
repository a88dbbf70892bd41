//! Spherical-spline interpolation of bad channels (Perrin et al. 1989).
//!
//! Matches MNE's `_make_interpolation_matrix`:
//!
//! ```text
//! g(x)  = 1/(4π) Σ_{n=1}^{50} (2n+1) / (n(n+1))^4 · P_n(x)
//! C     = [[G_from, 1], [1ᵀ, 0]]
//! M     = [G_to_from, 1] · pinv(C)[:, :-1]
//! ```
//!
//! where `G` holds `g` of the cosine between unit-sphere positions.
use std::f64::consts::PI;

use ndarray::Array2;

use crate::detect::ChannelMask;
use crate::error::{CleanError, Result};
use crate::linalg::pinv;
use crate::template::ChannelTemplate;

const LEGENDRE_TERMS: usize = 50;
const SPLINE_ORDER: i32 = 4;
/// Fewest positioned good channels an interpolation may use.
const MIN_SOURCES: usize = 3;

/// Legendre polynomials `P_1(x) ..= P_n(x)`.
fn legendre(x: f64, n: usize) -> Vec<f64> {
    let mut p = Vec::with_capacity(n);
    let (mut prev, mut cur) = (1.0, x);
    p.push(cur);
    for k in 2..=n {
        let next = ((2 * k - 1) as f64 * x * cur - (k - 1) as f64 * prev) / k as f64;
        prev = cur;
        cur = next;
        p.push(cur);
    }
    p
}

/// Spline kernel `g(cos θ)`.
pub fn spline_g(cos_angle: f64) -> f64 {
    let x = cos_angle.clamp(-1.0, 1.0);
    legendre(x, LEGENDRE_TERMS)
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let n = (i + 1) as f64;
            (2.0 * n + 1.0) / (n * (n + 1.0)).powi(SPLINE_ORDER) * p
        })
        .sum::<f64>()
        / (4.0 * PI)
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// `[to, from]` matrix mapping good-channel data onto the `to` positions.
pub fn interpolation_matrix(from: &[[f64; 3]], to: &[[f64; 3]]) -> Result<Array2<f64>> {
    let nf = from.len();
    if nf < MIN_SOURCES {
        return Err(CleanError::Input(format!(
            "{nf} positioned good channels are too few to interpolate from"
        )));
    }
    let mut c = Array2::<f64>::zeros((nf + 1, nf + 1));
    for i in 0..nf {
        for j in 0..nf {
            c[[i, j]] = spline_g(dot(&from[i], &from[j]));
        }
        c[[i, nf]] = 1.0;
        c[[nf, i]] = 1.0;
    }
    let c_inv = pinv(&c)?;

    let mut g_to = Array2::<f64>::ones((to.len(), nf + 1));
    for (i, p) in to.iter().enumerate() {
        for (j, q) in from.iter().enumerate() {
            g_to[[i, j]] = spline_g(dot(p, q));
        }
    }
    Ok(g_to.dot(&c_inv.slice(ndarray::s![.., ..nf])))
}

/// Rebuild every flagged channel of `data` (`[C, T]`, template order) from
/// the good channels.
///
/// Flagged channels without a position cannot be interpolated; they are
/// left as they are and reported with a warning.  Returns the indices that
/// were actually rebuilt.
pub fn interpolate_bad_channels(
    data: &mut Array2<f64>,
    template: &ChannelTemplate,
    mask: &ChannelMask,
) -> Result<Vec<usize>> {
    if mask.len() != data.nrows() || template.len() != data.nrows() {
        return Err(CleanError::Invariant(format!(
            "interpolation: {} data rows, {} mask entries, {} template channels",
            data.nrows(),
            mask.len(),
            template.len()
        )));
    }
    let mut targets = Vec::new();
    for i in mask.bad_indices() {
        if template.position(i).is_some() {
            targets.push(i);
        } else {
            log::warn!(
                "bad channel '{}' has no position and is kept un-interpolated",
                template.channels()[i].label
            );
        }
    }
    if targets.is_empty() {
        return Ok(vec![]);
    }

    let sources: Vec<usize> = mask
        .good_indices()
        .into_iter()
        .filter(|&i| template.position(i).is_some())
        .collect();
    if sources.len() < MIN_SOURCES {
        log::warn!(
            "only {} positioned good channel(s); {} bad channel(s) kept un-interpolated",
            sources.len(),
            targets.len()
        );
        return Ok(vec![]);
    }
    let from: Vec<[f64; 3]> = sources.iter().filter_map(|&i| template.position(i)).collect();
    let to: Vec<[f64; 3]> = targets.iter().filter_map(|&i| template.position(i)).collect();
    let m = interpolation_matrix(&from, &to)?;

    let good = data.select(ndarray::Axis(0), &sources);
    let rebuilt = m.dot(&good);
    for (k, &i) in targets.iter().enumerate() {
        data.row_mut(i).assign(&rebuilt.row(k));
    }
    log::info!(
        "interpolated {} channel(s) from {} good channel(s)",
        targets.len(),
        sources.len()
    );
    Ok(targets)
}
