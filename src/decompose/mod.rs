//! Component Decomposition Engine.
//!
//! A [`Decomposer`] turns a filtered `[C, T]` signal into a square unmixing
//! matrix `W`, a sphering (whitening) matrix `S` and a convergence trace.
//! Component activations are `W · S · X`; the mixing matrix `A = (W S)⁻¹`
//! maps them back to channels.
//!
//! The built-in engine is [`Infomax`].  Callers hold the engine behind the
//! trait so it can be replaced without touching the job.
pub mod infomax;

pub use infomax::Infomax;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::DecompositionConfig;
use crate::error::{CleanError, Result};
use crate::linalg::{all_finite, inverse};

/// An ICA-style decomposition engine.
///
/// `params.threads` is the per-job thread budget; implementations must not
/// use more threads than that.
pub trait Decomposer: Send + Sync {
    fn decompose(
        &self,
        subject: &str,
        data: ArrayView2<'_, f64>,
        params: &DecompositionConfig,
    ) -> Result<Decomposition>;
}

/// Log-likelihood samples `(iteration, LL)` in iteration order.
///
/// LL is in nats per sample per component.  Monotonic growth is expected but
/// not enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceTrace {
    pub points: Vec<(usize, f64)>,
}

impl ConvergenceTrace {
    pub fn push(&mut self, iteration: usize, ll: f64) {
        self.points.push((iteration, ll));
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.1).collect()
    }

    pub fn final_ll(&self) -> Option<f64> {
        self.points.last().map(|p| p.1)
    }

    /// Number of recorded steps where LL went down.
    pub fn decreases(&self) -> usize {
        self.points.windows(2).filter(|w| w[1].1 < w[0].1).count()
    }
}

/// A validated decomposition.
#[derive(Debug, Clone)]
pub struct Decomposition {
    /// `W`, `[C, C]`.
    pub unmixing: Array2<f64>,
    /// `S`, `[C, C]`.
    pub sphere: Array2<f64>,
    /// `(W S)⁻¹`, `[C, C]`; column `k` is the topography of component `k`.
    pub mixing: Array2<f64>,
    pub trace: ConvergenceTrace,
    pub iterations: usize,
    pub converged: bool,
    /// Index of the winning model when several were fitted.
    pub model: usize,
    /// Blow-up restarts of the winning model.
    pub restarts: usize,
}

impl Decomposition {
    /// Validate raw weights and derive the mixing matrix.
    ///
    /// Non-square, non-finite or non-invertible weights are numerical
    /// errors; nothing partial is ever returned.
    pub fn from_weights(
        unmixing: Array2<f64>,
        sphere: Array2<f64>,
        trace: ConvergenceTrace,
    ) -> Result<Self> {
        let (r, c) = unmixing.dim();
        if r != c || r == 0 {
            return Err(CleanError::Numerical(format!(
                "unmixing matrix is {r}x{c}, expected square"
            )));
        }
        if sphere.dim() != (c, c) {
            return Err(CleanError::Numerical(format!(
                "sphering matrix is {:?}, expected {c}x{c}",
                sphere.dim()
            )));
        }
        if !all_finite(&unmixing) || !all_finite(&sphere) {
            return Err(CleanError::Numerical("decomposition weights contain NaN or Inf".into()));
        }
        let mixing = inverse(&unmixing.dot(&sphere))?;
        let iterations = trace.points.last().map_or(0, |p| p.0);
        Ok(Self {
            unmixing,
            sphere,
            mixing,
            trace,
            iterations,
            converged: false,
            model: 0,
            restarts: 0,
        })
    }

    pub fn n_components(&self) -> usize {
        self.unmixing.nrows()
    }

    /// `W · S`, mapping channels to component activations.
    pub fn full_unmixing(&self) -> Array2<f64> {
        self.unmixing.dot(&self.sphere)
    }

    /// Component activations `[K, T]` of `data`.
    pub fn sources(&self, data: ArrayView2<'_, f64>) -> Array2<f64> {
        self.full_unmixing().dot(&data)
    }

    pub fn final_ll(&self) -> Option<f64> {
        self.trace.final_ll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn non_square_weights_rejected() {
        let w = Array2::zeros((2, 3));
        let s = Array2::eye(3);
        let e = Decomposition::from_weights(w, s, ConvergenceTrace::default()).unwrap_err();
        assert!(matches!(e, CleanError::Numerical(_)));
    }

    #[test]
    fn nan_weights_rejected() {
        let w = array![[1.0, f64::NAN], [0.0, 1.0]];
        let e = Decomposition::from_weights(w, Array2::eye(2), ConvergenceTrace::default())
            .unwrap_err();
        assert!(matches!(e, CleanError::Numerical(_)));
    }

    #[test]
    fn singular_weights_rejected() {
        let w = array![[1.0, 1.0], [1.0, 1.0]];
        let d = Decomposition::from_weights(w, Array2::eye(2), ConvergenceTrace::default());
        assert!(d.is_err());
    }

    #[test]
    fn mixing_inverts_unmixing() {
        let w = array![[2.0, 0.5], [0.0, 1.0]];
        let s = array![[0.5, 0.0], [0.0, 2.0]];
        let mut trace = ConvergenceTrace::default();
        trace.push(1, -1.5);
        trace.push(2, -1.4);
        let d = Decomposition::from_weights(w, s, trace).unwrap();
        let eye = d.full_unmixing().dot(&d.mixing);
        approx::assert_abs_diff_eq!(eye[[0, 0]], 1.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(eye[[1, 0]], 0.0, epsilon = 1e-12);
        assert_eq!(d.iterations, 2);
        assert_eq!(d.trace.decreases(), 0);
    }
}
