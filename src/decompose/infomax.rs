//! Extended-infomax ICA (Lee, Girolami & Sejnowski 1999).
//!
//! Full-batch natural-gradient maximum likelihood on sphered data:
//!
//! ```text
//! y   = W x
//! ΔW  = η (I − K·E[tanh(y) yᵀ] − E[y yᵀ]) W
//! k_i = sign(E[sech² y_i] E[y_i²] − E[tanh(y_i) y_i])     (+1 super-, −1 sub-Gaussian)
//! ```
//!
//! Source densities matching that score function:
//!
//! ```text
//! super:  log p(y) = −y²/2 − ln cosh y − ln Z_s
//! sub:    log p(y) = −y²/2 + ln cosh y − ½ ln 2π − ½
//! ```
//!
//! The log-likelihood `ln|det W| + ln|det S| + Σ_i E[log p(y_i)]` is
//! reported divided by the number of components.  The step size is halved
//! whenever it decreases.  A fit whose weights blow up (or whose LL stops
//! being finite) is restarted from its initial weights with half the step
//! size, at most [`MAX_RESTARTS`] times.
//!
//! The sufficient statistics of every iteration are reduced over sample
//! chunks on a dedicated `rayon` pool of exactly `params.threads` threads.
//! Chunked reduction means results are not bit-identical across thread
//! counts.
use std::f64::consts::PI;
use std::time::Instant;

use ndarray::{Array2, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use super::{ConvergenceTrace, Decomposer, Decomposition};
use crate::config::DecompositionConfig;
use crate::error::{CleanError, Result};
use crate::linalg::{inv_sqrt_sym, ln_abs_det};

pub const MAX_RESTARTS: usize = 3;
const MAX_WEIGHT: f64 = 1e8;
/// Covariance ridge, relative to the mean channel variance.
const RIDGE: f64 = 1e-7;
const ANNEAL: f64 = 0.5;
/// Components with less activation variance than this carry no signal
/// (a flat channel leaves one such direction) and are not updated.
const DEAD_VARIANCE: f64 = 1e-12;
const MIN_CHUNK: usize = 512;

/// The built-in decomposition engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Infomax;

impl Decomposer for Infomax {
    fn decompose(
        &self,
        subject: &str,
        data: ArrayView2<'_, f64>,
        params: &DecompositionConfig,
    ) -> Result<Decomposition> {
        params.validate()?;
        let fit = FitData::prepare(data, params.decimate)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.threads)
            .build()
            .map_err(|e| {
                CleanError::Config(format!("cannot build a {}-thread pool: {e}", params.threads))
            })?;

        log::info!(
            "{subject}: decomposing {} ch x {} samples (fit on {}), {} model(s), {} thread(s)",
            fit.n_ch,
            data.ncols(),
            fit.n,
            params.num_models,
            params.threads
        );

        let t0 = Instant::now();
        let mut best: Option<ModelFit> = None;
        let mut first_err: Option<CleanError> = None;
        for model in 0..params.num_models {
            let init = initial_weights(fit.n_ch, model, params.seed);
            match pool.install(|| fit_model(subject, &fit, init, params)) {
                Ok(mut f) => {
                    f.model = model;
                    log::info!(
                        "{subject}: model {model} finished after {} iterations \
                         (converged: {}), LL = {:.6}",
                        f.iterations,
                        f.converged,
                        f.final_ll
                    );
                    if best.as_ref().map_or(true, |b| f.final_ll > b.final_ll) {
                        best = Some(f);
                    }
                }
                Err(e) => {
                    log::warn!("{subject}: model {model} failed: {e}");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        let best = match best {
            Some(b) => b,
            None => {
                return Err(first_err
                    .unwrap_or_else(|| CleanError::Numerical("no model was fitted".into())))
            }
        };
        let mut out = Decomposition::from_weights(best.w, fit.sphere, best.trace)?;
        out.iterations = best.iterations;
        out.converged = best.converged;
        out.model = best.model;
        out.restarts = best.restarts;
        log::info!(
            "{subject}: decomposition done in {:.2}s, model {} selected",
            t0.elapsed().as_secs_f64(),
            out.model
        );
        Ok(out)
    }
}

/// Sphered fit samples, stored sample-major (`[N, C]` row-major) so that
/// chunks are contiguous.
struct FitData {
    samples: Vec<f64>,
    n_ch: usize,
    n: usize,
    sphere: Array2<f64>,
    ln_det_sphere: f64,
}

impl FitData {
    fn prepare(data: ArrayView2<'_, f64>, decimate: usize) -> Result<Self> {
        let (n_ch, n_t) = data.dim();
        let cols: Vec<usize> = (0..n_t).step_by(decimate.max(1)).collect();
        let n = cols.len();
        if n_ch == 0 {
            return Err(CleanError::Input("no channels to decompose".into()));
        }
        if n < 2 * n_ch {
            return Err(CleanError::Input(format!(
                "{n} fit samples are too few for {n_ch} components"
            )));
        }

        let means: Vec<f64> = (0..n_ch)
            .map(|i| cols.iter().map(|&t| data[[i, t]]).sum::<f64>() / n as f64)
            .collect();
        let mut cov = Array2::<f64>::zeros((n_ch, n_ch));
        for &t in &cols {
            for i in 0..n_ch {
                let xi = data[[i, t]] - means[i];
                for j in i..n_ch {
                    cov[[i, j]] += xi * (data[[j, t]] - means[j]);
                }
            }
        }
        for i in 0..n_ch {
            for j in i..n_ch {
                cov[[i, j]] /= n as f64;
                cov[[j, i]] = cov[[i, j]];
            }
        }
        let mean_var = cov.diag().sum() / n_ch as f64;
        if !(mean_var > 0.0 && mean_var.is_finite()) {
            return Err(CleanError::Input(format!(
                "signal variance is {mean_var}; nothing to decompose"
            )));
        }
        for i in 0..n_ch {
            cov[[i, i]] += RIDGE * mean_var;
        }
        let (sphere, ln_det_sphere) = inv_sqrt_sym(&cov)?;

        let mut samples = vec![0.0; n * n_ch];
        for (k, &t) in cols.iter().enumerate() {
            for i in 0..n_ch {
                samples[k * n_ch + i] =
                    (0..n_ch).map(|j| sphere[[i, j]] * (data[[j, t]] - means[j])).sum();
            }
        }
        Ok(Self { samples, n_ch, n, sphere, ln_det_sphere })
    }
}

/// Per-iteration sufficient statistics (sums, not means).
struct Moments {
    /// `Σ tanh(y_i) y_j`, row-major `[C, C]`.
    tanh_y: Vec<f64>,
    /// `Σ y_i y_j`, row-major `[C, C]`.
    yy: Vec<f64>,
    sech2: Vec<f64>,
    ln_cosh: Vec<f64>,
    n: usize,
}

impl Moments {
    fn zeros(c: usize) -> Self {
        Self {
            tanh_y: vec![0.0; c * c],
            yy: vec![0.0; c * c],
            sech2: vec![0.0; c],
            ln_cosh: vec![0.0; c],
            n: 0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        let add = |a: &mut Vec<f64>, b: &[f64]| a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
        add(&mut self.tanh_y, &other.tanh_y);
        add(&mut self.yy, &other.yy);
        add(&mut self.sech2, &other.sech2);
        add(&mut self.ln_cosh, &other.ln_cosh);
        self.n += other.n;
        self
    }

    fn accumulate(block: &[f64], w: &[f64], c: usize) -> Self {
        let mut m = Self::zeros(c);
        let mut y = vec![0.0; c];
        let mut th = vec![0.0; c];
        for x in block.chunks_exact(c) {
            for i in 0..c {
                y[i] = w[i * c..(i + 1) * c].iter().zip(x).map(|(a, b)| a * b).sum();
                th[i] = y[i].tanh();
                m.sech2[i] += 1.0 - th[i] * th[i];
                m.ln_cosh[i] += ln_cosh(y[i]);
            }
            for i in 0..c {
                let row = i * c;
                for j in 0..c {
                    m.tanh_y[row + j] += th[i] * y[j];
                    m.yy[row + j] += y[i] * y[j];
                }
            }
            m.n += 1;
        }
        m
    }
}

struct ModelFit {
    w: Array2<f64>,
    trace: ConvergenceTrace,
    final_ll: f64,
    iterations: usize,
    converged: bool,
    restarts: usize,
    model: usize,
}

/// `ln cosh y` without overflow.
fn ln_cosh(y: f64) -> f64 {
    let a = y.abs();
    a + (-2.0 * a).exp().ln_1p() - std::f64::consts::LN_2
}

/// `ln ∫ exp(−y²/2) / cosh(y) dy`, the super-Gaussian normaliser.
fn ln_super_norm() -> f64 {
    let h = 1e-3;
    let n = (30.0 / h) as i64;
    let z: f64 = (-n..=n)
        .map(|k| {
            let y = k as f64 * h;
            let w = if k == -n || k == n { 0.5 } else { 1.0 };
            w * (-0.5 * y * y - ln_cosh(y)).exp()
        })
        .sum::<f64>()
        * h;
    z.ln()
}

fn initial_weights(c: usize, model: usize, seed: u64) -> Array2<f64> {
    let mut w = Array2::eye(c);
    if model > 0 {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(model as u64));
        w.mapv_inplace(|v| v + rng.gen_range(-0.1..0.1));
    }
    w
}

fn moments(fit: &FitData, w: &Array2<f64>, chunk: usize) -> Moments {
    let c = fit.n_ch;
    let wv: Vec<f64> = w.iter().copied().collect();
    fit.samples
        .par_chunks(chunk * c)
        .map(|block| Moments::accumulate(block, &wv, c))
        .reduce(|| Moments::zeros(c), Moments::merge)
}

/// Component signs: `+1` super-Gaussian, `−1` sub-Gaussian.
fn signs(m: &Moments, c: usize) -> Vec<f64> {
    let n = m.n as f64;
    (0..c)
        .map(|i| {
            let k = m.sech2[i] / n * m.yy[i * c + i] / n - m.tanh_y[i * c + i] / n;
            if k >= 0.0 { 1.0 } else { -1.0 }
        })
        .collect()
}

fn log_likelihood(fit: &FitData, w: &Array2<f64>, m: &Moments, k: &[f64], ln_zs: f64) -> f64 {
    let c = fit.n_ch;
    let n = m.n as f64;
    let sub_const = 0.5 * (2.0 * PI).ln() + 0.5;
    let density: f64 = (0..c)
        .map(|i| {
            let e_y2 = m.yy[i * c + i] / n;
            let e_lc = m.ln_cosh[i] / n;
            if k[i] > 0.0 {
                -0.5 * e_y2 - e_lc - ln_zs
            } else {
                -0.5 * e_y2 + e_lc - sub_const
            }
        })
        .sum();
    (ln_abs_det(w) + fit.ln_det_sphere + density) / c as f64
}

fn fit_model(
    subject: &str,
    fit: &FitData,
    init: Array2<f64>,
    params: &DecompositionConfig,
) -> Result<ModelFit> {
    let c = fit.n_ch;
    let chunk = (fit.n / (params.threads * 4)).max(MIN_CHUNK);
    let ln_zs = ln_super_norm();
    let eye = Array2::<f64>::eye(c);
    let mut lr = params.learning_rate;
    let mut restarts = 0;

    'attempt: loop {
        let mut w = init.clone();
        let mut trace = ConvergenceTrace::default();
        let mut prev_ll = f64::NEG_INFINITY;
        let mut final_ll = f64::NEG_INFINITY;
        let mut converged = false;
        let mut iterations = 0;

        for iter in 1..=params.max_iter {
            let m = moments(fit, &w, chunk);
            let k = signs(&m, c);
            let ll = log_likelihood(fit, &w, &m, &k, ln_zs);

            let n = m.n as f64;
            let grad = Array2::from_shape_fn((c, c), |(i, j)| {
                if m.yy[i * c + i] / n < DEAD_VARIANCE {
                    0.0
                } else {
                    eye[[i, j]] - k[i] * m.tanh_y[i * c + j] / n - m.yy[i * c + j] / n
                }
            });
            let dw = grad.dot(&w) * lr;
            let change = dw.iter().fold(0.0_f64, |a, v| a.max(v.abs()));

            let blown = !ll.is_finite()
                || !change.is_finite()
                || w.iter().any(|v| v.abs() > MAX_WEIGHT);
            if blown {
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    return Err(CleanError::Numerical(format!(
                        "weights diverged at iteration {iter} after {MAX_RESTARTS} restarts"
                    )));
                }
                lr *= ANNEAL;
                log::warn!(
                    "{subject}: weights blew up at iteration {iter}; \
                     restart {restarts} with lr = {lr:e}"
                );
                continue 'attempt;
            }

            log::debug!("{subject}: iter {iter} -> LL = {ll:.6}");
            iterations = iter;
            final_ll = ll;
            converged = change < params.tolerance;
            if iter % params.trace_interval == 0 || converged || iter == params.max_iter {
                trace.push(iter, ll);
            }
            if ll < prev_ll {
                lr *= ANNEAL;
                log::debug!("{subject}: LL decreased; lr -> {lr:e}");
            }
            prev_ll = ll;
            w += &dw;
            if converged {
                break;
            }
        }

        return Ok(ModelFit { w, trace, final_ll, iterations, converged, restarts, model: 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    /// Two independent sources (a square wave and a Laplacian-ish spike
    /// train) mixed into two channels.
    fn mixed(n: usize) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(7);
        let s = Array2::from_shape_fn((2, n), |(i, t)| {
            if i == 0 {
                if (t / 37) % 2 == 0 { 1.0 } else { -1.0 }
            } else {
                let u: f64 = rng.gen_range(-1.0..1.0);
                u.signum() * (1.0 - u.abs()).max(1e-9).ln().abs()
            }
        });
        let a = ndarray::array![[1.0, 0.6], [0.4, 1.0]];
        (a.dot(&s), s)
    }

    fn params() -> DecompositionConfig {
        DecompositionConfig { max_iter: 300, tolerance: 1e-6, ..DecompositionConfig::default() }
    }

    #[test]
    fn ln_cosh_is_stable() {
        assert_abs_diff_eq!(ln_cosh(0.0), 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(ln_cosh(1.0), 1.0_f64.cosh().ln(), epsilon = 1e-12);
        assert!(ln_cosh(1e4).is_finite());
    }

    #[test]
    fn super_normaliser_matches_quadrature() {
        // ∫ exp(−y²/2) sech y dy ≈ 1.85807.
        assert_abs_diff_eq!(ln_super_norm().exp(), 1.85807, epsilon = 1e-4);
    }

    #[test]
    fn separates_two_sources() {
        let (x, s) = mixed(8000);
        let d = Infomax.decompose("t", x.view(), &params()).unwrap();
        let y = d.sources(x.view());
        // Each recovered component matches one true source up to sign/scale.
        for k in 0..2 {
            let yk = y.row(k).to_vec();
            let best = (0..2)
                .map(|i| crate::spectrum::correlation(&yk, &s.row(i).to_vec()).abs())
                .fold(0.0_f64, f64::max);
            assert!(best > 0.95, "component {k} best |r| = {best}");
        }
        assert!(d.trace.len() > 1);
        assert!(d.trace.final_ll().unwrap().is_finite());
    }

    #[test]
    fn thread_count_does_not_change_the_answer_materially() {
        let (x, _) = mixed(6000);
        let one = Infomax.decompose("t", x.view(), &params()).unwrap();
        let four = Infomax
            .decompose("t", x.view(), &DecompositionConfig { threads: 4, ..params() })
            .unwrap();
        for (a, b) in one.full_unmixing().iter().zip(four.full_unmixing().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn trace_interval_subsamples() {
        let (x, _) = mixed(4000);
        let p =
            DecompositionConfig { max_iter: 40, tolerance: 0.0, trace_interval: 10, ..params() };
        let d = Infomax.decompose("t", x.view(), &p).unwrap();
        let iters: Vec<usize> = d.trace.points.iter().map(|p| p.0).collect();
        assert_eq!(iters, vec![10, 20, 30, 40]);
        assert_eq!(d.iterations, 40);
        assert!(!d.converged);
    }

    #[test]
    fn best_of_several_models_is_kept() {
        let (x, _) = mixed(4000);
        let p = DecompositionConfig { num_models: 3, ..params() };
        let d = Infomax.decompose("t", x.view(), &p).unwrap();
        assert!(d.model < 3);
        assert_eq!(d.n_components(), 2);
    }

    #[test]
    fn flat_channel_does_not_blow_up() {
        let (x2, _) = mixed(4000);
        let mut x = Array2::<f64>::zeros((3, 4000));
        x.slice_mut(ndarray::s![..2, ..]).assign(&x2);
        let d = Infomax.decompose("t", x.view(), &params()).unwrap();
        assert_eq!(d.restarts, 0);
        let y = d.sources(x.view());
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn too_few_samples_is_input_error() {
        let x = Array2::from_shape_fn((4, 6), |(i, t)| (i + t) as f64);
        let e = Infomax.decompose("t", x.view(), &params()).unwrap_err();
        assert!(matches!(e, CleanError::Input(_)));
    }

    #[test]
    fn zero_threads_is_config_error() {
        let (x, _) = mixed(1000);
        let p = DecompositionConfig { threads: 0, ..params() };
        assert!(matches!(Infomax.decompose("t", x.view(), &p), Err(CleanError::Config(_))));
    }
}
