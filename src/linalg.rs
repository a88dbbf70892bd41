//! Small dense-matrix helpers bridging `ndarray` and `nalgebra`.
//!
//! Signals live in `ndarray`; the few factorisations the pipeline needs
//! (symmetric eigendecomposition, inverse, pseudo-inverse, determinant)
//! come from `nalgebra`.
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;

use crate::error::{CleanError, Result};

pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    let (r, c) = a.dim();
    DMatrix::from_fn(r, c, |i, j| a[[i, j]])
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

pub fn all_finite(a: &Array2<f64>) -> bool {
    a.iter().all(|v| v.is_finite())
}

/// Inverse of a square matrix; singular or non-finite results are numerical
/// errors.
pub fn inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    let (r, c) = a.dim();
    if r != c {
        return Err(CleanError::Numerical(format!("cannot invert a {r}x{c} matrix")));
    }
    let inv = to_dmatrix(a)
        .try_inverse()
        .ok_or_else(|| CleanError::Numerical(format!("{r}x{c} matrix is singular")))?;
    let out = from_dmatrix(&inv);
    if !all_finite(&out) {
        return Err(CleanError::Numerical("matrix inverse is not finite".into()));
    }
    Ok(out)
}

/// Moore-Penrose pseudo-inverse via SVD.
pub fn pinv(a: &Array2<f64>) -> Result<Array2<f64>> {
    let m = to_dmatrix(a);
    let max_dim = m.nrows().max(m.ncols()) as f64;
    let svd = m.svd(true, true);
    let eps = svd.singular_values.max() * max_dim * f64::EPSILON;
    let p = svd
        .pseudo_inverse(eps)
        .map_err(|e| CleanError::Numerical(format!("pseudo-inverse failed: {e}")))?;
    Ok(from_dmatrix(&p))
}

/// `ln |det a|`; `-inf` for a singular matrix.
pub fn ln_abs_det(a: &Array2<f64>) -> f64 {
    to_dmatrix(a).determinant().abs().ln()
}

/// Symmetric inverse square root `V diag(λ^-1/2) Vᵀ` of a symmetric
/// positive-definite matrix, together with `ln det` of the result.
pub fn inv_sqrt_sym(a: &Array2<f64>) -> Result<(Array2<f64>, f64)> {
    let eig = SymmetricEigen::new(to_dmatrix(a));
    if let Some(bad) = eig.eigenvalues.iter().find(|l| !(**l > 0.0 && l.is_finite())) {
        return Err(CleanError::Numerical(format!(
            "covariance is not positive definite (eigenvalue {bad})"
        )));
    }
    let scale = DMatrix::from_diagonal(&eig.eigenvalues.map(|l| 1.0 / l.sqrt()));
    let v = &eig.eigenvectors;
    let root = v * scale * v.transpose();
    let ln_det = eig.eigenvalues.iter().map(|l| -0.5 * l.ln()).sum();
    Ok((from_dmatrix(&root), ln_det))
}
