//! Dense solves shared by the MLE initializer, the registry and the variance
//! estimator.

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, Inverse, UPLO};

/// Which path `invert_or_pinv` took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inversion {
    Exact,
    Pseudo,
}

/// Inverts a symmetric matrix, falling back to the eigendecomposition
/// pseudo-inverse when LAPACK reports a singular matrix or the exact inverse is
/// not finite.
pub fn invert_or_pinv(a: &Array2<f64>) -> Result<(Array2<f64>, Inversion), LinalgError> {
    match a.inv() {
        Ok(inverse) if inverse.iter().all(|v| v.is_finite()) => Ok((inverse, Inversion::Exact)),
        Ok(_) => {
            warn!("Matrix inverse is not finite; using the pseudo-inverse instead.");
            Ok((pseudo_inverse(a)?, Inversion::Pseudo))
        }
        Err(e) => {
            warn!("Matrix inversion failed ({e}); using the pseudo-inverse instead.");
            Ok((pseudo_inverse(a)?, Inversion::Pseudo))
        }
    }
}

/// Moore-Penrose inverse of a symmetric matrix from its eigendecomposition.
pub fn pseudo_inverse(s: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
    let (eigvals, eigvecs) = s.eigh(UPLO::Lower)?;
    let largest = eigvals.iter().fold(0.0_f64, |acc, &e| acc.max(e.abs()));
    let tolerance = 1e-9 * largest.max(1.0);

    let mut d_plus = Array1::zeros(eigvals.len());
    let mut dropped = 0;
    for (i, &eig) in eigvals.iter().enumerate() {
        if eig.abs() > tolerance {
            d_plus[i] = 1.0 / eig;
        } else {
            dropped += 1;
        }
    }
    debug!("Pseudo-inverse dropped {dropped} of {} eigenvalues.", eigvals.len());
    Ok(eigvecs.dot(&Array2::from_diag(&d_plus)).dot(&eigvecs.t()))
}

/// Solves `XᵗX β = Xᵗy` through the pseudo-inverse of the Gram matrix, so
/// rank-deficient designs still yield the minimum-norm solution.
pub fn solve_normal_equations(
    xtx: &Array2<f64>,
    xty: &Array1<f64>,
) -> Result<Array1<f64>, LinalgError> {
    Ok(pseudo_inverse(xtx)?.dot(xty))
}

/// Trace of the ridge hat matrix `XS (XSᵗXS + P)⁻¹ XSᵗ`.
pub fn ridge_leverage_trace(xs: ArrayView2<f64>, p: &Array2<f64>) -> Result<f64, LinalgError> {
    let gram = xs.t().dot(&xs);
    let (inverse, _) = invert_or_pinv(&(&gram + p))?;
    // tr(A⁻¹ G) without forming the n x n hat matrix
    Ok((&inverse * &gram.t()).sum())
}

/// Row-wise `diag(X V Xᵗ)`, floored at zero.
pub fn quadratic_form_diagonal(x: ArrayView2<f64>, v: &Array2<f64>) -> Array1<f64> {
    let xv = x.dot(v);
    (&xv * &x).sum_axis(ndarray::Axis(1)).mapv(|d| d.max(0.0))
}

/// `Xᵗ diag(u) X`.
pub fn weighted_gram(x: ArrayView2<f64>, u: ArrayView1<f64>) -> Array2<f64> {
    let weighted = &x * &u.insert_axis(ndarray::Axis(1));
    x.t().dot(&weighted)
}
