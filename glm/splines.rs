use ndarray::linalg::kron;
use ndarray::{Array, Array1, Array2, ArrayView1, s};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// The family of smooth basis used to compress a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmoothingKind {
    /// Cubic (or lower) B-splines with a second-order difference penalty (P-splines).
    #[serde(rename = "bs")]
    BSpline,
    /// Natural cubic regression splines parameterised by their values at the knots,
    /// with the integrated squared second derivative as penalty.
    #[serde(rename = "cr")]
    CubicRegression,
}

impl FromStr for SmoothingKind {
    type Err = BasisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bs" => Ok(SmoothingKind::BSpline),
            "cr" => Ok(SmoothingKind::CubicRegression),
            other => Err(BasisError::UnsupportedKind(other.to_string())),
        }
    }
}

/// A comprehensive error type for all operations within the spline module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Smoothing kind '{0}' is not supported; expected 'bs' or 'cr'.")]
    UnsupportedKind(String),

    #[error("Filter has {dims} dimensions but {found} {what} were given.")]
    ArityMismatch {
        dims: usize,
        found: usize,
        what: &'static str,
    },

    #[error("Dimension {axis} has extent {extent}; it needs at least 2 basis functions, but {df} were requested.")]
    InvalidDegreesOfFreedom { axis: usize, extent: usize, df: usize },

    #[error("Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis}).")]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error("Inverting the cubic spline band matrix failed: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Builds the basis matrix `S` and the penalty matrix `P` of a filter.
///
/// Each filter dimension gets its own 1-D basis evaluated on the integer grid
/// `0..dims[d]` with `df[d]` columns; the filter basis is their Kronecker
/// product, in the same row-major order as the flattened filter. The penalty is
/// `P = Σ_d λ_d (I ⊗ … ⊗ P_d ⊗ … ⊗ I)` and already carries the weights `λ_d`.
///
/// # Returns
/// `S` with shape `[prod(dims), prod(df)]` and `P` with shape `[prod(df), prod(df)]`.
pub fn build_spline_matrix(
    dims: &[usize],
    df: &[usize],
    kind: SmoothingKind,
    penalty_weights: &[f64],
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    if df.len() != dims.len() {
        return Err(BasisError::ArityMismatch {
            dims: dims.len(),
            found: df.len(),
            what: "degrees of freedom",
        });
    }
    if penalty_weights.len() != dims.len() {
        return Err(BasisError::ArityMismatch {
            dims: dims.len(),
            found: penalty_weights.len(),
            what: "penalty weights",
        });
    }

    let mut marginals = Vec::with_capacity(dims.len());
    for (axis, (&extent, &num_basis)) in dims.iter().zip(df).enumerate() {
        if extent <= 1 {
            marginals.push((Array2::ones((1, 1)), Array2::zeros((1, 1))));
            continue;
        }
        if num_basis < 2 {
            return Err(BasisError::InvalidDegreesOfFreedom {
                axis,
                extent,
                df: num_basis,
            });
        }
        let grid = Array::range(0.0, extent as f64, 1.0);
        let marginal = match kind {
            SmoothingKind::BSpline => bspline_marginal(grid.view(), num_basis)?,
            SmoothingKind::CubicRegression => cubic_regression_marginal(grid.view(), num_basis)?,
        };
        marginals.push(marginal);
    }

    let mut basis = Array2::ones((1, 1));
    for (marginal_basis, _) in &marginals {
        basis = kron(&basis, marginal_basis);
    }

    let n_basis = basis.ncols();
    let mut penalty = Array2::zeros((n_basis, n_basis));
    for (axis, &lambda) in penalty_weights.iter().enumerate() {
        if lambda == 0.0 {
            continue;
        }
        let mut term = Array2::ones((1, 1));
        for (other, (marginal_basis, marginal_penalty)) in marginals.iter().enumerate() {
            term = if other == axis {
                kron(&term, marginal_penalty)
            } else {
                kron(&term, &Array2::eye(marginal_basis.ncols()))
            };
        }
        penalty.scaled_add(lambda, &term);
    }

    Ok((basis, penalty))
}

/// Creates a penalty matrix for a B-spline basis from a difference matrix `D`.
/// The penalty is of the form `DᵗD`, penalizing the squared `order`-th
/// differences of the spline coefficients. This is the core of P-splines.
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    for _ in 0..order {
        // each pass drops one row
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }

    Ok(d.t().dot(&d))
}

fn bspline_marginal(
    grid: ArrayView1<f64>,
    num_basis: usize,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let degree = 3.min(num_basis - 1);
    let num_internal_knots = num_basis - degree - 1;
    let range = (grid[0], grid[grid.len() - 1]);
    let knots = internal::uniform_knot_vector(range, num_internal_knots, degree);

    let mut basis = Array2::zeros((grid.len(), num_basis));
    for (i, &x) in grid.iter().enumerate() {
        basis
            .row_mut(i)
            .assign(&internal::evaluate_bsplines_at_point(x, degree, knots.view()));
    }

    let penalty = create_difference_penalty_matrix(num_basis, 2.min(num_basis - 1))?;
    Ok((basis, penalty))
}

fn cubic_regression_marginal(
    grid: ArrayView1<f64>,
    num_knots: usize,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let range = (grid[0], grid[grid.len() - 1]);
    let knots = Array::linspace(range.0, range.1, num_knots);
    let (f, penalty) = internal::cubic_regression_maps(knots.view())?;

    let mut basis = Array2::zeros((grid.len(), num_knots));
    for (i, &x) in grid.iter().enumerate() {
        basis
            .row_mut(i)
            .assign(&internal::evaluate_cubic_regression_at_point(
                x,
                knots.view(),
                &f,
            ));
    }
    Ok((basis, penalty))
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Full clamped knot vector with `num_internal_knots` uniform interior knots.
    pub(super) fn uniform_knot_vector(
        data_range: (f64, f64),
        num_internal_knots: usize,
        degree: usize,
    ) -> Array1<f64> {
        let (min_val, max_val) = data_range;
        let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
        let interior = (1..=num_internal_knots).map(|i| min_val + i as f64 * h);

        std::iter::repeat_n(min_val, degree + 1)
            .chain(interior)
            .chain(std::iter::repeat_n(max_val, degree + 1))
            .collect()
    }

    /// Evaluates every B-spline basis function at `x` with the triangular
    /// Cox-de Boor recurrence.
    pub(super) fn evaluate_bsplines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_basis = knots.len() - degree - 1;

        // knot span: knots[span] <= x < knots[span + 1], clamped to the valid range
        let span = knots
            .iter()
            .rposition(|&k| k <= x)
            .unwrap_or(degree)
            .clamp(degree, num_basis - 1);

        let mut values = vec![0.0; degree + 1];
        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        values[0] = 1.0;

        for j in 1..=degree {
            left[j] = x - knots[span + 1 - j];
            right[j] = knots[span + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom.abs() > 1e-12 {
                    values[r] / denom
                } else {
                    0.0
                };
                values[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            values[j] = saved;
        }

        let mut basis_values = Array1::zeros(num_basis);
        for (i, value) in values.into_iter().enumerate() {
            basis_values[span - degree + i] = value;
        }
        basis_values
    }

    /// Returns `F`, which maps knot values to second derivatives at the knots
    /// (natural boundary conditions), and the penalty `DᵗB⁻¹D`.
    pub(super) fn cubic_regression_maps(
        knots: ArrayView1<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
        let k = knots.len();
        let mut f = Array2::zeros((k, k));
        if k < 3 {
            return Ok((f, Array2::zeros((k, k))));
        }

        let h: Vec<f64> = knots.windows(2).into_iter().map(|w| w[1] - w[0]).collect();
        let mut d = Array2::<f64>::zeros((k - 2, k));
        let mut b = Array2::<f64>::zeros((k - 2, k - 2));
        for i in 0..k - 2 {
            d[[i, i]] = 1.0 / h[i];
            d[[i, i + 1]] = -1.0 / h[i] - 1.0 / h[i + 1];
            d[[i, i + 2]] = 1.0 / h[i + 1];
            b[[i, i]] = (h[i] + h[i + 1]) / 3.0;
            if i + 1 < k - 2 {
                b[[i, i + 1]] = h[i + 1] / 6.0;
                b[[i + 1, i]] = h[i + 1] / 6.0;
            }
        }

        let b_inv_d = b.inv()?.dot(&d);
        f.slice_mut(s![1..k - 1, ..]).assign(&b_inv_d);
        let penalty = d.t().dot(&b_inv_d);
        Ok((f, penalty))
    }

    pub(super) fn evaluate_cubic_regression_at_point(
        x: f64,
        knots: ArrayView1<f64>,
        f: &Array2<f64>,
    ) -> Array1<f64> {
        let k = knots.len();
        let j = knots
            .iter()
            .rposition(|&knot| knot <= x)
            .unwrap_or(0)
            .min(k - 2);
        let h = knots[j + 1] - knots[j];
        let to_right = knots[j + 1] - x;
        let to_left = x - knots[j];

        let a_minus = to_right / h;
        let a_plus = to_left / h;
        let c_minus = (to_right.powi(3) / h - h * to_right) / 6.0;
        let c_plus = (to_left.powi(3) / h - h * to_left) / 6.0;

        let mut row = f.row(j).to_owned() * c_minus + &(f.row(j + 1).to_owned() * c_plus);
        row[j] += a_minus;
        row[j + 1] += a_plus;
        row
    }
}
