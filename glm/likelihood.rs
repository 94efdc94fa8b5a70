//! Forward model and cost function.

use crate::model::{Distribution, GlmError};
use crate::nonlinearity::Nonlinearity;
use crate::params::{ParameterLayout, ParameterSet};
use crate::registry::{FilterRegistry, Split};
use ndarray::{Array1, ArrayView1, Zip, s};
use serde::{Deserialize, Serialize};

/// Smallest prediction the Poisson likelihood takes the log of.
pub const POISSON_FLOOR: f64 = 1e-20;

/// Elastic-net weight penalty `beta * ((1 - alpha)·‖w‖₂ + alpha·‖w‖₁)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElasticNet {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for ElasticNet {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.0,
        }
    }
}

impl ElasticNet {
    pub fn is_active(&self) -> bool {
        self.beta != 0.0
    }

    pub fn penalty(&self, w: ArrayView1<f64>) -> f64 {
        let l1: f64 = w.iter().map(|v| v.abs()).sum();
        let l2 = w.dot(&w).sqrt();
        self.beta * ((1.0 - self.alpha) * l2 + self.alpha * l1)
    }

    /// Subgradient; both norms contribute zero at `w = 0`.
    pub fn gradient(&self, w: ArrayView1<f64>) -> Array1<f64> {
        let l2 = w.dot(&w).sqrt();
        w.mapv(|v| {
            let ridge = if l2 > 0.0 { v / l2 } else { 0.0 };
            let lasso = if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            };
            self.beta * ((1.0 - self.alpha) * ridge + self.alpha * lasso)
        })
    }
}

/// Prediction actually used by the Poisson likelihood.
fn poisson_rate(r: f64) -> f64 {
    let r = if r == f64::INFINITY { 0.0 } else { r };
    r.max(POISSON_FLOOR)
}

/// Negative log-likelihood of `y` given predictions `r`, up to a constant.
pub fn negative_log_likelihood(distribution: Distribution, y: ArrayView1<f64>, r: ArrayView1<f64>) -> f64 {
    match distribution {
        Distribution::Gaussian => {
            0.5 * Zip::from(&y)
                .and(&r)
                .fold(0.0, |acc, &yi, &ri| acc + (yi - ri).powi(2))
        }
        Distribution::Poisson => Zip::from(&y).and(&r).fold(0.0, |acc, &yi, &ri| {
            let rate = poisson_rate(ri);
            acc - rate.ln() * yi + rate
        }),
    }
}

/// `dL/dr` of [`negative_log_likelihood`]; zero wherever the Poisson rate was clamped.
fn likelihood_gradient(distribution: Distribution, y: ArrayView1<f64>, r: ArrayView1<f64>) -> Array1<f64> {
    match distribution {
        Distribution::Gaussian => &r - &y,
        Distribution::Poisson => Zip::from(&y).and(&r).map_collect(|&yi, &ri| {
            if ri > POISSON_FLOOR && ri < f64::INFINITY {
                1.0 - yi / ri
            } else {
                0.0
            }
        }),
    }
}

/// Per-filter linear drive `z_f` and the summed model drive `s`.
struct ForwardTerms {
    drives: Vec<Array1<f64>>,
    total: Array1<f64>,
}

/// The statistical model of a fitted [`crate::Glm`]: filters, noise
/// distribution, output nonlinearity and the weight penalty.
#[derive(Debug, Clone, Copy)]
pub struct Likelihood<'a> {
    pub registry: &'a FilterRegistry,
    pub distribution: Distribution,
    pub output_nonlinearity: Nonlinearity,
    pub regularization: ElasticNet,
}

impl<'a> Likelihood<'a> {
    fn terms(&self, params: &ParameterSet, split: Split) -> Result<ForwardTerms, GlmError> {
        let mut drives = Vec::new();
        let mut summed: Option<Array1<f64>> = None;

        for (filter, entry) in self.registry.active(split) {
            let coefficients = params
                .coefficients(&filter.name)
                .ok_or_else(|| GlmError::MissingParameters(filter.name.clone()))?;
            let input = entry.model_input();
            if coefficients.len() != input.ncols() {
                return Err(GlmError::ParameterShape {
                    name: filter.name.clone(),
                    expected: input.ncols(),
                    found: coefficients.len(),
                });
            }

            let drive = input.dot(coefficients) + params.intercept(&filter.name);
            let output = filter.nonlinearity.apply(drive.view());
            summed = Some(match summed {
                Some(acc) => {
                    if acc.len() != output.len() {
                        return Err(GlmError::RowMismatch {
                            name: filter.name.clone(),
                            split,
                            expected: acc.len(),
                            found: output.len(),
                        });
                    }
                    acc + &output
                }
                None => output,
            });
            drives.push(drive);
        }

        let total = summed.ok_or(GlmError::NoDesign(split))? + params.global_intercept;
        Ok(ForwardTerms { drives, total })
    }

    /// `h(Σ_f g_f(A_f θ_f + c_f) + c)` over the filters registered on `split`.
    pub fn forward_pass(&self, params: &ParameterSet, split: Split) -> Result<Array1<f64>, GlmError> {
        let terms = self.terms(params, split)?;
        Ok(self.output_nonlinearity.apply(terms.total.view()))
    }

    /// Cost of `params` against `y`. The elastic net is added only on the train
    /// split and only when `penalize` is set.
    pub fn cost(
        &self,
        params: &ParameterSet,
        split: Split,
        y: ArrayView1<f64>,
        precomputed: Option<ArrayView1<f64>>,
        penalize: bool,
    ) -> Result<f64, GlmError> {
        let forward;
        let r = match precomputed {
            Some(ref r) => r.view(),
            None => {
                forward = self.forward_pass(params, split)?;
                forward.view()
            }
        };
        if r.len() != y.len() {
            return Err(GlmError::RowMismatch {
                name: "response".to_string(),
                split,
                expected: r.len(),
                found: y.len(),
            });
        }
        let loss = negative_log_likelihood(self.distribution, y, r);

        if penalize && self.regularization.is_active() && split == Split::Train {
            let w: Array1<f64> = self
                .registry
                .filters()
                .filter_map(|filter| params.coefficients(&filter.name))
                .flat_map(|c| c.iter().copied())
                .collect();
            return Ok(loss + self.regularization.penalty(w.view()));
        }
        Ok(loss)
    }

    /// Penalized train cost of a flat parameter vector and its gradient in the
    /// same layout.
    pub fn cost_and_gradient(
        &self,
        layout: &ParameterLayout,
        flat: ArrayView1<f64>,
        y: ArrayView1<f64>,
    ) -> Result<(f64, Array1<f64>), GlmError> {
        let params = layout.unflatten(flat);
        let terms = self.terms(&params, Split::Train)?;
        let r = self.output_nonlinearity.apply(terms.total.view());
        if r.len() != y.len() {
            return Err(GlmError::RowMismatch {
                name: "response".to_string(),
                split: Split::Train,
                expected: r.len(),
                found: y.len(),
            });
        }

        let mut cost = negative_log_likelihood(self.distribution, y, r.view());
        let upstream = likelihood_gradient(self.distribution, y, r.view());
        let delta_total = self
            .output_nonlinearity
            .backprop(terms.total.view(), upstream.view());

        let mut gradient = Array1::zeros(layout.len());
        gradient[ParameterLayout::GLOBAL_INTERCEPT_COL] = delta_total.sum();

        // active train filters are exactly the layout blocks, in the same order
        for ((filter, entry), drive) in self.registry.active(Split::Train).zip(&terms.drives) {
            let Some(block) = layout.blocks().iter().find(|b| b.name == filter.name) else {
                continue;
            };
            let delta_drive = filter.nonlinearity.backprop(drive.view(), delta_total.view());
            gradient[block.intercept_col] = delta_drive.sum();
            gradient
                .slice_mut(s![block.coefficients.clone()])
                .assign(&entry.model_input().t().dot(&delta_drive));
        }

        if self.regularization.is_active() {
            let w = layout.penalized_weights(flat);
            cost += self.regularization.penalty(w.view());
            let penalty_gradient = self.regularization.gradient(w.view());
            let mut offset = 0;
            for block in layout.blocks() {
                let n = block.coefficients.len();
                let mut slot = gradient.slice_mut(s![block.coefficients.clone()]);
                slot += &penalty_gradient.slice(s![offset..offset + n]);
                offset += n;
            }
        }

        Ok((cost, gradient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BurnInPolicy, FilterSpec};
    use crate::splines::SmoothingKind;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn registry() -> FilterRegistry {
        let x = Array2::from_shape_fn((40, 2), |(t, p)| (((t * 5 + p * 7) % 9) as f64 - 4.0) / 4.0);
        let h = Array1::from_shape_fn(40, |t| ((t % 4) as f64) / 4.0);
        let mut registry = FilterRegistry::new(BurnInPolicy::FirstFilter);
        registry
            .add_filter(
                (&x).into(),
                FilterSpec::new("stimulus")
                    .dims([3, 2])
                    .degrees_of_freedom([3, 2])
                    .smoothing(SmoothingKind::CubicRegression)
                    .nonlinearity(Nonlinearity::Softplus),
            )
            .unwrap();
        registry
            .add_filter(
                (&h).into(),
                FilterSpec::new("history").dims([2]).shift(1).nonlinearity(Nonlinearity::Tanh),
            )
            .unwrap();
        registry
    }

    #[test]
    fn poisson_cost_is_finite_and_grows_as_predictions_shrink() {
        let y = array![1.0, 2.0, 3.0, 1.0];
        let r = array![1.5, 1.5, 2.5, 0.5];
        let base = negative_log_likelihood(Distribution::Poisson, y.view(), r.view());
        assert!(base.is_finite());
        let mut previous = base;
        for scale in [0.5, 0.1, 1e-3, 1e-8] {
            let shrunk = &r * scale;
            let cost = negative_log_likelihood(Distribution::Poisson, y.view(), shrunk.view());
            assert!(cost.is_finite());
            assert!(cost > previous);
            previous = cost;
        }
        // zero and infinite predictions are clamped rather than producing NaN
        let degenerate = array![0.0, f64::INFINITY, 1.0, 1.0];
        assert!(negative_log_likelihood(Distribution::Poisson, y.view(), degenerate.view()).is_finite());
    }

    #[test]
    fn gaussian_cost_is_half_the_residual_sum_of_squares() {
        let y = array![1.0, 2.0, 3.0];
        let r = array![1.0, 1.0, 5.0];
        assert_abs_diff_eq!(negative_log_likelihood(Distribution::Gaussian, y.view(), r.view()), 2.5);
    }

    #[test]
    fn elastic_net_mixes_the_two_norms() {
        let w = array![3.0, -4.0];
        let lasso = ElasticNet { alpha: 1.0, beta: 0.5 };
        let ridge = ElasticNet { alpha: 0.0, beta: 0.5 };
        assert_abs_diff_eq!(lasso.penalty(w.view()), 3.5);
        assert_abs_diff_eq!(ridge.penalty(w.view()), 2.5);
        assert_eq!(lasso.gradient(w.view()), array![0.5, -0.5]);
        assert_eq!(ridge.gradient(array![0.0, 0.0].view()), array![0.0, 0.0]);
    }

    fn check_gradient(distribution: Distribution, output: Nonlinearity, y: Array1<f64>) {
        let registry = registry();
        let layout = ParameterLayout::new(&registry);
        let likelihood = Likelihood {
            registry: &registry,
            distribution,
            output_nonlinearity: output,
            regularization: ElasticNet { alpha: 0.3, beta: 0.05 },
        };
        let flat = Array1::from_shape_fn(layout.len(), |i| 0.1 * ((i % 5) as f64 - 2.0) + 0.05);
        let (cost, gradient) = likelihood.cost_and_gradient(&layout, flat.view(), y.view()).unwrap();

        let params = layout.unflatten(flat.view());
        let direct = likelihood.cost(&params, Split::Train, y.view(), None, true).unwrap();
        assert_abs_diff_eq!(cost, direct, epsilon = 1e-10);

        let h = 1e-6;
        for j in 0..layout.len() {
            let mut plus = flat.clone();
            let mut minus = flat.clone();
            plus[j] += h;
            minus[j] -= h;
            let numeric = (likelihood.cost_and_gradient(&layout, plus.view(), y.view()).unwrap().0
                - likelihood.cost_and_gradient(&layout, minus.view(), y.view()).unwrap().0)
                / (2.0 * h);
            assert_abs_diff_eq!(gradient[j], numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn gaussian_gradient_matches_finite_differences() {
        let y = Array1::from_shape_fn(38, |t| ((t % 6) as f64) / 3.0);
        check_gradient(Distribution::Gaussian, Nonlinearity::None, y);
    }

    #[test]
    fn poisson_gradient_matches_finite_differences() {
        let y = Array1::from_shape_fn(38, |t| (t % 3) as f64);
        check_gradient(Distribution::Poisson, Nonlinearity::Softplus, y);
    }

    #[test]
    fn forward_pass_sums_filter_outputs_before_the_output_nonlinearity() {
        let registry = registry();
        let layout = ParameterLayout::new(&registry);
        let mut params = layout.unflatten(Array1::zeros(layout.len()).view());
        params.global_intercept = 0.5;
        params.intercepts.insert("history".to_string(), 1.0);
        let likelihood = Likelihood {
            registry: &registry,
            distribution: Distribution::Gaussian,
            output_nonlinearity: Nonlinearity::Exponential,
            regularization: ElasticNet::default(),
        };
        let r = likelihood.forward_pass(&params, Split::Train).unwrap();
        // softplus(0) + tanh(1) + 0.5
        let expected = (2.0_f64.ln() + 1e-7 + 1.0_f64.tanh() + 0.5).exp();
        assert_eq!(r.len(), 38);
        for &value in &r {
            assert_abs_diff_eq!(value, expected, epsilon = 1e-12);
        }
        assert!(matches!(
            likelihood.forward_pass(&params, Split::Dev),
            Err(GlmError::NoDesign(Split::Dev))
        ));
    }
}
