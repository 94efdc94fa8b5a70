//! Delta-method covariance of filter weights and confidence bands of
//! predicted responses.

use crate::linalg::{Inversion, invert_or_pinv, quadratic_form_diagonal, weighted_gram};
use crate::model::{Distribution, GlmError};
use crate::nonlinearity::Nonlinearity;
use crate::params::ParameterSet;
use crate::registry::{FilterRegistry, Split};
use log::warn;
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Smallest squared output the Fisher weighting divides by.
const FISHER_FLOOR: f64 = 1e-20;

/// Covariance of one filter's coefficients.
#[derive(Debug, Clone, Serialize)]
pub struct FilterCovariance {
    /// `|V|`, elementwise absolute value of the delta-method covariance.
    pub covariance: Array2<f64>,
    /// Standard errors of the basis coefficients; absent for unsmoothed filters.
    pub coefficient_se: Option<Array1<f64>>,
    /// Standard errors in raw filter space, `S·se_b` for smoothed filters.
    pub weight_se: Array1<f64>,
    #[serde(skip)]
    pub inversion: Inversion,
}

/// Point prediction and ±2 SE bands on one split.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseBands {
    pub filter_se: BTreeMap<String, Array1<f64>>,
    pub prediction: Array1<f64>,
    pub upper: Array1<f64>,
    pub lower: Array1<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VarianceStore {
    pub filters: BTreeMap<String, FilterCovariance>,
    #[serde(skip)]
    pub responses: HashMap<Split, ResponseBands>,
}

impl VarianceStore {
    pub fn response(&self, split: Split) -> Option<&ResponseBands> {
        self.responses.get(&split)
    }

    /// Copies the covariance of `source` to every alias and drops `source`.
    pub fn alias(&mut self, source: &str, aliases: &[String]) {
        if let Some(covariance) = self.filters.remove(source) {
            for alias in aliases {
                self.filters.insert(alias.clone(), covariance.clone());
            }
        }
    }
}

/// Weight covariance of every filter from the train residuals.
///
/// Gaussian: `V = (AᵗA + P)⁻¹ · RSS / (n - edf_f)`.
/// Poisson: `V = (Aᵗ diag(U) A + P)⁻¹` with `U = 1 / h(g(Aθ))²`.
/// `A` is the projected design of a smoothed filter (with its penalty `P`) or
/// the raw design otherwise (no penalty).
pub fn filter_variance(
    registry: &FilterRegistry,
    params: &ParameterSet,
    distribution: Distribution,
    output_nonlinearity: Nonlinearity,
    y: ArrayView1<f64>,
    y_pred: ArrayView1<f64>,
) -> Result<BTreeMap<String, FilterCovariance>, GlmError> {
    if y.len() != y_pred.len() {
        return Err(GlmError::RowMismatch {
            name: "response".to_string(),
            split: Split::Train,
            expected: y_pred.len(),
            found: y.len(),
        });
    }
    let n = y.len() as f64;
    let rss: f64 = y
        .iter()
        .zip(y_pred.iter())
        .map(|(&yi, &pi)| (yi - pi).powi(2))
        .sum();

    let mut store = BTreeMap::new();
    for (filter, entry) in registry.active(Split::Train) {
        let input = entry.model_input();
        let capacity = if filter.is_smoothed() {
            filter.edf
        } else {
            filter.dims.iter().product::<usize>() as f64
        };
        if (input.nrows() as f64) < capacity {
            warn!(
                "Filter '{}': {} samples for {:.1} degrees of freedom is too small for a reasonable confidence interval.",
                filter.name,
                input.nrows(),
                capacity
            );
        }

        let mut information = match distribution {
            Distribution::Gaussian => input.t().dot(&input),
            Distribution::Poisson => {
                let coefficients = params
                    .coefficients(&filter.name)
                    .ok_or_else(|| GlmError::MissingParameters(filter.name.clone()))?;
                let drive = input.dot(coefficients);
                let filtered = filter.nonlinearity.apply(drive.view());
                let rate = output_nonlinearity.apply(filtered.view());
                let u = rate.mapv(|r| 1.0 / (r * r).max(FISHER_FLOOR));
                weighted_gram(input, u.view())
            }
        };
        if let Some(penalty) = &filter.penalty {
            information += penalty;
        }

        let (inverse, inversion) = invert_or_pinv(&information)?;
        let covariance = match distribution {
            Distribution::Gaussian => {
                let residual_dof = n - filter.edf;
                if residual_dof > 0.0 {
                    inverse * (rss / residual_dof)
                } else {
                    warn!(
                        "Filter '{}': {} samples leave no residual degrees of freedom for {:.1} effective ones; the covariance is left unscaled by the residual variance.",
                        filter.name, n, filter.edf
                    );
                    inverse
                }
            }
            Distribution::Poisson => inverse,
        }
        .mapv(f64::abs);

        let se = covariance.diag().mapv(f64::sqrt);
        let (coefficient_se, weight_se) = match &filter.basis {
            Some(basis) => (Some(se.clone()), basis.dot(&se)),
            None => (None, se),
        };
        store.insert(
            filter.name.clone(),
            FilterCovariance {
                covariance,
                coefficient_se,
                weight_se,
                inversion,
            },
        );
    }
    Ok(store)
}

/// Propagates coefficient covariance to the predicted response on `split`.
///
/// Each filter contributes `g(z)` with `z = Aθ + c` and its bands `g(z ± 2·se)`,
/// `se = sqrt(diag(A V Aᵗ))`; the summed contributions then pass through the
/// output nonlinearity with the global intercept.
pub fn response_bands(
    registry: &FilterRegistry,
    params: &ParameterSet,
    covariances: &BTreeMap<String, FilterCovariance>,
    output_nonlinearity: Nonlinearity,
    split: Split,
) -> Result<ResponseBands, GlmError> {
    let mut filter_se = BTreeMap::new();
    let mut sums: Option<[Array1<f64>; 3]> = None;

    for (filter, entry) in registry.active(split) {
        let input = entry.model_input();
        let coefficients = params
            .coefficients(&filter.name)
            .ok_or_else(|| GlmError::MissingParameters(filter.name.clone()))?;
        let covariance = covariances
            .get(&filter.name)
            .ok_or_else(|| GlmError::MissingParameters(filter.name.clone()))?;

        let se = quadratic_form_diagonal(input, &covariance.covariance).mapv(f64::sqrt);
        let drive = input.dot(coefficients) + params.intercept(&filter.name);
        let point = filter.nonlinearity.apply(drive.view());
        let upper = filter.nonlinearity.apply((&drive + &(&se * 2.0)).view());
        let lower = filter.nonlinearity.apply((&drive - &(&se * 2.0)).view());

        sums = Some(match sums {
            Some([p, u, l]) => [p + &point, u + &upper, l + &lower],
            None => [point, upper, lower],
        });
        filter_se.insert(filter.name.clone(), se);
    }

    let [point, upper, lower] = sums.ok_or(GlmError::NoDesign(split))?;
    let finish = |sum: Array1<f64>| {
        let shifted = sum + params.global_intercept;
        output_nonlinearity.apply(shifted.view())
    };
    Ok(ResponseBands {
        filter_se,
        prediction: finish(point),
        upper: finish(upper),
        lower: finish(lower),
    })
}
