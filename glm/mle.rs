//! Closed-form least-squares initializer.

use crate::linalg::solve_normal_equations;
use crate::model::GlmError;
use crate::params::{ParameterLayout, ParameterSet};
use crate::registry::{FilterRegistry, Split};
use log::debug;
use ndarray::{Array2, ArrayView1, s};

/// Assembles `[1 | (1 | A_f) per filter]` over the train split, in layout order.
pub fn assemble_design(registry: &FilterRegistry, layout: &ParameterLayout, n_samples: usize) -> Result<Array2<f64>, GlmError> {
    let mut design = Array2::zeros((n_samples, layout.len()));
    design.column_mut(ParameterLayout::GLOBAL_INTERCEPT_COL).fill(1.0);

    for block in layout.blocks() {
        let entry = registry
            .design(Split::Train, &block.name)
            .ok_or_else(|| GlmError::UnknownFilter {
                name: block.name.clone(),
                split: Split::Train,
            })?;
        let input = entry.model_input();
        if input.nrows() != n_samples {
            return Err(GlmError::RowMismatch {
                name: block.name.clone(),
                split: Split::Train,
                expected: n_samples,
                found: input.nrows(),
            });
        }
        design.column_mut(block.intercept_col).fill(1.0);
        design
            .slice_mut(s![.., block.coefficients.clone()])
            .assign(&input);
    }
    Ok(design)
}

/// Solves the unpenalized normal equations of the additive linear model on the
/// train split and slices the solution back into named filter blocks.
pub fn compute_mle(registry: &FilterRegistry, y: ArrayView1<f64>) -> Result<ParameterSet, GlmError> {
    if y.is_empty() {
        return Err(GlmError::EmptyResponse(Split::Train));
    }
    let layout = ParameterLayout::new(registry);
    let design = assemble_design(registry, &layout, y.len())?;
    debug!(
        "MLE design: {} samples x {} columns over {} filters.",
        design.nrows(),
        design.ncols(),
        layout.blocks().len()
    );

    let xtx = design.t().dot(&design);
    let xty = design.t().dot(&y);
    let solution = solve_normal_equations(&xtx, &xty)?;
    Ok(layout.unflatten(solution.view()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BurnInPolicy, FilterSpec};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn recovers_a_noiseless_linear_filter() {
        let x = Array1::from_shape_fn(50, |t| ((t * 13) % 7) as f64 - 3.0);
        let mut registry = FilterRegistry::new(BurnInPolicy::FirstFilter);
        registry
            .add_filter((&x).into(), FilterSpec::new("stimulus").dims([3]))
            .unwrap();

        let design = registry.design(Split::Train, "stimulus").unwrap().raw.clone();
        let w_true = array![0.5, -1.0, 2.0];
        let y = design.dot(&w_true) + 0.75;

        let params = compute_mle(&registry, y.view()).unwrap();
        assert_abs_diff_eq!(params.coefficients("stimulus").unwrap(), &w_true, epsilon = 1e-8);
        // the two intercept columns are collinear; min-norm splits the offset evenly
        assert_abs_diff_eq!(
            params.global_intercept + params.intercept("stimulus"),
            0.75,
            epsilon = 1e-8
        );
        assert_abs_diff_eq!(params.global_intercept, params.intercept("stimulus"), epsilon = 1e-8);
    }

    #[test]
    fn empty_response_is_a_data_error() {
        let x = Array1::from_shape_fn(5, |t| t as f64);
        let mut registry = FilterRegistry::new(BurnInPolicy::FirstFilter);
        registry
            .add_filter((&x).into(), FilterSpec::new("stimulus").dims([2]))
            .unwrap();
        let y = Array1::<f64>::zeros(0);
        assert!(matches!(
            compute_mle(&registry, y.view()),
            Err(GlmError::EmptyResponse(Split::Train))
        ));
    }
}
