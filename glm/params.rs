use crate::model::GlmError;
use crate::registry::FilterRegistry;
use ndarray::{Array1, ArrayView1, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// The named parameter instances a model keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightType {
    Random,
    Mle,
    Opt,
}

impl fmt::Display for WeightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WeightType::Random => "random",
            WeightType::Mle => "mle",
            WeightType::Opt => "opt",
        })
    }
}

/// Coefficients of every filter (basis space for smoothed filters, raw space
/// otherwise), one intercept per filter and the global intercept.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterSet {
    pub coefficients: BTreeMap<String, Array1<f64>>,
    pub intercepts: BTreeMap<String, f64>,
    pub global_intercept: f64,
}

impl ParameterSet {
    pub fn coefficients(&self, name: &str) -> Option<&Array1<f64>> {
        self.coefficients.get(name)
    }

    pub fn intercept(&self, name: &str) -> f64 {
        self.intercepts.get(name).copied().unwrap_or(0.0)
    }

    /// Checks that every filter of `layout` has a coefficient vector of the
    /// right length.
    pub fn validate(&self, layout: &ParameterLayout) -> Result<(), GlmError> {
        for block in layout.blocks() {
            let found = self
                .coefficients
                .get(&block.name)
                .map(|c| c.len())
                .ok_or_else(|| GlmError::MissingParameters(block.name.clone()))?;
            if found != block.coefficients.len() {
                return Err(GlmError::ParameterShape {
                    name: block.name.clone(),
                    expected: block.coefficients.len(),
                    found,
                });
            }
        }
        Ok(())
    }

    /// Copies the parameters of `source` to every alias and drops `source`.
    pub fn alias(&mut self, source: &str, aliases: &[String]) {
        if let Some(coefficients) = self.coefficients.remove(source) {
            for alias in aliases {
                self.coefficients.insert(alias.clone(), coefficients.clone());
            }
        }
        if let Some(intercept) = self.intercepts.remove(source) {
            for alias in aliases {
                self.intercepts.insert(alias.clone(), intercept);
            }
        }
    }
}

/// Columns of one filter in the flat parameter vector.
#[derive(Debug, Clone)]
pub struct FilterBlock {
    pub name: String,
    pub intercept_col: usize,
    pub coefficients: Range<usize>,
}

/// Flat layout `[global, (intercept, coefficients) per filter]` in registration
/// order. The MLE design matrix has exactly these columns, and the optimizer
/// works on vectors of this layout.
#[derive(Debug, Clone)]
pub struct ParameterLayout {
    blocks: Vec<FilterBlock>,
    total: usize,
}

impl ParameterLayout {
    pub const GLOBAL_INTERCEPT_COL: usize = 0;

    pub fn new(registry: &FilterRegistry) -> Self {
        let mut current_col = 1;
        let blocks = registry
            .filters()
            .map(|filter| {
                let block = FilterBlock {
                    name: filter.name.clone(),
                    intercept_col: current_col,
                    coefficients: current_col + 1..current_col + 1 + filter.n_features,
                };
                current_col += 1 + filter.n_features;
                block
            })
            .collect();
        Self {
            blocks,
            total: current_col,
        }
    }

    pub fn blocks(&self) -> &[FilterBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn flatten(&self, params: &ParameterSet) -> Result<Array1<f64>, GlmError> {
        params.validate(self)?;
        let mut flat = Array1::zeros(self.total);
        flat[Self::GLOBAL_INTERCEPT_COL] = params.global_intercept;
        for block in &self.blocks {
            flat[block.intercept_col] = params.intercept(&block.name);
            if let Some(coefficients) = params.coefficients(&block.name) {
                flat.slice_mut(s![block.coefficients.clone()]).assign(coefficients);
            }
        }
        Ok(flat)
    }

    pub fn unflatten(&self, flat: ArrayView1<f64>) -> ParameterSet {
        let mut params = ParameterSet {
            global_intercept: flat[Self::GLOBAL_INTERCEPT_COL],
            ..ParameterSet::default()
        };
        for block in &self.blocks {
            params
                .intercepts
                .insert(block.name.clone(), flat[block.intercept_col]);
            params.coefficients.insert(
                block.name.clone(),
                flat.slice(s![block.coefficients.clone()]).to_owned(),
            );
        }
        params
    }

    /// All filter coefficients concatenated in registration order, intercepts
    /// excluded.
    pub fn penalized_weights(&self, flat: ArrayView1<f64>) -> Array1<f64> {
        self.blocks
            .iter()
            .flat_map(|block| flat.slice(s![block.coefficients.clone()]).to_vec())
            .collect()
    }
}

/// Full-dimensional filter weights `w = S·b` (or the raw coefficients of
/// unsmoothed filters).
pub fn full_weights(registry: &FilterRegistry, params: &ParameterSet) -> BTreeMap<String, Array1<f64>> {
    registry
        .filters()
        .filter_map(|filter| {
            let coefficients = params.coefficients(&filter.name)?;
            let weights = match &filter.basis {
                Some(basis) => basis.dot(coefficients),
                None => coefficients.clone(),
            };
            Some((filter.name.clone(), weights))
        })
        .collect()
}
