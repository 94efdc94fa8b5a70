//! The per-model store of named filters and their design matrices.

use crate::design::{RawInput, build_design_matrix};
use crate::linalg::ridge_leverage_trace;
use crate::model::GlmError;
use crate::nonlinearity::Nonlinearity;
use crate::splines::{SmoothingKind, build_spline_matrix};
use log::{debug, warn};
use ndarray::{Array2, ArrayView2, s};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Name of the filter that subunit expansion replicates.
pub const STIMULUS: &str = "stimulus";

/// Dataset split a design matrix or response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        })
    }
}

/// How many leading samples every design matrix (and response) drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BurnInPolicy {
    /// Taken once from the first registered filter: its explicit burn-in, or
    /// `dims[0] - 1`. Applies uniformly to every later filter.
    #[default]
    FirstFilter,
    Fixed(usize),
}

/// Smoothness penalty weight, either shared by all dimensions or one per dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum PenaltyWeight {
    Uniform(f64),
    PerDimension(Vec<f64>),
}

impl PenaltyWeight {
    fn resolve(&self, n_dims: usize) -> Vec<f64> {
        match self {
            PenaltyWeight::Uniform(lambda) => vec![*lambda; n_dims],
            PenaltyWeight::PerDimension(weights) => weights.clone(),
        }
    }
}

/// Arguments of [`FilterRegistry::add_filter`].
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub name: String,
    pub dims: Option<Vec<usize>>,
    pub degrees_of_freedom: Option<Vec<usize>>,
    pub smoothing: Option<SmoothingKind>,
    pub apply_time_lag: bool,
    pub penalty: PenaltyWeight,
    pub nonlinearity: Nonlinearity,
    pub split: Split,
    pub shift: isize,
    pub burn_in: Option<usize>,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            name: STIMULUS.to_string(),
            dims: None,
            degrees_of_freedom: None,
            smoothing: None,
            apply_time_lag: true,
            penalty: PenaltyWeight::Uniform(0.0),
            nonlinearity: Nonlinearity::None,
            split: Split::Train,
            shift: 0,
            burn_in: None,
        }
    }
}

impl FilterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn dims(mut self, dims: impl Into<Vec<usize>>) -> Self {
        self.dims = Some(dims.into());
        self
    }

    pub fn degrees_of_freedom(mut self, df: impl Into<Vec<usize>>) -> Self {
        self.degrees_of_freedom = Some(df.into());
        self
    }

    pub fn smoothing(mut self, kind: SmoothingKind) -> Self {
        self.smoothing = Some(kind);
        self
    }

    pub fn without_time_lag(mut self) -> Self {
        self.apply_time_lag = false;
        self
    }

    pub fn penalty_weight(mut self, lambda: f64) -> Self {
        self.penalty = PenaltyWeight::Uniform(lambda);
        self
    }

    pub fn penalty_weights(mut self, weights: impl Into<Vec<f64>>) -> Self {
        self.penalty = PenaltyWeight::PerDimension(weights.into());
        self
    }

    pub fn nonlinearity(mut self, nonlinearity: Nonlinearity) -> Self {
        self.nonlinearity = nonlinearity;
        self
    }

    pub fn split(mut self, split: Split) -> Self {
        self.split = split;
        self
    }

    pub fn shift(mut self, shift: isize) -> Self {
        self.shift = shift;
        self
    }

    pub fn burn_in(mut self, burn_in: usize) -> Self {
        self.burn_in = Some(burn_in);
        self
    }
}

/// One additive component of the model. Structural fields are fixed by the
/// train registration and reused by every other split.
#[derive(Debug, Clone)]
pub struct Filter {
    pub name: String,
    pub dims: Vec<usize>,
    pub shift: isize,
    pub nonlinearity: Nonlinearity,
    pub lagged: bool,
    pub degrees_of_freedom: Option<Vec<usize>>,
    pub penalty_weights: Vec<f64>,
    /// `S`, shape `[n_raw_features, n_features]`, present for smoothed filters.
    pub basis: Option<Array2<f64>>,
    /// `P`, already scaled by the penalty weights.
    pub penalty: Option<Array2<f64>>,
    /// Coefficient count: basis columns when smoothed, raw columns otherwise.
    pub n_features: usize,
    pub edf: f64,
}

impl Filter {
    pub fn is_smoothed(&self) -> bool {
        self.basis.is_some()
    }
}

/// Design matrices of one filter on one split, after burn-in.
#[derive(Debug, Clone)]
pub struct DesignEntry {
    pub raw: Array2<f64>,
    /// `raw · S` for smoothed filters.
    pub projected: Option<Array2<f64>>,
}

impl DesignEntry {
    /// The matrix multiplied by the filter coefficients.
    pub fn model_input(&self) -> ArrayView2<'_, f64> {
        match &self.projected {
            Some(projected) => projected.view(),
            None => self.raw.view(),
        }
    }

    pub fn n_samples(&self) -> usize {
        self.raw.nrows()
    }
}

/// Filters in explicit registration order, plus their per-split design matrices.
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    order: Vec<String>,
    filters: HashMap<String, Filter>,
    designs: HashMap<Split, HashMap<String, DesignEntry>>,
    burn_in_policy: BurnInPolicy,
    burn_in: Option<usize>,
    num_subunits: usize,
}

impl FilterRegistry {
    pub fn new(burn_in_policy: BurnInPolicy) -> Self {
        let burn_in = match burn_in_policy {
            BurnInPolicy::FirstFilter => None,
            BurnInPolicy::Fixed(n) => Some(n),
        };
        Self {
            burn_in_policy,
            burn_in,
            num_subunits: 1,
            ..Self::default()
        }
    }

    /// Registers `raw` as the design matrix of a filter on `spec.split`.
    ///
    /// A train registration (re)defines the filter's structure. Any other split
    /// reuses the train structure of the same name, or of its first subunit
    /// alias `<name>_s0`, in which case the design is stored under every
    /// subunit alias.
    pub fn add_filter(&mut self, raw: RawInput, spec: FilterSpec) -> Result<(), GlmError> {
        match spec.split {
            Split::Train => self.add_train_filter(raw, spec),
            split => self.add_split_design(raw, &spec.name, split),
        }
    }

    fn add_train_filter(&mut self, raw: RawInput, spec: FilterSpec) -> Result<(), GlmError> {
        let dims = spec
            .dims
            .clone()
            .ok_or_else(|| GlmError::MissingDims(spec.name.clone()))?;
        if dims.is_empty() || dims.contains(&0) {
            return Err(GlmError::InvalidDims {
                name: spec.name.clone(),
                dims,
            });
        }
        if let Some(df) = &spec.degrees_of_freedom {
            if df.len() != dims.len() {
                return Err(GlmError::DegreesOfFreedomArity {
                    name: spec.name.clone(),
                    dims: dims.len(),
                    found: df.len(),
                });
            }
        }

        if self.burn_in.is_none() {
            let burn_in = spec.burn_in.unwrap_or(dims[0] - 1);
            debug!("Burn-in fixed at {burn_in} samples by filter '{}'.", spec.name);
            self.burn_in = Some(burn_in);
        }
        if !spec.apply_time_lag {
            if self.burn_in.is_some_and(|b| b > 0) && !self.order.is_empty() {
                warn!(
                    "Filter '{}' has no time lag; burn-in is forced to 0 although earlier filters dropped {} samples.",
                    spec.name,
                    self.burn_in.unwrap_or(0)
                );
            }
            self.burn_in = Some(0);
        }

        let raw_design = self.raw_design(raw, &spec.name, &dims, spec.shift, spec.apply_time_lag)?;

        let penalty_weights = spec.penalty.resolve(dims.len());
        let mut filter = Filter {
            name: spec.name.clone(),
            dims,
            shift: spec.shift,
            nonlinearity: spec.nonlinearity,
            lagged: spec.apply_time_lag,
            degrees_of_freedom: spec.degrees_of_freedom.clone(),
            penalty_weights,
            basis: None,
            penalty: None,
            n_features: raw_design.ncols(),
            edf: raw_design.ncols() as f64,
        };

        let entry = match spec.smoothing {
            None => DesignEntry {
                raw: raw_design,
                projected: None,
            },
            Some(kind) => {
                let df = filter
                    .degrees_of_freedom
                    .clone()
                    .unwrap_or_else(|| filter.dims.clone());
                let (basis, penalty) =
                    build_spline_matrix(&filter.dims, &df, kind, &filter.penalty_weights)?;
                let projected = project(&raw_design, &basis, &filter.name)?;

                filter.n_features = basis.ncols();
                filter.edf = if penalty.iter().all(|&v| v == 0.0) {
                    filter.n_features as f64
                } else {
                    ridge_leverage_trace(projected.view(), &penalty)?
                };
                debug!(
                    "Filter '{}': {} raw features, {} basis functions, edf {:.3}.",
                    filter.name,
                    raw_design.ncols(),
                    filter.n_features,
                    filter.edf
                );
                filter.degrees_of_freedom = Some(df);
                filter.basis = Some(basis);
                filter.penalty = Some(penalty);
                DesignEntry {
                    raw: raw_design,
                    projected: Some(projected),
                }
            }
        };

        if !self.order.contains(&filter.name) {
            self.order.push(filter.name.clone());
        }
        self.designs
            .entry(Split::Train)
            .or_default()
            .insert(filter.name.clone(), entry);
        self.filters.insert(filter.name.clone(), filter);
        Ok(())
    }

    fn add_split_design(&mut self, raw: RawInput, name: &str, split: Split) -> Result<(), GlmError> {
        let (template, targets) = if let Some(filter) = self.filters.get(name) {
            (filter, vec![name.to_string()])
        } else if let Some(filter) = self.filters.get(&subunit_name(name, 0)) {
            let targets = (0..self.num_subunits).map(|i| subunit_name(name, i)).collect();
            (filter, targets)
        } else {
            return Err(GlmError::UnknownFilter {
                name: name.to_string(),
                split,
            });
        };

        let raw_design =
            self.raw_design(raw, name, &template.dims, template.shift, template.lagged)?;
        let projected = match &template.basis {
            Some(basis) => Some(project(&raw_design, basis, name)?),
            None => None,
        };
        let entry = DesignEntry {
            raw: raw_design,
            projected,
        };

        let store = self.designs.entry(split).or_default();
        for target in targets {
            store.insert(target, entry.clone());
        }
        Ok(())
    }

    fn raw_design(
        &self,
        raw: RawInput,
        name: &str,
        dims: &[usize],
        shift: isize,
        lagged: bool,
    ) -> Result<Array2<f64>, GlmError> {
        let frames = raw.as_frames();
        if !lagged {
            return Ok(frames.to_owned());
        }

        let n_pixels: usize = dims[1..].iter().product();
        if frames.ncols() != n_pixels {
            return Err(GlmError::ColumnMismatch {
                name: name.to_string(),
                expected: n_pixels,
                found: frames.ncols(),
            });
        }
        let design = build_design_matrix(frames, dims[0], shift)?;
        let burn_in = self.burn_in().min(design.nrows());
        Ok(design.slice(s![burn_in.., ..]).to_owned())
    }

    /// Replaces the `stimulus` filter with `n` identical subunit filters
    /// `stimulus_s0 … stimulus_s{n-1}`, placed first in registration order.
    pub fn expand_subunits(&mut self, n: usize) -> Result<Vec<String>, GlmError> {
        if n == 0 {
            return Err(GlmError::InvalidSubunitCount);
        }
        if let Some(other) = self
            .order
            .iter()
            .find(|name| name.as_str() != STIMULUS && name.contains(STIMULUS))
        {
            return Err(GlmError::AmbiguousStimulus(other.clone()));
        }
        let stimulus = self
            .filters
            .remove(STIMULUS)
            .ok_or(GlmError::MissingStimulusFilter)?;

        let aliases: Vec<String> = (0..n).map(|i| subunit_name(STIMULUS, i)).collect();
        for alias in &aliases {
            let mut filter = stimulus.clone();
            filter.name = alias.clone();
            self.filters.insert(alias.clone(), filter);
        }
        for store in self.designs.values_mut() {
            if let Some(entry) = store.remove(STIMULUS) {
                for alias in &aliases {
                    store.insert(alias.clone(), entry.clone());
                }
            }
        }

        let rest = self.order.iter().filter(|name| name.as_str() != STIMULUS).cloned();
        self.order = aliases.iter().cloned().chain(rest).collect();
        self.num_subunits = n;
        debug!("Expanded '{STIMULUS}' into {n} subunits: {:?}", self.order);
        Ok(aliases)
    }

    /// Drops every design matrix of `split`.
    pub fn clear_split(&mut self, split: Split) {
        self.designs.remove(&split);
    }

    /// Filters in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.get(name)
    }

    pub fn filters(&self) -> impl Iterator<Item = &Filter> {
        self.order.iter().filter_map(|name| self.filters.get(name))
    }

    pub fn design(&self, split: Split, name: &str) -> Option<&DesignEntry> {
        self.designs.get(&split).and_then(|store| store.get(name))
    }

    /// Filters with a design matrix on `split`, in registration order.
    pub fn active(&self, split: Split) -> impl Iterator<Item = (&Filter, &DesignEntry)> {
        self.filters()
            .filter_map(move |filter| self.design(split, &filter.name).map(|entry| (filter, entry)))
    }

    pub fn has_split(&self, split: Split) -> bool {
        self.designs.get(&split).is_some_and(|store| !store.is_empty())
    }

    /// Checks that every design matrix of `split` has `n_samples` rows.
    pub fn check_rows(&self, split: Split, n_samples: usize) -> Result<(), GlmError> {
        for (filter, entry) in self.active(split) {
            if entry.n_samples() != n_samples {
                return Err(GlmError::RowMismatch {
                    name: filter.name.clone(),
                    split,
                    expected: n_samples,
                    found: entry.n_samples(),
                });
            }
        }
        Ok(())
    }

    pub fn burn_in(&self) -> usize {
        self.burn_in.unwrap_or(0)
    }

    pub fn burn_in_policy(&self) -> BurnInPolicy {
        self.burn_in_policy
    }

    pub fn num_subunits(&self) -> usize {
        self.num_subunits
    }

    /// Sum of the effective degrees of freedom of every filter.
    pub fn edf_total(&self) -> f64 {
        self.filters().map(|f| f.edf).sum()
    }
}

pub fn subunit_name(name: &str, index: usize) -> String {
    format!("{name}_s{index}")
}

fn project(raw: &Array2<f64>, basis: &Array2<f64>, name: &str) -> Result<Array2<f64>, GlmError> {
    if raw.ncols() != basis.nrows() {
        return Err(GlmError::ColumnMismatch {
            name: name.to_string(),
            expected: basis.nrows(),
            found: raw.ncols(),
        });
    }
    Ok(raw.dot(basis))
}
