use crate::design::{DesignError, RawInput};
use crate::likelihood::{ElasticNet, Likelihood};
use crate::metrics::{Metric, UnknownMetric};
use crate::mle;
use crate::nonlinearity::{Nonlinearity, UnknownNonlinearity};
use crate::optimize::{self, FitOptions, OptimizationTrace, SelectionPolicy, Targets};
use crate::params::{ParameterLayout, ParameterSet, WeightType, full_weights};
use crate::registry::{BurnInPolicy, Filter, FilterRegistry, FilterSpec, STIMULUS, Split};
use crate::splines::BasisError;
use crate::variance::{self, VarianceStore};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use ndarray_linalg::error::LinalgError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A comprehensive error type for building and fitting a model.
#[derive(Error, Debug)]
pub enum GlmError {
    #[error("Nonlinearity '{0}' is not supported.")]
    UnsupportedNonlinearity(String),

    #[error("Distribution '{0}' is not supported; expected 'gaussian' or 'poisson'.")]
    UnsupportedDistribution(String),

    #[error("Metric '{0}' is not supported; expected one of r2, r2adj, mse, corrcoef, gcv.")]
    UnsupportedMetric(String),

    #[error("Selection policy '{0}' is not supported.")]
    UnsupportedSelectionPolicy(String),

    #[error("Initialization method '{0}' is not supported; expected 'random' or 'mle'.")]
    UnsupportedInitMethod(String),

    #[error("Filter '{0}' is registered on the train split for the first time and needs dims.")]
    MissingDims(String),

    #[error("Filter '{name}' has invalid dims {dims:?}; every dimension must be positive.")]
    InvalidDims { name: String, dims: Vec<usize> },

    #[error("Filter '{name}' has {dims} dimensions but {found} degrees of freedom were given.")]
    DegreesOfFreedomArity {
        name: String,
        dims: usize,
        found: usize,
    },

    #[error("Filter '{name}' is not registered on the train split, so it cannot be added to the {split} split.")]
    UnknownFilter { name: String, split: Split },

    #[error("Subunit models need a filter named 'stimulus'.")]
    MissingStimulusFilter,

    #[error("Subunit models support exactly one stimulus filter, but '{0}' is registered alongside 'stimulus'.")]
    AmbiguousStimulus(String),

    #[error("The number of subunits must be at least 1.")]
    InvalidSubunitCount,

    #[error("The maximum number of iterations must be at least 1.")]
    InvalidIterationCount,

    #[error("The model must be initialized before fitting.")]
    NotInitialized,

    #[error("No '{0}' parameters are available; initialize or fit the model first.")]
    ParametersUnavailable(WeightType),

    #[error("The {0} response is empty after burn-in.")]
    EmptyResponse(Split),

    #[error("No {0} response was provided.")]
    MissingResponse(Split),

    #[error("No filter has a design matrix on the {0} split.")]
    NoDesign(Split),

    #[error("Filter '{name}' has {found} samples on the {split} split, but {expected} were expected.")]
    RowMismatch {
        name: String,
        split: Split,
        expected: usize,
        found: usize,
    },

    #[error("Filter '{name}' expects {expected} input columns, but {found} were given.")]
    ColumnMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Filter '{name}' expects {expected} coefficients, but {found} were given.")]
    ParameterShape {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("No parameters were given for filter '{0}'.")]
    MissingParameters(String),

    #[error("Spline basis construction failed: {0}")]
    BasisError(#[from] BasisError),

    #[error("Design matrix construction failed: {0}")]
    DesignError(#[from] DesignError),

    #[error("A linear algebra operation failed: {0}")]
    LinalgError(#[from] LinalgError),
}

impl From<UnknownNonlinearity> for GlmError {
    fn from(e: UnknownNonlinearity) -> Self {
        GlmError::UnsupportedNonlinearity(e.0)
    }
}

impl From<UnknownMetric> for GlmError {
    fn from(e: UnknownMetric) -> Self {
        GlmError::UnsupportedMetric(e.0)
    }
}

/// Noise distribution of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Gaussian,
    #[default]
    Poisson,
}

impl FromStr for Distribution {
    type Err = GlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gaussian" => Ok(Distribution::Gaussian),
            "poisson" => Ok(Distribution::Poisson),
            other => Err(GlmError::UnsupportedDistribution(other.to_string())),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Distribution::Gaussian => "gaussian",
            Distribution::Poisson => "poisson",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmConfig {
    pub distribution: Distribution,
    pub output_nonlinearity: Nonlinearity,
    pub burn_in: BurnInPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitMethod {
    #[default]
    Random,
    Mle,
}

impl FromStr for InitMethod {
    type Err = GlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(InitMethod::Random),
            "mle" => Ok(InitMethod::Mle),
            other => Err(GlmError::UnsupportedInitMethod(other.to_string())),
        }
    }
}

impl From<InitMethod> for WeightType {
    fn from(method: InitMethod) -> Self {
        match method {
            InitMethod::Random => WeightType::Random,
            InitMethod::Mle => WeightType::Mle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    pub num_subunits: usize,
    /// Sampling interval of the recording, in seconds.
    pub dt: f64,
    pub method: InitMethod,
    pub compute_ci: bool,
    pub random_seed: u64,
    pub verbosity: usize,
    /// Standard deviation of the Gaussian noise added to the starting point.
    pub init_noise: f64,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            num_subunits: 1,
            dt: 0.033,
            method: InitMethod::Random,
            compute_ci: true,
            random_seed: 2046,
            verbosity: 0,
            init_noise: 0.0,
        }
    }
}

/// Train response and optional dev response, before burn-in.
#[derive(Debug, Clone)]
pub struct ResponseSet {
    pub train: Array1<f64>,
    pub dev: Option<Array1<f64>>,
}

impl ResponseSet {
    pub fn new(train: Array1<f64>, dev: Option<Array1<f64>>) -> Self {
        Self { train, dev }
    }
}

impl From<Array1<f64>> for ResponseSet {
    fn from(train: Array1<f64>) -> Self {
        Self { train, dev: None }
    }
}

/// Stimulus for prediction: a bare array is the `stimulus` filter; a named
/// list predicts from the listed filters only.
#[derive(Debug, Clone)]
pub enum StimulusInput<'a> {
    Stimulus(RawInput<'a>),
    Named(Vec<(String, RawInput<'a>)>),
}

impl<'a> From<RawInput<'a>> for StimulusInput<'a> {
    fn from(raw: RawInput<'a>) -> Self {
        StimulusInput::Stimulus(raw)
    }
}

impl<'a> From<&'a Array1<f64>> for StimulusInput<'a> {
    fn from(signal: &'a Array1<f64>) -> Self {
        StimulusInput::Stimulus(signal.into())
    }
}

impl<'a> From<&'a Array2<f64>> for StimulusInput<'a> {
    fn from(frames: &'a Array2<f64>) -> Self {
        StimulusInput::Stimulus(frames.into())
    }
}

impl<'a> From<ArrayView2<'a, f64>> for StimulusInput<'a> {
    fn from(frames: ArrayView2<'a, f64>) -> Self {
        StimulusInput::Stimulus(frames.into())
    }
}

impl<'a> From<Vec<(String, RawInput<'a>)>> for StimulusInput<'a> {
    fn from(inputs: Vec<(String, RawInput<'a>)>) -> Self {
        StimulusInput::Named(inputs)
    }
}

/// A spline-smoothed generalized linear model with one or more additive filters.
#[derive(Debug, Clone)]
pub struct Glm {
    config: GlmConfig,
    registry: FilterRegistry,
    responses: HashMap<Split, Array1<f64>>,
    parameters: BTreeMap<WeightType, ParameterSet>,
    predictions: BTreeMap<WeightType, HashMap<Split, Array1<f64>>>,
    variance: BTreeMap<WeightType, VarianceStore>,
    start: Option<ParameterSet>,
    init_method: Option<InitMethod>,
    mle_computed: bool,
    compute_ci: bool,
    dt: Option<f64>,
    regularization: ElasticNet,
    trace: Option<OptimizationTrace>,
}

impl Glm {
    pub fn new(config: GlmConfig) -> Self {
        Self {
            config,
            registry: FilterRegistry::new(config.burn_in),
            responses: HashMap::new(),
            parameters: BTreeMap::new(),
            predictions: BTreeMap::new(),
            variance: BTreeMap::new(),
            start: None,
            init_method: None,
            mle_computed: false,
            compute_ci: false,
            dt: None,
            regularization: ElasticNet::default(),
            trace: None,
        }
    }

    pub fn add_filter<'a>(&mut self, raw: impl Into<RawInput<'a>>, spec: FilterSpec) -> Result<(), GlmError> {
        self.registry.add_filter(raw.into(), spec)
    }

    fn likelihood(&self) -> Likelihood<'_> {
        Likelihood {
            registry: &self.registry,
            distribution: self.config.distribution,
            output_nonlinearity: self.config.output_nonlinearity,
            regularization: self.regularization,
        }
    }

    fn after_burn_in(&self, y: &Array1<f64>, split: Split) -> Result<Array1<f64>, GlmError> {
        let burn_in = self.registry.burn_in().min(y.len());
        let truncated = y.slice(s![burn_in..]).to_owned();
        if truncated.is_empty() {
            return Err(GlmError::EmptyResponse(split));
        }
        if self.registry.has_split(split) {
            self.registry.check_rows(split, truncated.len())?;
        }
        Ok(truncated)
    }

    fn record_responses(&mut self, response: ResponseSet) -> Result<(), GlmError> {
        let train = self.after_burn_in(&response.train, Split::Train)?;
        let dev = match &response.dev {
            Some(dev) => Some(self.after_burn_in(dev, Split::Dev)?),
            None => None,
        };
        self.responses.insert(Split::Train, train);
        if let Some(dev) = dev {
            self.responses.insert(Split::Dev, dev);
        }
        Ok(())
    }

    /// Prepares the starting point of [`Glm::fit`].
    pub fn initialize(&mut self, response: Option<ResponseSet>, options: &InitOptions) -> Result<(), GlmError> {
        if options.num_subunits == 0 {
            return Err(GlmError::InvalidSubunitCount);
        }
        self.compute_ci = options.compute_ci;

        match options.method {
            InitMethod::Random => {
                if options.verbosity > 0 {
                    info!("Initializing model parameters randomly...");
                }
                let mut params = ParameterSet::default();
                for (i, filter) in self.registry.filters().enumerate() {
                    let mut rng = StdRng::seed_from_u64(options.random_seed.wrapping_add(i as u64));
                    let coefficients = Array1::from_shape_fn(filter.n_features, |_| rng.sample::<f64, _>(StandardNormal));
                    params.coefficients.insert(filter.name.clone(), coefficients);
                    params.intercepts.insert(filter.name.clone(), 0.0);
                }
                self.parameters.insert(WeightType::Random, params);
            }
            InitMethod::Mle => {
                if options.verbosity > 0 {
                    info!("Initializing model parameters with maximum likelihood...");
                }
                if !self.mle_computed {
                    let response = response.ok_or(GlmError::MissingResponse(Split::Train))?;
                    self.compute_mle(response, options.compute_ci)?;
                }
            }
        }

        if options.num_subunits != 1 && self.registry.num_subunits() != options.num_subunits {
            let aliases = self.registry.expand_subunits(options.num_subunits)?;
            for params in self.parameters.values_mut() {
                params.alias(STIMULUS, &aliases);
            }
            for store in self.variance.values_mut() {
                store.alias(STIMULUS, &aliases);
            }
        }

        let weight_type = WeightType::from(options.method);
        let base = self
            .parameters
            .get(&weight_type)
            .ok_or(GlmError::ParametersUnavailable(weight_type))?;
        let mut start = base.clone();
        if options.init_noise != 0.0 {
            for (i, name) in self.registry.names().iter().enumerate() {
                let mut rng = StdRng::seed_from_u64(options.random_seed.wrapping_add(i as u64));
                if let Some(coefficients) = start.coefficients.get_mut(name) {
                    coefficients.mapv_inplace(|c| c + options.init_noise * rng.sample::<f64, _>(StandardNormal));
                }
            }
        }
        start.validate(&ParameterLayout::new(&self.registry))?;

        self.start = Some(start);
        self.init_method = Some(options.method);
        self.dt = Some(options.dt);
        if options.verbosity > 0 {
            info!("Finished.");
        }
        Ok(())
    }

    /// Closed-form least-squares estimate of every filter on the train split.
    pub fn compute_mle(&mut self, response: ResponseSet, compute_ci: bool) -> Result<(), GlmError> {
        self.compute_ci = compute_ci;
        self.record_responses(response)?;

        let train = self
            .responses
            .get(&Split::Train)
            .ok_or(GlmError::MissingResponse(Split::Train))?;
        let params = mle::compute_mle(&self.registry, train.view())?;
        self.parameters.insert(WeightType::Mle, params);
        self.predictions.remove(&WeightType::Mle);

        let splits = self.fitted_splits();
        self.refresh(WeightType::Mle, &splits)?;
        self.mle_computed = true;
        Ok(())
    }

    /// Minimises the penalized train cost from the point prepared by
    /// [`Glm::initialize`], recording the trace and the selected parameters as
    /// the `opt` weights.
    pub fn fit(&mut self, response: Option<ResponseSet>, options: &FitOptions) -> Result<&OptimizationTrace, GlmError> {
        let start = self.start.clone().ok_or(GlmError::NotInitialized)?;
        match response {
            Some(response) => self.record_responses(response)?,
            None if !self.responses.contains_key(&Split::Train) => {
                return Err(GlmError::MissingResponse(Split::Train));
            }
            None => {}
        }
        self.regularization = ElasticNet {
            alpha: options.alpha,
            beta: options.beta,
        };

        let mut options = options.clone();
        let has_dev = self.responses.contains_key(&Split::Dev);
        if !has_dev && options.selection != SelectionPolicy::Last {
            debug!("No dev response; selecting the last iterate instead of '{}'.", options.selection);
            options.selection = SelectionPolicy::Last;
        }

        let trace = {
            let train = self
                .responses
                .get(&Split::Train)
                .ok_or(GlmError::MissingResponse(Split::Train))?;
            let targets = Targets {
                train: train.view(),
                dev: self.responses.get(&Split::Dev).map(|y| y.view()),
            };
            optimize::optimize(&self.likelihood(), &start, targets, &options)?
        };

        let selected = trace
            .selected_entry()
            .map(|entry| entry.parameters.clone())
            .ok_or(GlmError::InvalidIterationCount)?;
        self.parameters.insert(WeightType::Opt, selected);
        self.predictions.remove(&WeightType::Opt);
        self.trace = Some(trace);

        let splits = self.fitted_splits();
        self.refresh(WeightType::Opt, &splits)?;
        self.trace.as_ref().ok_or(GlmError::NotInitialized)
    }

    fn fitted_splits(&self) -> Vec<Split> {
        [Split::Train, Split::Dev]
            .into_iter()
            .filter(|split| self.responses.contains_key(split))
            .collect()
    }

    /// Recomputes predictions (and, when enabled, the variance store) of
    /// `weight_type` on `splits`.
    fn refresh(&mut self, weight_type: WeightType, splits: &[Split]) -> Result<(), GlmError> {
        let params = self
            .parameters
            .get(&weight_type)
            .ok_or(GlmError::ParametersUnavailable(weight_type))?;

        let mut predictions = HashMap::new();
        for &split in splits {
            predictions.insert(split, self.likelihood().forward_pass(params, split)?);
        }

        let store = if self.compute_ci {
            let y = self
                .responses
                .get(&Split::Train)
                .ok_or(GlmError::MissingResponse(Split::Train))?;
            let y_pred = predictions
                .get(&Split::Train)
                .ok_or(GlmError::MissingResponse(Split::Train))?;
            let mut store = VarianceStore {
                filters: variance::filter_variance(
                    &self.registry,
                    params,
                    self.config.distribution,
                    self.config.output_nonlinearity,
                    y.view(),
                    y_pred.view(),
                )?,
                ..VarianceStore::default()
            };
            for &split in splits {
                let bands = variance::response_bands(
                    &self.registry,
                    params,
                    &store.filters,
                    self.config.output_nonlinearity,
                    split,
                )?;
                store.responses.insert(split, bands);
            }
            Some(store)
        } else {
            None
        };

        self.predictions.entry(weight_type).or_default().extend(predictions);
        if let Some(store) = store {
            self.variance.insert(weight_type, store);
        }
        Ok(())
    }

    /// Predicts the response for a fresh test stimulus with the `weight_type`
    /// weights. The test split is rebuilt on every call.
    pub fn predict<'a>(
        &mut self,
        stimulus: impl Into<StimulusInput<'a>>,
        weight_type: WeightType,
    ) -> Result<Array1<f64>, GlmError> {
        let params = self
            .parameters
            .get(&weight_type)
            .ok_or(GlmError::ParametersUnavailable(weight_type))?;

        self.registry.clear_split(Split::Test);
        match stimulus.into() {
            StimulusInput::Stimulus(raw) => {
                self.registry
                    .add_filter(raw, FilterSpec::new(STIMULUS).split(Split::Test))?;
            }
            StimulusInput::Named(inputs) => {
                for (name, raw) in inputs {
                    self.registry.add_filter(raw, FilterSpec::new(name).split(Split::Test))?;
                }
            }
        }

        let likelihood = Likelihood {
            registry: &self.registry,
            distribution: self.config.distribution,
            output_nonlinearity: self.config.output_nonlinearity,
            regularization: self.regularization,
        };
        let y_pred = likelihood.forward_pass(params, Split::Test)?;

        if self.compute_ci {
            if let Some(store) = self.variance.get_mut(&weight_type) {
                let bands = variance::response_bands(
                    &self.registry,
                    params,
                    &store.filters,
                    self.config.output_nonlinearity,
                    Split::Test,
                )?;
                store.responses.insert(Split::Test, bands);
            }
        }

        self.predictions
            .entry(weight_type)
            .or_default()
            .insert(Split::Test, y_pred.clone());
        Ok(y_pred)
    }

    /// Scores a prediction of `response` from `stimulus`. The response is
    /// truncated by the model burn-in first.
    pub fn score<'a>(
        &mut self,
        stimulus: impl Into<StimulusInput<'a>>,
        response: ArrayView1<f64>,
        metric: Metric,
        weight_type: WeightType,
        return_prediction: bool,
    ) -> Result<(f64, Option<Array1<f64>>), GlmError> {
        let burn_in = self.registry.burn_in().min(response.len());
        let y = response.slice(s![burn_in..]);
        let y_pred = self.predict(stimulus, weight_type)?;
        if y_pred.len() != y.len() {
            return Err(GlmError::RowMismatch {
                name: "response".to_string(),
                split: Split::Test,
                expected: y_pred.len(),
                found: y.len(),
            });
        }
        let score = metric.evaluate(y, y_pred.view(), self.registry.edf_total());
        Ok((score, return_prediction.then_some(y_pred)))
    }

    /// Forward pass of `params` on a registered split.
    pub fn forward_pass(&self, params: &ParameterSet, split: Split) -> Result<Array1<f64>, GlmError> {
        self.likelihood().forward_pass(params, split)
    }

    /// Cost of `params` against the stored response of `split`.
    pub fn cost(
        &self,
        params: &ParameterSet,
        split: Split,
        precomputed: Option<ArrayView1<f64>>,
        penalize: bool,
    ) -> Result<f64, GlmError> {
        let y = self
            .responses
            .get(&split)
            .ok_or(GlmError::MissingResponse(split))?;
        self.likelihood().cost(params, split, y.view(), precomputed, penalize)
    }

    pub fn config(&self) -> &GlmConfig {
        &self.config
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn filter_names(&self) -> &[String] {
        self.registry.names()
    }

    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.registry.filter(name)
    }

    pub fn parameters(&self, weight_type: WeightType) -> Option<&ParameterSet> {
        self.parameters.get(&weight_type)
    }

    /// Starting point prepared by the last [`Glm::initialize`].
    pub fn start_parameters(&self) -> Option<&ParameterSet> {
        self.start.as_ref()
    }

    /// Full-dimensional filter weights of `weight_type`.
    pub fn weights(&self, weight_type: WeightType) -> Option<BTreeMap<String, Array1<f64>>> {
        self.parameters
            .get(&weight_type)
            .map(|params| full_weights(&self.registry, params))
    }

    pub fn prediction(&self, weight_type: WeightType, split: Split) -> Option<&Array1<f64>> {
        self.predictions.get(&weight_type).and_then(|p| p.get(&split))
    }

    pub fn variance(&self, weight_type: WeightType) -> Option<&VarianceStore> {
        self.variance.get(&weight_type)
    }

    pub fn response(&self, split: Split) -> Option<&Array1<f64>> {
        self.responses.get(&split)
    }

    pub fn trace(&self) -> Option<&OptimizationTrace> {
        self.trace.as_ref()
    }

    pub fn init_method(&self) -> Option<InitMethod> {
        self.init_method
    }

    pub fn burn_in(&self) -> usize {
        self.registry.burn_in()
    }

    pub fn dt(&self) -> Option<f64> {
        self.dt
    }

    pub fn num_subunits(&self) -> usize {
        self.registry.num_subunits()
    }

    /// Sum of the effective degrees of freedom of every filter.
    pub fn edf_total(&self) -> f64 {
        self.registry.edf_total()
    }

    pub fn regularization(&self) -> ElasticNet {
        self.regularization
    }
}
