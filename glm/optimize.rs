//! Adam optimisation of the penalized train cost with early stopping and
//! iterate selection.

use crate::likelihood::Likelihood;
use crate::metrics::Metric;
use crate::model::GlmError;
use crate::params::{ParameterLayout, ParameterSet};
use crate::registry::Split;
use log::{info, warn};
use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Early stopping is never considered before this iteration.
const EARLY_STOP_WARMUP: usize = 300;
/// Signed train-cost change below which the loss counts as no longer rising.
const TRAIN_STOP_THRESHOLD: f64 = 1e-5;

/// Adam with bias correction (β₁ = 0.9, β₂ = 0.999, ε = 1e-8).
#[derive(Debug, Clone)]
pub struct Adam {
    step_size: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    pub fn new(step_size: f64, n_params: usize) -> Self {
        Self {
            step_size,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: Array1::zeros(n_params),
            v: Array1::zeros(n_params),
            t: 0,
        }
    }

    pub fn step(&mut self, params: &mut Array1<f64>, gradient: ArrayView1<f64>) {
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let m_correction = 1.0 - b1.powi(self.t);
        let v_correction = 1.0 - b2.powi(self.t);
        let (step_size, eps) = (self.step_size, self.eps);

        Zip::from(params)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(&gradient)
            .for_each(|x, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / m_correction;
                let v_hat = *v / v_correction;
                *x -= step_size * m_hat / (v_hat.sqrt() + eps);
            });
    }
}

/// Which recorded iterate [`optimize`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    BestDevCost,
    BestTrainCost,
    BestDevMetric,
    BestTrainMetric,
    /// The final iterate, or `tolerance` iterations before it after a dev stop.
    Last,
}

impl FromStr for SelectionPolicy {
    type Err = GlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best_dev_cost" => Ok(SelectionPolicy::BestDevCost),
            "best_train_cost" => Ok(SelectionPolicy::BestTrainCost),
            "best_dev_metric" => Ok(SelectionPolicy::BestDevMetric),
            "best_train_metric" => Ok(SelectionPolicy::BestTrainMetric),
            "last" => Ok(SelectionPolicy::Last),
            other => Err(GlmError::UnsupportedSelectionPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionPolicy::BestDevCost => "best_dev_cost",
            SelectionPolicy::BestTrainCost => "best_train_cost",
            SelectionPolicy::BestDevMetric => "best_dev_metric",
            SelectionPolicy::BestTrainMetric => "best_train_metric",
            SelectionPolicy::Last => "last",
        })
    }
}

impl SelectionPolicy {
    /// Parses a policy name, falling back to `best_dev_cost` for unknown names.
    pub fn resolve(name: &str) -> Self {
        name.parse().unwrap_or_else(|e| {
            warn!("{e}; falling back to 'best_dev_cost'.");
            SelectionPolicy::BestDevCost
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Dev cost rose monotonically over the tolerance window.
    DevStop,
    /// Train cost stopped rising over the tolerance window.
    TrainStop,
    MaxiterStop,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::DevStop => "dev_stop",
            StopReason::TrainStop => "train_stop",
            StopReason::MaxiterStop => "maxiter_stop",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub max_iters: usize,
    /// L1 share of the elastic net.
    pub alpha: f64,
    /// Overall elastic-net weight.
    pub beta: f64,
    pub metric: Metric,
    pub step_size: f64,
    /// Early-stopping window; 0 disables early stopping.
    pub tolerance: usize,
    /// Log progress every `verbosity` iterations; 0 is silent.
    pub verbosity: usize,
    pub selection: SelectionPolicy,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iters: 3,
            alpha: 1.0,
            beta: 0.01,
            metric: Metric::Corrcoef,
            step_size: 1e-3,
            tolerance: 10,
            verbosity: 0,
            selection: SelectionPolicy::BestDevCost,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// Penalized train cost at the parameters before this iteration's step.
    pub train_cost: f64,
    pub dev_cost: Option<f64>,
    pub train_metric: f64,
    pub dev_metric: Option<f64>,
    /// Parameters after this iteration's step.
    pub parameters: ParameterSet,
}

/// Everything recorded by one [`optimize`] call.
#[derive(Debug, Clone)]
pub struct OptimizationTrace {
    pub entries: Vec<TraceEntry>,
    pub stop_reason: StopReason,
    pub selected: usize,
    pub metric: Metric,
    pub elapsed: Duration,
}

impl OptimizationTrace {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn train_costs(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.train_cost).collect()
    }

    pub fn dev_costs(&self) -> Option<Vec<f64>> {
        self.entries.iter().map(|e| e.dev_cost).collect()
    }

    pub fn train_metrics(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.train_metric).collect()
    }

    pub fn dev_metrics(&self) -> Option<Vec<f64>> {
        self.entries.iter().map(|e| e.dev_metric).collect()
    }

    pub fn selected_entry(&self) -> Option<&TraceEntry> {
        self.entries.get(self.selected)
    }

    /// Dev metric at the selected iterate.
    pub fn metric_dev_opt(&self) -> Option<f64> {
        self.selected_entry().and_then(|e| e.dev_metric)
    }
}

/// Responses the optimizer scores against, already truncated by burn-in.
#[derive(Debug, Clone, Copy)]
pub struct Targets<'a> {
    pub train: ArrayView1<'a, f64>,
    pub dev: Option<ArrayView1<'a, f64>>,
}

/// Runs Adam on the penalized train cost from `start` for at most
/// `options.max_iters` iterations, returning the full trace with the selected
/// iterate marked.
pub fn optimize(
    likelihood: &Likelihood,
    start: &ParameterSet,
    targets: Targets,
    options: &FitOptions,
) -> Result<OptimizationTrace, GlmError> {
    if options.max_iters == 0 {
        return Err(GlmError::InvalidIterationCount);
    }
    let layout = ParameterLayout::new(likelihood.registry);
    let mut theta = layout.flatten(start)?;
    let mut adam = Adam::new(options.step_size, theta.len());
    let edf = likelihood.registry.edf_total();
    let metric = options.metric;

    let mut entries: Vec<TraceEntry> = Vec::with_capacity(options.max_iters);
    let mut stop_reason = StopReason::MaxiterStop;
    let start_time = Instant::now();

    for i in 0..options.max_iters {
        let (train_cost, gradient) = likelihood.cost_and_gradient(&layout, theta.view(), targets.train)?;
        adam.step(&mut theta, gradient.view());
        let parameters = layout.unflatten(theta.view());

        let train_pred = likelihood.forward_pass(&parameters, Split::Train)?;
        let train_metric = metric.evaluate(targets.train, train_pred.view(), edf);

        let (dev_cost, dev_metric) = match targets.dev {
            Some(dev) => {
                let dev_pred = likelihood.forward_pass(&parameters, Split::Dev)?;
                let cost = likelihood.cost(&parameters, Split::Dev, dev, Some(dev_pred.view()), false)?;
                (Some(cost), Some(metric.evaluate(dev, dev_pred.view(), edf)))
            }
            None => (None, None),
        };

        if options.verbosity > 0 && i % options.verbosity == 0 {
            match (dev_cost, dev_metric) {
                (Some(dc), Some(dm)) => info!(
                    "iter {i:>6} | {:>8.3}s | cost train {train_cost:.6} dev {dc:.6} | {metric} train {train_metric:.4} dev {dm:.4}",
                    start_time.elapsed().as_secs_f64()
                ),
                _ => info!(
                    "iter {i:>6} | {:>8.3}s | cost train {train_cost:.6} | {metric} train {train_metric:.4}",
                    start_time.elapsed().as_secs_f64()
                ),
            }
        }

        entries.push(TraceEntry {
            train_cost,
            dev_cost,
            train_metric,
            dev_metric,
            parameters,
        });

        if options.tolerance > 0 && i > EARLY_STOP_WARMUP {
            if let Some(reason) = early_stop(&entries, i, options.tolerance) {
                stop_reason = reason;
                break;
            }
        }
    }

    let elapsed = start_time.elapsed();
    let last = entries.len() - 1;
    match stop_reason {
        StopReason::DevStop => info!(
            "Stop at {last} steps: dev cost has been monotonically increasing for {} steps.",
            options.tolerance
        ),
        StopReason::TrainStop => info!(
            "Stop at {last} steps: train cost has risen by less than {TRAIN_STOP_THRESHOLD:e} per step for {} steps.",
            options.tolerance
        ),
        StopReason::MaxiterStop => info!("Stop: reached {} steps.", options.max_iters),
    }
    info!("Total time elapsed: {:.3}s.", elapsed.as_secs_f64());

    let selected = select(&entries, options.selection, metric, stop_reason, options.tolerance);
    Ok(OptimizationTrace {
        entries,
        stop_reason,
        selected,
        metric,
        elapsed,
    })
}

/// Checks the `tolerance` entries recorded before iteration `i`.
fn early_stop(entries: &[TraceEntry], i: usize, tolerance: usize) -> Option<StopReason> {
    let window = &entries[i.saturating_sub(tolerance)..i];

    let dev: Option<Vec<f64>> = window.iter().map(|e| e.dev_cost).collect();
    if let Some(dev) = dev.filter(|_| entries[i].dev_cost.is_some()) {
        if dev.windows(2).all(|w| w[1] - w[0] > 0.0) {
            return Some(StopReason::DevStop);
        }
    }

    let settled = window
        .windows(2)
        .all(|w| w[1].train_cost - w[0].train_cost < TRAIN_STOP_THRESHOLD);
    settled.then_some(StopReason::TrainStop)
}

fn argmin(values: impl Iterator<Item = f64>) -> usize {
    values
        .enumerate()
        .fold((0, f64::INFINITY), |(best_i, best), (i, v)| {
            if v < best { (i, v) } else { (best_i, best) }
        })
        .0
}

fn argmax(values: impl Iterator<Item = f64>) -> usize {
    argmin(values.map(|v| -v))
}

fn best_by_metric(values: impl Iterator<Item = f64>, metric: Metric) -> usize {
    if metric.lower_is_better() {
        argmin(values)
    } else {
        argmax(values)
    }
}

/// Index of the iterate returned under `policy`.
pub fn select(
    entries: &[TraceEntry],
    policy: SelectionPolicy,
    metric: Metric,
    stop_reason: StopReason,
    tolerance: usize,
) -> usize {
    let last = entries.len().saturating_sub(1);
    let has_dev = entries.iter().all(|e| e.dev_cost.is_some()) && !entries.is_empty();

    match policy {
        SelectionPolicy::BestDevCost | SelectionPolicy::BestDevMetric if !has_dev => {
            warn!("Selection policy '{policy}' needs a dev split; returning the last iterate.");
            last
        }
        SelectionPolicy::BestDevCost => {
            argmin(entries.iter().map(|e| e.dev_cost.unwrap_or(f64::INFINITY)))
        }
        SelectionPolicy::BestTrainCost => argmin(entries.iter().map(|e| e.train_cost)),
        SelectionPolicy::BestDevMetric => best_by_metric(
            entries.iter().map(|e| e.dev_metric.unwrap_or(f64::NAN)),
            metric,
        ),
        SelectionPolicy::BestTrainMetric => {
            best_by_metric(entries.iter().map(|e| e.train_metric), metric)
        }
        SelectionPolicy::Last => match stop_reason {
            StopReason::DevStop => last.saturating_sub(tolerance),
            _ => last,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::ElasticNet;
    use crate::model::Distribution;
    use crate::nonlinearity::Nonlinearity;
    use crate::registry::{BurnInPolicy, FilterRegistry, FilterSpec};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn entry(train_cost: f64, dev_cost: Option<f64>, train_metric: f64, dev_metric: Option<f64>) -> TraceEntry {
        TraceEntry {
            train_cost,
            dev_cost,
            train_metric,
            dev_metric,
            parameters: ParameterSet::default(),
        }
    }

    #[test]
    fn adam_first_step_moves_by_the_step_size() {
        let mut adam = Adam::new(0.1, 2);
        let mut x = array![1.0, -1.0];
        adam.step(&mut x, array![2.0, -0.5].view());
        // bias correction makes the first update step_size * sign(g)
        assert_abs_diff_eq!(x, array![0.9, -0.9], epsilon = 1e-6);
    }

    #[test]
    fn adam_minimises_a_quadratic() {
        let mut adam = Adam::new(0.05, 1);
        let mut x = array![3.0];
        for _ in 0..2000 {
            let g = array![2.0 * (x[0] - 1.0)];
            adam.step(&mut x, g.view());
        }
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn selection_policies() {
        let entries = vec![
            entry(5.0, Some(3.0), 0.1, Some(0.2)),
            entry(4.0, Some(1.0), 0.3, Some(0.9)),
            entry(3.0, Some(2.0), 0.5, Some(0.4)),
            entry(2.0, Some(4.0), 0.4, Some(0.1)),
        ];
        let pick = |policy, metric| select(&entries, policy, metric, StopReason::MaxiterStop, 2);
        assert_eq!(pick(SelectionPolicy::BestDevCost, Metric::Corrcoef), 1);
        assert_eq!(pick(SelectionPolicy::BestTrainCost, Metric::Corrcoef), 3);
        assert_eq!(pick(SelectionPolicy::BestDevMetric, Metric::Corrcoef), 1);
        assert_eq!(pick(SelectionPolicy::BestDevMetric, Metric::Mse), 3);
        assert_eq!(pick(SelectionPolicy::BestTrainMetric, Metric::Corrcoef), 2);
        assert_eq!(pick(SelectionPolicy::BestTrainMetric, Metric::Gcv), 0);
        assert_eq!(pick(SelectionPolicy::Last, Metric::Corrcoef), 3);
        assert_eq!(
            select(&entries, SelectionPolicy::Last, Metric::Corrcoef, StopReason::DevStop, 2),
            1
        );
    }

    #[test]
    fn dev_policies_without_dev_fall_back_to_last() {
        let entries = vec![entry(2.0, None, 0.0, None), entry(1.0, None, 0.0, None)];
        assert_eq!(
            select(&entries, SelectionPolicy::BestDevCost, Metric::Corrcoef, StopReason::MaxiterStop, 10),
            1
        );
    }

    #[test]
    fn policy_names() {
        assert_eq!("best_train_metric".parse::<SelectionPolicy>().unwrap(), SelectionPolicy::BestTrainMetric);
        assert!(matches!(
            "best".parse::<SelectionPolicy>(),
            Err(GlmError::UnsupportedSelectionPolicy(_))
        ));
        assert_eq!(SelectionPolicy::resolve("nonsense"), SelectionPolicy::BestDevCost);
        assert_eq!(SelectionPolicy::resolve("last"), SelectionPolicy::Last);
    }

    #[test]
    fn early_stop_rules() {
        let rising: Vec<TraceEntry> = (0..12)
            .map(|i| entry(10.0 - i as f64, Some(i as f64), 0.0, Some(0.0)))
            .collect();
        assert_eq!(early_stop(&rising, 11, 5), Some(StopReason::DevStop));

        let flat: Vec<TraceEntry> = (0..12).map(|i| entry(1.0 + 1e-7 * i as f64, None, 0.0, None)).collect();
        assert_eq!(early_stop(&flat, 11, 5), Some(StopReason::TrainStop));

        let improving: Vec<TraceEntry> = (0..12).map(|i| entry(10.0 - i as f64, None, 0.0, None)).collect();
        assert_eq!(early_stop(&improving, 11, 5), Some(StopReason::TrainStop));

        let climbing: Vec<TraceEntry> = (0..12).map(|i| entry(1.0 + 1e-3 * i as f64, None, 0.0, None)).collect();
        assert_eq!(early_stop(&climbing, 11, 5), None);

        // one rising step inside the window is enough to keep going
        let mut bumped = improving.clone();
        bumped[8].train_cost = 5.0;
        assert_eq!(early_stop(&bumped, 11, 5), None);
    }

    /// One constant column of length 30 on train, and on dev when `with_dev`.
    fn constant_registry(with_dev: bool) -> FilterRegistry {
        let x = Array1::from_elem(30, 1.0);
        let mut registry = FilterRegistry::new(BurnInPolicy::Fixed(0));
        registry
            .add_filter((&x).into(), FilterSpec::new("stimulus").dims([1]))
            .unwrap();
        if with_dev {
            registry
                .add_filter((&x).into(), FilterSpec::new("stimulus").split(Split::Dev))
                .unwrap();
        }
        registry
    }

    fn gaussian(registry: &FilterRegistry) -> Likelihood<'_> {
        Likelihood {
            registry,
            distribution: Distribution::Gaussian,
            output_nonlinearity: Nonlinearity::None,
            regularization: ElasticNet { alpha: 1.0, beta: 0.0 },
        }
    }

    #[test]
    fn steadily_improving_train_cost_stops_after_warmup() {
        let registry = constant_registry(false);
        let likelihood = gaussian(&registry);
        let layout = ParameterLayout::new(&registry);
        let start = layout.unflatten(Array1::zeros(layout.len()).view());
        let y = Array1::from_elem(30, 2.0);
        // small steps keep the prediction well short of the target past the warm-up
        let options = FitOptions {
            max_iters: 2000,
            step_size: 1e-3,
            tolerance: 10,
            selection: SelectionPolicy::Last,
            ..FitOptions::default()
        };
        let trace = optimize(
            &likelihood,
            &start,
            Targets {
                train: y.view(),
                dev: None,
            },
            &options,
        )
        .unwrap();

        assert_eq!(trace.stop_reason, StopReason::TrainStop);
        assert_eq!(trace.len(), EARLY_STOP_WARMUP + 2);
        let costs = trace.train_costs();
        let i = costs.len() - 1;
        for w in costs[i - options.tolerance..i].windows(2) {
            assert!(w[1] - w[0] < TRAIN_STOP_THRESHOLD);
        }
        assert_eq!(trace.selected, trace.len() - 1);
        assert!(costs[i] < costs[0]);
    }

    #[test]
    fn rising_dev_cost_stops_and_last_steps_back_by_tolerance() {
        let registry = constant_registry(true);
        let likelihood = gaussian(&registry);
        let layout = ParameterLayout::new(&registry);
        let start = layout.unflatten(Array1::zeros(layout.len()).view());
        // train pulls the prediction up towards 2 while dev wants it at 0
        let train = Array1::from_elem(30, 2.0);
        let dev = Array1::zeros(30);
        let options = FitOptions {
            max_iters: 1000,
            step_size: 1e-4,
            tolerance: 10,
            selection: SelectionPolicy::Last,
            ..FitOptions::default()
        };
        let trace = optimize(
            &likelihood,
            &start,
            Targets {
                train: train.view(),
                dev: Some(dev.view()),
            },
            &options,
        )
        .unwrap();

        assert_eq!(trace.stop_reason, StopReason::DevStop);
        assert_eq!(trace.len(), EARLY_STOP_WARMUP + 2);
        assert_eq!(trace.selected, trace.len() - 1 - options.tolerance);
        let dev_costs: Vec<f64> = trace.entries.iter().filter_map(|e| e.dev_cost).collect();
        assert_eq!(dev_costs.len(), trace.len());
        assert!(dev_costs.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn dev_response_of_the_wrong_length_is_an_error() {
        let registry = constant_registry(true);
        let likelihood = gaussian(&registry);
        let layout = ParameterLayout::new(&registry);
        let start = layout.unflatten(Array1::zeros(layout.len()).view());
        let train = Array1::from_elem(30, 2.0);
        let dev = Array1::zeros(12);
        let result = optimize(
            &likelihood,
            &start,
            Targets {
                train: train.view(),
                dev: Some(dev.view()),
            },
            &FitOptions {
                max_iters: 5,
                ..FitOptions::default()
            },
        );
        assert!(matches!(
            result,
            Err(GlmError::RowMismatch {
                split: Split::Dev,
                expected: 30,
                found: 12,
                ..
            })
        ));
    }
}
