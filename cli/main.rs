#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use thiserror::Error;

use rfest::{
    Distribution, FilterSpec, FitOptions, Glm, GlmConfig, GlmError, InitMethod, InitOptions,
    Metric, Nonlinearity, ResponseSet, SelectionPolicy, SmoothingKind, Split, WeightType,
};

const RESPONSE_COLUMN: &str = "response";

#[derive(Parser)]
#[command(
    name = "rfest",
    about = "Spline-smoothed GLM receptive field estimation",
    long_about = "Fits a generalized linear encoding model of a response column from the \
                 time-lagged stimulus columns of a tab-separated file."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model to a TSV file with a `response` column and stimulus columns
    Fit(FitArgs),
    /// Show the version
    Version,
}

#[derive(Args)]
struct FitArgs {
    /// Path to a TSV file; every column other than `response` is a stimulus pixel
    data: PathBuf,

    /// TOML file with [model], [filter], [init] and [fit] tables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of time lags of the stimulus filter
    #[arg(long)]
    lags: Option<usize>,

    /// Spline degrees of freedom per filter dimension (enables smoothing)
    #[arg(long, value_delimiter = ',')]
    df: Option<Vec<usize>>,

    /// Spline family: cr or bs
    #[arg(long)]
    smoothing: Option<String>,

    /// Smoothness penalty weight
    #[arg(long)]
    penalty: Option<f64>,

    /// Noise distribution: gaussian or poisson
    #[arg(long)]
    distribution: Option<String>,

    /// Output nonlinearity, e.g. none, softplus, exponential
    #[arg(long)]
    output_nonlinearity: Option<String>,

    /// Initialization: random or mle
    #[arg(long)]
    init: Option<String>,

    #[arg(long)]
    max_iters: Option<usize>,

    #[arg(long)]
    step_size: Option<f64>,

    /// L1 share of the elastic net
    #[arg(long)]
    alpha: Option<f64>,

    /// Elastic-net weight
    #[arg(long)]
    beta: Option<f64>,

    /// Metric: r2, r2adj, mse, corrcoef or gcv
    #[arg(long)]
    metric: Option<String>,

    /// Iterate selection, e.g. best_dev_cost or last
    #[arg(long)]
    selection: Option<String>,

    /// Fraction of trailing samples held out as the dev split
    #[arg(long, default_value = "0.0")]
    dev_fraction: f64,

    /// Skip standard errors and confidence bands
    #[arg(long)]
    no_ci: bool,

    /// Write a TOML report of the fitted model here
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Error, Debug)]
enum DataError {
    #[error("Failed to read '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("Column 'response' not found in '{0}'.")]
    MissingResponse(String),
    #[error("'{0}' has no stimulus columns besides 'response'.")]
    NoStimulus(String),
    #[error("Row {row}, column '{column}': '{value}' is not a number.")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Dev fraction must lie in [0, 1), got {0}.")]
    InvalidDevFraction(f64),
    #[error("Too few samples ({0}) to split off a dev set.")]
    TooFewSamples(usize),
}

/// Stimulus frames and response read from one TSV file.
struct Recording {
    stimulus: Array2<f64>,
    response: Array1<f64>,
}

fn load_recording(path: &Path) -> Result<Recording, DataError> {
    let display = path.display().to_string();
    let csv_error = |source| DataError::Csv {
        path: display.clone(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let response_col = headers
        .iter()
        .position(|h| h == RESPONSE_COLUMN)
        .ok_or_else(|| DataError::MissingResponse(display.clone()))?;
    let stimulus_cols: Vec<usize> = (0..headers.len()).filter(|&c| c != response_col).collect();
    if stimulus_cols.is_empty() {
        return Err(DataError::NoStimulus(display.clone()));
    }

    let mut response = Vec::new();
    let mut frames = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(csv_error)?;
        let parse = |col: usize| {
            let value = record.get(col).unwrap_or("").trim();
            value.parse::<f64>().map_err(|_| DataError::NotNumeric {
                row: row + 1,
                column: headers[col].clone(),
                value: value.to_string(),
            })
        };
        response.push(parse(response_col)?);
        for &col in &stimulus_cols {
            frames.push(parse(col)?);
        }
    }

    let n = response.len();
    let stimulus = Array2::from_shape_vec((n, stimulus_cols.len()), frames)
        .map_err(|_| DataError::NoStimulus(display))?;
    Ok(Recording {
        stimulus,
        response: Array1::from(response),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct FilterConfig {
    lags: usize,
    degrees_of_freedom: Option<Vec<usize>>,
    smoothing: SmoothingKind,
    penalty: f64,
    nonlinearity: Nonlinearity,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            lags: 10,
            degrees_of_freedom: None,
            smoothing: SmoothingKind::CubicRegression,
            penalty: 0.0,
            nonlinearity: Nonlinearity::None,
        }
    }
}

/// Everything one `fit` run needs, loaded from TOML and overridden by flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    model: GlmConfig,
    filter: FilterConfig,
    init: InitOptions,
    fit: FitOptions,
}

impl RunConfig {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    fn apply(&mut self, args: &FitArgs) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(lags) = args.lags {
            self.filter.lags = lags;
        }
        if let Some(df) = &args.df {
            self.filter.degrees_of_freedom = Some(df.clone());
        }
        if let Some(kind) = &args.smoothing {
            self.filter.smoothing = kind.parse::<SmoothingKind>()?;
        }
        if let Some(penalty) = args.penalty {
            self.filter.penalty = penalty;
        }
        if let Some(distribution) = &args.distribution {
            self.model.distribution = distribution.parse::<Distribution>()?;
        }
        if let Some(nonlinearity) = &args.output_nonlinearity {
            self.model.output_nonlinearity = nonlinearity.parse::<Nonlinearity>().map_err(GlmError::from)?;
        }
        if let Some(method) = &args.init {
            self.init.method = method.parse::<InitMethod>()?;
        }
        if let Some(max_iters) = args.max_iters {
            self.fit.max_iters = max_iters;
        }
        if let Some(step_size) = args.step_size {
            self.fit.step_size = step_size;
        }
        if let Some(alpha) = args.alpha {
            self.fit.alpha = alpha;
        }
        if let Some(beta) = args.beta {
            self.fit.beta = beta;
        }
        if let Some(metric) = &args.metric {
            self.fit.metric = metric.parse::<Metric>().map_err(GlmError::from)?;
        }
        if let Some(selection) = &args.selection {
            self.fit.selection = selection.parse::<SelectionPolicy>()?;
        }
        if args.no_ci {
            self.init.compute_ci = false;
        }
        Ok(())
    }

    fn filter_spec(&self, n_pixels: usize) -> FilterSpec {
        let dims = if n_pixels == 1 {
            vec![self.filter.lags]
        } else {
            vec![self.filter.lags, n_pixels]
        };
        let spec = FilterSpec::new("stimulus")
            .dims(dims)
            .nonlinearity(self.filter.nonlinearity)
            .penalty_weight(self.filter.penalty);
        match &self.filter.degrees_of_freedom {
            Some(df) => spec
                .degrees_of_freedom(df.clone())
                .smoothing(self.filter.smoothing),
            None => spec,
        }
    }
}

#[derive(Debug, Serialize)]
struct FilterReport {
    dims: Vec<usize>,
    intercept: f64,
    weights: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight_se: Option<Vec<f64>>,
}

#[derive(Debug, Serialize)]
struct FitReport {
    distribution: Distribution,
    metric: Metric,
    stop_reason: String,
    iterations: usize,
    selected_iteration: usize,
    train_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_score: Option<f64>,
    global_intercept: f64,
    filters: BTreeMap<String, FilterReport>,
}

fn split_score(model: &Glm, metric: Metric, split: Split) -> Option<f64> {
    let y = model.response(split)?;
    let y_pred = model.prediction(WeightType::Opt, split)?;
    (y.len() == y_pred.len()).then(|| metric.evaluate(y.view(), y_pred.view(), model.edf_total()))
}

fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    config.apply(&args)?;

    println!("Loading data from: {}", args.data.display());
    let recording = load_recording(&args.data)?;
    let n = recording.response.len();
    println!("Loaded {} samples with {} stimulus columns", n, recording.stimulus.ncols());

    if !(0.0..1.0).contains(&args.dev_fraction) {
        return Err(DataError::InvalidDevFraction(args.dev_fraction).into());
    }
    let n_dev = (n as f64 * args.dev_fraction).round() as usize;
    if n_dev > 0 && n_dev + 1 >= n {
        return Err(DataError::TooFewSamples(n).into());
    }
    let n_train = n - n_dev;

    let mut model = Glm::new(config.model);
    let spec = config.filter_spec(recording.stimulus.ncols());
    model.add_filter(recording.stimulus.slice(s![..n_train, ..]), spec)?;
    let response = if n_dev > 0 {
        model.add_filter(
            recording.stimulus.slice(s![n_train.., ..]),
            FilterSpec::new("stimulus").split(Split::Dev),
        )?;
        ResponseSet::new(
            recording.response.slice(s![..n_train]).to_owned(),
            Some(recording.response.slice(s![n_train..]).to_owned()),
        )
    } else {
        ResponseSet::from(recording.response.clone())
    };

    model.initialize(Some(response.clone()), &config.init)?;
    let trace = model.fit(Some(response), &config.fit)?;
    println!(
        "Stopped after {} iterations ({}); selected iteration {}.",
        trace.len(),
        trace.stop_reason,
        trace.selected
    );

    let metric = config.fit.metric;
    let train_score = split_score(&model, metric, Split::Train).unwrap_or(f64::NAN);
    let dev_score = split_score(&model, metric, Split::Dev);
    println!("Train {metric}: {train_score:.4}");
    if let Some(score) = dev_score {
        println!("Dev {metric}: {score:.4}");
    }

    if let Some(path) = &args.report {
        let params = model
            .parameters(WeightType::Opt)
            .ok_or(GlmError::ParametersUnavailable(WeightType::Opt))?;
        let weights = model.weights(WeightType::Opt).unwrap_or_default();
        let variance = model.variance(WeightType::Opt);
        let filters = model
            .filter_names()
            .iter()
            .filter_map(|name| {
                let filter = model.filter(name)?;
                Some((
                    name.clone(),
                    FilterReport {
                        dims: filter.dims.clone(),
                        intercept: params.intercept(name),
                        weights: weights.get(name)?.to_vec(),
                        weight_se: variance
                            .and_then(|v| v.filters.get(name))
                            .map(|c| c.weight_se.to_vec()),
                    },
                ))
            })
            .collect();
        let report = FitReport {
            distribution: config.model.distribution,
            metric,
            stop_reason: trace_reason(&model),
            iterations: model.trace().map_or(0, |t| t.len()),
            selected_iteration: model.trace().map_or(0, |t| t.selected),
            train_score,
            dev_score,
            global_intercept: params.global_intercept,
            filters,
        };
        fs::write(path, toml::to_string_pretty(&report)?)?;
        println!("Report written to: {}", path.display());
    }
    Ok(())
}

fn trace_reason(model: &Glm) -> String {
    model
        .trace()
        .map(|t| t.stop_reason.to_string())
        .unwrap_or_default()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Version) => {
            println!("rfest {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
