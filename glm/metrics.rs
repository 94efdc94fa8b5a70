use ndarray::{ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Goodness-of-fit score used to track and select optimisation iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Metric {
    #[serde(rename = "r2")]
    R2,
    #[serde(rename = "r2adj")]
    R2Adjusted,
    #[serde(rename = "mse")]
    Mse,
    #[default]
    #[serde(rename = "corrcoef")]
    Corrcoef,
    #[serde(rename = "gcv")]
    Gcv,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r2" => Ok(Metric::R2),
            "r2adj" => Ok(Metric::R2Adjusted),
            "mse" => Ok(Metric::Mse),
            "corrcoef" => Ok(Metric::Corrcoef),
            "gcv" => Ok(Metric::Gcv),
            other => Err(UnknownMetric(other.to_string())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::R2 => "r2",
            Metric::R2Adjusted => "r2adj",
            Metric::Mse => "mse",
            Metric::Corrcoef => "corrcoef",
            Metric::Gcv => "gcv",
        })
    }
}

impl Metric {
    /// `mse` and `gcv` are errors; every other metric is a score.
    pub fn lower_is_better(self) -> bool {
        matches!(self, Metric::Mse | Metric::Gcv)
    }

    /// Scores a prediction. `edf` is the model's total effective degrees of
    /// freedom, used by `r2adj` and `gcv` only.
    pub fn evaluate(self, y: ArrayView1<f64>, y_pred: ArrayView1<f64>, edf: f64) -> f64 {
        match self {
            Metric::R2 => r2(y, y_pred),
            Metric::R2Adjusted => r2_adjusted(y, y_pred, edf),
            Metric::Mse => mse(y, y_pred),
            Metric::Corrcoef => corrcoef(y, y_pred),
            Metric::Gcv => gcv(y, y_pred, edf),
        }
    }
}

fn residual_sum_of_squares(y: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    Zip::from(&y)
        .and(&y_pred)
        .fold(0.0, |acc, &yi, &pi| acc + (yi - pi).powi(2))
}

/// Coefficient of determination, `1 - SS_res / SS_tot`.
pub fn r2(y: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    let mean = y.mean().unwrap_or(0.0);
    let ss_tot: f64 = y.iter().map(|&yi| (yi - mean).powi(2)).sum();
    1.0 - residual_sum_of_squares(y, y_pred) / ss_tot
}

/// `1 - (1 - R²)(n - 1)/(n - p - 1)` with `p` the effective degrees of freedom.
pub fn r2_adjusted(y: ArrayView1<f64>, y_pred: ArrayView1<f64>, p: f64) -> f64 {
    let n = y.len() as f64;
    1.0 - (1.0 - r2(y, y_pred)) * (n - 1.0) / (n - p - 1.0)
}

pub fn mse(y: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    residual_sum_of_squares(y, y_pred) / y.len() as f64
}

/// Pearson correlation between response and prediction.
pub fn corrcoef(y: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    let y_mean = y.mean().unwrap_or(0.0);
    let p_mean = y_pred.mean().unwrap_or(0.0);
    let (num, y_var, p_var) = Zip::from(&y).and(&y_pred).fold(
        (0.0, 0.0, 0.0),
        |(num, y_var, p_var), &yi, &pi| {
            let dy = yi - y_mean;
            let dp = pi - p_mean;
            (num + dy * dp, y_var + dy * dy, p_var + dp * dp)
        },
    );
    num / (y_var.sqrt() * p_var.sqrt())
}

/// Generalised cross-validation score, `n·SS_res / (n - edf)²`.
pub fn gcv(y: ArrayView1<f64>, y_pred: ArrayView1<f64>, edf: f64) -> f64 {
    let n = y.len() as f64;
    n * residual_sum_of_squares(y, y_pred) / (n - edf).powi(2)
}
