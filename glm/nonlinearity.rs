//! Elementwise (and one vector-level) nonlinearities used by filters and by the
//! model output.

use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Offset keeping softplus strictly positive.
const SOFTPLUS_FLOOR: f64 = 1e-7;
/// Value a rectified-linear unit returns for non-positive input.
const RELU_FLOOR: f64 = 1e-7;
const LEAKY_SLOPE: f64 = 0.01;

/// A nonlinearity applied to a filter output or to the summed model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Nonlinearity {
    /// Identity.
    #[default]
    None,
    /// `ln(1 + e^x) + 1e-7`.
    Softplus,
    Exponential,
    /// Normalised over the whole vector (not per sample).
    Softmax,
    Sigmoid,
    Tanh,
    /// `x` for positive input, `1e-7` otherwise.
    Relu,
    /// `x` for positive input, `0.01 x` otherwise.
    LeakyRelu,
}

/// Returned when a nonlinearity name is not one of the supported kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNonlinearity(pub String);

impl FromStr for Nonlinearity {
    type Err = UnknownNonlinearity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "identity" => Ok(Nonlinearity::None),
            "softplus" => Ok(Nonlinearity::Softplus),
            "exponential" | "exp" => Ok(Nonlinearity::Exponential),
            "softmax" => Ok(Nonlinearity::Softmax),
            "sigmoid" => Ok(Nonlinearity::Sigmoid),
            "tanh" => Ok(Nonlinearity::Tanh),
            "relu" => Ok(Nonlinearity::Relu),
            "leaky_relu" => Ok(Nonlinearity::LeakyRelu),
            other => Err(UnknownNonlinearity(other.to_string())),
        }
    }
}

impl fmt::Display for Nonlinearity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Nonlinearity::None => "none",
            Nonlinearity::Softplus => "softplus",
            Nonlinearity::Exponential => "exponential",
            Nonlinearity::Softmax => "softmax",
            Nonlinearity::Sigmoid => "sigmoid",
            Nonlinearity::Tanh => "tanh",
            Nonlinearity::Relu => "relu",
            Nonlinearity::LeakyRelu => "leaky_relu",
        };
        f.write_str(name)
    }
}

fn softplus(x: f64) -> f64 {
    // ln(1 + e^x) without overflow for large x
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softmax(x: ArrayView1<f64>) -> Array1<f64> {
    let z = x.mapv(f64::exp);
    let total = z.sum();
    z / total
}

impl Nonlinearity {
    /// Applies the nonlinearity to a whole vector.
    pub fn apply(self, x: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Nonlinearity::None => x.to_owned(),
            Nonlinearity::Softplus => x.mapv(|v| softplus(v) + SOFTPLUS_FLOOR),
            Nonlinearity::Exponential => x.mapv(f64::exp),
            Nonlinearity::Softmax => softmax(x),
            Nonlinearity::Sigmoid => x.mapv(sigmoid),
            Nonlinearity::Tanh => x.mapv(f64::tanh),
            Nonlinearity::Relu => x.mapv(|v| if v > 0.0 { v } else { RELU_FLOOR }),
            Nonlinearity::LeakyRelu => x.mapv(|v| if v > 0.0 { v } else { v * LEAKY_SLOPE }),
        }
    }

    /// Vector-Jacobian product: given the input `x` and the gradient of the loss
    /// with respect to `apply(x)`, returns the gradient with respect to `x`.
    pub fn backprop(self, x: ArrayView1<f64>, upstream: ArrayView1<f64>) -> Array1<f64> {
        if let Nonlinearity::Softmax = self {
            let p = softmax(x);
            let inner = p.dot(&upstream);
            return Zip::from(&p)
                .and(&upstream)
                .map_collect(|&pi, &gi| pi * (gi - inner));
        }

        Zip::from(&x)
            .and(&upstream)
            .map_collect(|&xi, &gi| gi * self.derivative(xi))
    }

    fn derivative(self, x: f64) -> f64 {
        match self {
            Nonlinearity::None => 1.0,
            Nonlinearity::Softplus => sigmoid(x),
            Nonlinearity::Exponential => x.exp(),
            Nonlinearity::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            Nonlinearity::Tanh => 1.0 - x.tanh().powi(2),
            Nonlinearity::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Nonlinearity::LeakyRelu => {
                if x > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            // handled on the vector level in `backprop`
            Nonlinearity::Softmax => 1.0,
        }
    }
}
