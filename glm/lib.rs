#![deny(dead_code)]
#![deny(unused_imports)]

//! Spline-smoothed generalized linear encoding models.
//!
//! A [`Glm`] sums the outputs of named filters, each a linear map of a
//! time-lagged design matrix (optionally projected onto a spline basis and
//! passed through a nonlinearity), and fits the weights by closed-form least
//! squares followed by Adam on a Gaussian or Poisson cost with an elastic-net
//! penalty. Delta-method standard errors cover both the weights and the
//! predicted response.

pub mod design;
pub mod likelihood;
pub mod linalg;
pub mod metrics;
pub mod mle;
pub mod model;
pub mod nonlinearity;
pub mod optimize;
pub mod params;
pub mod registry;
pub mod splines;
pub mod variance;

pub use design::RawInput;
pub use metrics::Metric;
pub use model::{
    Distribution, Glm, GlmConfig, GlmError, InitMethod, InitOptions, ResponseSet, StimulusInput,
};
pub use nonlinearity::Nonlinearity;
pub use optimize::{FitOptions, OptimizationTrace, SelectionPolicy, StopReason};
pub use params::{ParameterSet, WeightType};
pub use registry::{BurnInPolicy, FilterSpec, Split};
pub use splines::SmoothingKind;
