//! Time-lagged design matrices.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, s};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Lag length must be at least 1, but was {0}.")]
    InvalidLagLength(usize),

    #[error("Raw input is empty: it has {rows} rows and {cols} columns.")]
    EmptyInput { rows: usize, cols: usize },
}

/// Raw stimulus or response input for a filter: a 1-D signal or a 2-D matrix of
/// frames with shape `[n_samples, n_pixels]`.
#[derive(Debug, Clone, Copy)]
pub enum RawInput<'a> {
    Signal(ArrayView1<'a, f64>),
    Frames(ArrayView2<'a, f64>),
}

impl<'a> RawInput<'a> {
    /// Views the input as a frame matrix; a signal becomes a single column.
    pub fn as_frames(&self) -> ArrayView2<'a, f64> {
        match *self {
            RawInput::Signal(signal) => signal.insert_axis(Axis(1)),
            RawInput::Frames(frames) => frames,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.as_frames().nrows()
    }
}

impl<'a> From<ArrayView1<'a, f64>> for RawInput<'a> {
    fn from(signal: ArrayView1<'a, f64>) -> Self {
        RawInput::Signal(signal)
    }
}

impl<'a> From<ArrayView2<'a, f64>> for RawInput<'a> {
    fn from(frames: ArrayView2<'a, f64>) -> Self {
        RawInput::Frames(frames)
    }
}

impl<'a> From<&'a ndarray::Array1<f64>> for RawInput<'a> {
    fn from(signal: &'a ndarray::Array1<f64>) -> Self {
        RawInput::Signal(signal.view())
    }
}

impl<'a> From<&'a Array2<f64>> for RawInput<'a> {
    fn from(frames: &'a Array2<f64>) -> Self {
        RawInput::Frames(frames.view())
    }
}

/// Builds a time-lagged design matrix.
///
/// Row `t` stacks the `lag_length` frames ending at `t - shift`, oldest first, so
/// that the columns follow the row-major layout of a `(lag_length, n_pixels)`
/// filter. Frames that fall outside the recording are zero. A positive `shift`
/// delays the window into the past; a negative `shift` advances it into the
/// future.
///
/// # Returns
/// A matrix of shape `[n_samples, lag_length * n_pixels]`.
pub fn build_design_matrix(
    raw: ArrayView2<f64>,
    lag_length: usize,
    shift: isize,
) -> Result<Array2<f64>, DesignError> {
    if lag_length == 0 {
        return Err(DesignError::InvalidLagLength(lag_length));
    }
    let (n_samples, n_pixels) = raw.dim();
    if n_samples == 0 || n_pixels == 0 {
        return Err(DesignError::EmptyInput {
            rows: n_samples,
            cols: n_pixels,
        });
    }

    let mut design = Array2::zeros((n_samples, lag_length * n_pixels));
    let n = n_samples as isize;
    let lag = lag_length as isize;

    for t in 0..n {
        for j in 0..lag {
            let source = t - shift - (lag - 1) + j;
            if source < 0 || source >= n {
                continue;
            }
            let start = (j as usize) * n_pixels;
            design
                .slice_mut(s![t as usize, start..start + n_pixels])
                .assign(&raw.row(source as usize));
        }
    }

    Ok(design)
}
