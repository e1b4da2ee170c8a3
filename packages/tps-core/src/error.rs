//! Error types for spline fitting and warping.
//!
//! Contract violations (wrong shapes, too few landmarks, inconsistent
//! coefficient vectors) are reported separately from numerical singularity so
//! callers can decide whether to retry with a non-zero smoothing parameter.

use std::path::PathBuf;

use thiserror::Error;

use crate::spline::CoefficientForm;

/// Main error type for the registration pipeline.
#[derive(Error, Debug)]
pub enum TpsError {
    /// Fewer points than the spline system needs.
    #[error("At least {required} points are required, got {actual}")]
    TooFewPoints { required: usize, actual: usize },

    /// An array does not have the shape an operation expects.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Empty images, empty grids and similar degenerate sizes.
    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The coefficient vector does not match the control point count.
    #[error("{form:?} coefficient vector must have length {expected}, got {actual}")]
    CoefficientLength {
        form: CoefficientForm,
        expected: usize,
        actual: usize,
    },

    /// The TPS linear system is singular or too ill-conditioned to trust.
    #[error("Singular TPS system: {0}")]
    SingularSystem(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Failed to read configuration {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Array layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, TpsError>;

impl TpsError {
    /// Create a shape mismatch error.
    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a singular system error.
    pub fn singular(msg: impl Into<String>) -> Self {
        Self::SingularSystem(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for numerical failures, as opposed to contract violations.
    pub fn is_singular(&self) -> bool {
        matches!(self, Self::SingularSystem(_))
    }
}
