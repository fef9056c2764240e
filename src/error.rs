//! Error types of the analysis engine.

use crate::session::SessionState;
use thiserror::Error;

/// Errors raised while validating or applying a recalibration.
///
/// A recalibration that fails any of these checks leaves the existing calibration untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("'{input}' is not a valid number for the {field}")]
    NotANumber { field: &'static str, input: String },
    #[error("calibration channels must satisfy first < second (got {first} and {second})")]
    DegenerateChannelSpan { first: usize, second: usize },
    #[error("calibration energies must satisfy first < second (got {first} and {second})")]
    DegenerateEnergySpan { first: f64, second: f64 },
    #[error("calibration channel {channel} is outside the spectrum (0..{channel_count})")]
    ChannelOutOfRange { channel: usize, channel_count: usize },
    #[error("channel width must be a positive number (got {0})")]
    NonPositiveWidth(f64),
    #[error("calibration values must be finite")]
    NotFinite,
}

/// Errors raised by the fitting, integration and PCA operators.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{name} window [{start}, {end}) is invalid for {channel_count} channels")]
    InvalidWindow {
        name: &'static str,
        start: usize,
        end: usize,
        channel_count: usize,
    },
    #[error("LCPL percentiles must satisfy 0 <= low <= high <= 100 (got {low} and {high})")]
    InvalidPercentiles { low: f64, high: f64 },
    #[error("oversampling FWHM must be a finite, non-negative number of pixels (got {0})")]
    InvalidOversampling(f64),
    #[error("scree constant must be positive, got {0}")]
    InvalidScreeConstant(f64),
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
    #[error("the PCA window contains no data")]
    EmptyPcaWindow,
    #[error("singular value decomposition did not converge")]
    SvdNotConverged,
    #[error("cannot reconstruct with {requested} components, only {available} are available")]
    InvalidComponentCount { requested: usize, available: usize },
    #[error("operation '{operation}' is not possible in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("no operator registered for {0}")]
    UnknownOperator(String),
    #[error("calculation cancelled")]
    Cancelled,
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Errors raised while reading or writing `.npy`/`.npz` arrays.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: ndarray_npy::ReadNpyError,
    },
    #[error("failed to read {path}: {source}")]
    ReadArchive {
        path: String,
        source: ndarray_npy::ReadNpzError,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: ndarray_npy::WriteNpyError,
    },
    #[error("{path} holds a {ndim}-dimensional array, expected 1, 2 or 3 dimensions")]
    UnsupportedRank { path: String, ndim: usize },
    #[error("unsupported file type: {0}")]
    UnsupportedFile(String),
}
