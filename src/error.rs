//! Error types for shadow computation and aggregation.

use thiserror::Error;

/// Why a shading strategy could not produce a mask.
///
/// Returned by [`crate::shadowing::ShadingStrategy::shade`]. The controller
/// recovers from these by falling back to ray tracing; only a failure of the
/// fallback itself becomes a [`ShadeError::Compute`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyFailure {
    #[error("strategy unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Main error type for windshade operations
#[derive(Error, Debug)]
pub enum ShadeError {
    #[error("invalid directive '{label}': {reason}")]
    InvalidDirective { label: String, reason: String },

    /// `row` is the 1-based line of a delimited table or the 1-based element
    /// of a JSON table; 0 refers to the table as a whole.
    #[error("directive table row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },

    #[error("invalid raster: {0}")]
    InvalidRaster(String),

    #[error("grid geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shadow computation failed for '{label}': {reason}")]
    Compute { label: String, reason: String },

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("batch cancelled after {completed} of {total} directives")]
    Cancelled { completed: usize, total: usize },

    #[error("no shadow masks were produced ({failed} directives failed)")]
    NothingComputed { failed: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`ShadeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Compute,
    Aggregation,
    Cancelled,
}

impl ShadeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShadeError::InvalidDirective { .. }
            | ShadeError::MalformedRow { .. }
            | ShadeError::InvalidRaster(_)
            | ShadeError::GeometryMismatch(_)
            | ShadeError::InvalidConfig(_)
            | ShadeError::Json(_) => ErrorKind::Input,
            ShadeError::Compute { .. } | ShadeError::NothingComputed { .. } => {
                ErrorKind::Compute
            }
            ShadeError::Aggregation(_) => ErrorKind::Aggregation,
            ShadeError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

#[cfg(feature = "python")]
impl From<ShadeError> for pyo3::PyErr {
    fn from(err: ShadeError) -> Self {
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::Input => pyo3::exceptions::PyValueError::new_err(msg),
            ErrorKind::Compute | ErrorKind::Aggregation => {
                pyo3::exceptions::PyRuntimeError::new_err(msg)
            }
            ErrorKind::Cancelled => pyo3::exceptions::PyInterruptedError::new_err(msg),
        }
    }
}

/// Result type alias for windshade operations
pub type Result<T> = std::result::Result<T, ShadeError>;
