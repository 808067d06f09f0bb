//! Error types for the treatment-effect core.
//!
//! Every fallible operation in the crate returns [`EffectResult`]. A duplicate
//! run configuration is deliberately *not* an error; see
//! [`crate::experiment::RunOutcome`].

use std::fmt;
use std::path::PathBuf;

use crate::archive::ArchiveError;
use crate::config::ConfigError;

/// Result type alias for treatment-effect operations
pub type EffectResult<T> = Result<T, EffectError>;

/// Error type shared by statistics, models, scoring, training and the ledger
#[derive(Debug)]
pub enum EffectError {
    /// A batch cannot produce a defined statistic (e.g. a single treatment arm)
    DegenerateBatch { reason: String },

    /// Tensor shapes that cannot be reconciled by whole-tensor repetition
    ShapeMismatch {
        expected: String,
        got: String,
        context: String,
    },

    /// A loss or metric became NaN or infinite
    NumericalDivergence { context: String },

    /// The ledger JSON could not be parsed
    LedgerCorrupt { path: PathBuf, details: String },

    /// A loader produced no batches
    EmptyLoader { context: String },

    /// `backward` was called without a preceding `forward`
    MissingForwardPass { component: String },

    /// The run was cancelled between batches
    Cancelled,

    /// Invalid or unreadable experiment configuration
    Config(ConfigError),

    /// Prediction archive failure
    Archive(ArchiveError),

    Io(std::io::Error),
    Json(serde_json::Error),
    Csv(csv::Error),
}

impl fmt::Display for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectError::DegenerateBatch { reason } => {
                write!(f, "Degenerate batch: {}", reason)
            }
            EffectError::ShapeMismatch {
                expected,
                got,
                context,
            } => {
                write!(
                    f,
                    "Shape mismatch in {}: expected {}, got {}",
                    context, expected, got
                )
            }
            EffectError::NumericalDivergence { context } => {
                write!(f, "Numerical divergence: non-finite value in {}", context)
            }
            EffectError::LedgerCorrupt { path, details } => {
                write!(
                    f,
                    "Ledger at {} is corrupt: {}. Run Ledger::repair to recover it.",
                    path.display(),
                    details
                )
            }
            EffectError::EmptyLoader { context } => {
                write!(f, "Loader for {} yielded no batches", context)
            }
            EffectError::MissingForwardPass { component } => {
                write!(
                    f,
                    "backward called on {} before forward; no activations cached",
                    component
                )
            }
            EffectError::Cancelled => write!(f, "Run cancelled"),
            EffectError::Config(err) => write!(f, "Configuration error: {}", err),
            EffectError::Archive(err) => write!(f, "Archive error: {}", err),
            EffectError::Io(err) => write!(f, "IO error: {}", err),
            EffectError::Json(err) => write!(f, "JSON error: {}", err),
            EffectError::Csv(err) => write!(f, "CSV error: {}", err),
        }
    }
}

impl std::error::Error for EffectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EffectError::Config(err) => Some(err),
            EffectError::Archive(err) => Some(err),
            EffectError::Io(err) => Some(err),
            EffectError::Json(err) => Some(err),
            EffectError::Csv(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EffectError {
    fn from(err: std::io::Error) -> Self {
        EffectError::Io(err)
    }
}

impl From<serde_json::Error> for EffectError {
    fn from(err: serde_json::Error) -> Self {
        EffectError::Json(err)
    }
}

impl From<csv::Error> for EffectError {
    fn from(err: csv::Error) -> Self {
        EffectError::Csv(err)
    }
}

impl From<ConfigError> for EffectError {
    fn from(err: ConfigError) -> Self {
        EffectError::Config(err)
    }
}

impl From<ArchiveError> for EffectError {
    fn from(err: ArchiveError) -> Self {
        EffectError::Archive(err)
    }
}

impl EffectError {
    pub fn degenerate(reason: impl Into<String>) -> Self {
        EffectError::DegenerateBatch {
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(
        expected: impl fmt::Debug,
        got: impl fmt::Debug,
        context: impl Into<String>,
    ) -> Self {
        EffectError::ShapeMismatch {
            expected: format!("{:?}", expected),
            got: format!("{:?}", got),
            context: context.into(),
        }
    }

    pub fn divergence(context: impl Into<String>) -> Self {
        EffectError::NumericalDivergence {
            context: context.into(),
        }
    }

    pub fn missing_forward(component: impl Into<String>) -> Self {
        EffectError::MissingForwardPass {
            component: component.into(),
        }
    }
}

/// Fails with [`EffectError::NumericalDivergence`] when `value` is NaN or infinite.
pub fn ensure_finite(value: f64, context: &str) -> EffectResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EffectError::divergence(format!("{} ({})", context, value)))
    }
}
