//! Error types for the quantization engine

use thiserror::Error;

use crate::context::Device;

#[derive(Error, Debug)]
pub enum QuantError {
    /// Rejected before any tensor work begins.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Device placement mismatch: expected {expected}, found {found}")]
    DevicePlacementMismatch { expected: Device, found: Device },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unknown model type '{0}'")]
    UnknownModel(String),

    #[error("State dict error: {0}")]
    StateDict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plot error: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, QuantError>;

/// Non-fatal problems with a run configuration. Reported, never raised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Activation quantizers were frozen on default estimates without seeing data.
    ZeroCalibrationSamples,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroCalibrationSamples => write!(
                f,
                "n_sample is 0: activation ranges use default estimates and accuracy will suffer"
            ),
        }
    }
}
