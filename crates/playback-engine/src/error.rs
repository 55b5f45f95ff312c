use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the engine boundary.
///
/// Runtime failures inside the worker loop are logged and converted into a
/// graceful shutdown; only construction-time and probe errors reach callers
/// as values.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No registered decoder provider recognizes the file format.
    #[error("unsupported media format: {path:?}")]
    UnsupportedFormat { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    /// Output device selection or stream construction failed.
    #[error("audio device error: {0}")]
    Device(String),
}

impl EngineError {
    pub fn device(err: impl std::fmt::Display) -> Self {
        Self::Device(err.to_string())
    }

    /// Whether this error is the fail-fast unsupported-format case.
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self, Self::UnsupportedFormat { .. })
    }
}
