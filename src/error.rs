//! Error types for gradient conflict diagnostics.

use thiserror::Error;

/// Result type alias for analyzer operations.
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Errors that can occur while measuring or logging gradient diagnostics.
///
/// Missing inputs (no sink, absent losses, scopes with a single gradient
/// vector) are not errors; the logging entry points return `Ok(())` for them.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error from a file-backed sink or config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error from a file-backed sink.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be parsed or serialized.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Tracker mirroring was requested but no tracker was supplied.
    #[error("experiment tracker requested but not available: {0}")]
    TrackerUnavailable(String),

    /// The experiment tracker rejected a log call.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// A parameter index outside the enumerated parameter list.
    #[error("parameter index {index} out of range for {count} parameters")]
    ParamIndex {
        /// Requested index.
        index: usize,
        /// Number of enumerated parameters.
        count: usize,
    },
}

impl AnalyzerError {
    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a tracker error
    pub fn tracker(msg: impl Into<String>) -> Self {
        Self::Tracker(msg.into())
    }
}
