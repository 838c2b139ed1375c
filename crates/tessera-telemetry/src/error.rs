//! Telemetry errors.

use thiserror::Error;

/// Failure to configure or install logging.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A level, directive, or format did not parse.
    #[error("invalid log configuration: {0}")]
    Config(String),

    /// The subscriber or file appender could not be installed.
    #[error("failed to initialize logging: {0}")]
    Init(String),

    /// Filesystem error preparing log output.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
