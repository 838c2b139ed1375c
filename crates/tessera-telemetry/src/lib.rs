//! Tessera Telemetry - subscriber setup for Tessera.
//!
//! The storage crate only emits `tracing` events. This crate installs the
//! subscriber that renders them: a level filter with per-target directives,
//! a choice of formats, and stdout, stderr, or rolling file output.
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), tessera_telemetry::TelemetryError> {
//! let config = LogConfig::new("warn")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("tessera_storage=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
