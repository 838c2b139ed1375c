//! Subscriber configuration and installation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{TelemetryError, TelemetryResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// One file per day.
    #[default]
    Daily,
    /// One file per hour.
    Hourly,
    /// One file per minute.
    Minutely,
    /// A single file.
    Never,
}

impl From<FileRotation> for Rotation {
    fn from(rotation: FileRotation) -> Self {
        match rotation {
            FileRotation::Daily => Rotation::DAILY,
            FileRotation::Hourly => Rotation::HOURLY,
            FileRotation::Minutely => Rotation::MINUTELY,
            FileRotation::Never => Rotation::NEVER,
        }
    }
}

/// Event formatting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-oriented.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
    /// The default `tracing-subscriber` format.
    Full,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
            Self::Full => "full",
        })
    }
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "full" => Ok(Self::Full),
            other => Err(TelemetryError::Config(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

/// Where events are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
    /// Rolling files, see [`FileLogConfig`].
    File,
}

/// Rolling file output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLogConfig {
    /// Directory holding the log files. Created if missing.
    pub directory: PathBuf,
    /// File name prefix, e.g. `tessera` gives `tessera.2026-01-15.log`.
    #[serde(default = "default_file_prefix")]
    pub prefix: String,
    /// Rollover schedule.
    #[serde(default)]
    pub rotation: FileRotation,
    /// Number of rolled files to keep; 0 keeps all of them.
    #[serde(default)]
    pub max_files: usize,
}

fn default_file_prefix() -> String {
    "tessera".to_owned()
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            prefix: default_file_prefix(),
            rotation: FileRotation::default(),
            max_files: 0,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base filter, e.g. `info` or `warn,tessera_storage=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Event format.
    #[serde(default)]
    pub format: LogFormat,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// Extra filter directives layered over `level`.
    #[serde(default)]
    pub directives: Vec<String>,
    /// Colored output. Ignored for JSON and file output.
    #[serde(default = "default_true")]
    pub ansi: bool,
    /// Prefix events with a timestamp.
    #[serde(default = "default_true")]
    pub timestamps: bool,
    /// Emit events when spans open and close.
    #[serde(default)]
    pub span_events: bool,
    /// File settings, used when `target` is [`LogTarget::File`].
    #[serde(default)]
    pub file: FileLogConfig,
}

fn default_level() -> String {
    "info".to_owned()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            directives: Vec::new(),
            ansi: true,
            timestamps: true,
            span_events: false,
            file: FileLogConfig::default(),
        }
    }
}

impl LogConfig {
    /// Config with the given base level and defaults elsewhere.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// Set the event format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the output target.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Write to rolling files in `directory`. Turns colors off.
    #[must_use]
    pub fn with_file(
        mut self,
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        rotation: FileRotation,
    ) -> Self {
        self.target = LogTarget::File;
        self.file.directory = directory.into();
        self.file.prefix = prefix.into();
        self.file.rotation = rotation;
        self.ansi = false;
        self
    }

    /// Add a filter directive such as `tessera_storage=trace`.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Drop timestamps.
    #[must_use]
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// Drop colors.
    #[must_use]
    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    /// Log span open and close events.
    #[must_use]
    pub fn with_span_events(mut self) -> Self {
        self.span_events = true;
        self
    }

    /// Apply `TESSERA_LOG` (base level) and `TESSERA_LOG_FORMAT` from `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Config`] for an unknown format.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> TelemetryResult<()> {
        if let Some(level) = vars.get("TESSERA_LOG") {
            self.level.clone_from(level);
        }
        if let Some(format) = vars.get("TESSERA_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        Ok(())
    }

    /// Build the event filter from `level` and `directives`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Config`] if any part fails to parse.
    pub fn env_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::Config(format!("level '{}': {e}", self.level)))?;
        for directive in &self.directives {
            let parsed = directive.parse().map_err(|e| {
                TelemetryError::Config(format!("directive '{directive}': {e}"))
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn make_writer(&self) -> TelemetryResult<BoxMakeWriter> {
        match self.target {
            LogTarget::Stdout => Ok(BoxMakeWriter::new(std::io::stdout)),
            LogTarget::Stderr => Ok(BoxMakeWriter::new(std::io::stderr)),
            LogTarget::File => {
                let file = &self.file;
                std::fs::create_dir_all(&file.directory)?;
                let mut builder = RollingFileAppender::builder()
                    .rotation(file.rotation.into())
                    .filename_prefix(&file.prefix)
                    .filename_suffix("log");
                if file.max_files > 0 {
                    builder = builder.max_log_files(file.max_files);
                }
                let appender = builder
                    .build(&file.directory)
                    .map_err(|e| TelemetryError::Init(e.to_string()))?;
                Ok(BoxMakeWriter::new(appender))
            },
        }
    }

    fn fmt_layer(&self, writer: BoxMakeWriter) -> BoxedLayer {
        let ansi = self.ansi && self.target != LogTarget::File;
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_span_events(self.span_events());

        match (self.format, self.timestamps) {
            (LogFormat::Pretty, true) => layer.pretty().boxed(),
            (LogFormat::Pretty, false) => layer.pretty().without_time().boxed(),
            (LogFormat::Compact, true) => layer.compact().boxed(),
            (LogFormat::Compact, false) => layer.compact().without_time().boxed(),
            (LogFormat::Json, true) => layer.json().with_ansi(false).boxed(),
            (LogFormat::Json, false) => layer.json().with_ansi(false).without_time().boxed(),
            (LogFormat::Full, true) => layer.boxed(),
            (LogFormat::Full, false) => layer.without_time().boxed(),
        }
    }
}

/// Install a global subscriber built from `config`.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.env_filter()?;
    let writer = config.make_writer()?;
    tracing_subscriber::registry()
        .with(config.fmt_layer(writer).with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}

/// Install the default subscriber: `info`, pretty, stderr.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}
