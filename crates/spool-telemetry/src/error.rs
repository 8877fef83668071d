//! Telemetry failures: subscriber installation and the metrics registry.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::string::FromUtf8Error;

use prometheus::Error as PrometheusError;
use tracing_subscriber::util::TryInitError;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Stage at which a metrics collector failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorStep {
    /// Constructing the collector from its options.
    Build,
    /// Adding the collector to the spool registry.
    Register,
}

impl CollectorStep {
    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Register => "register",
        }
    }
}

/// Errors raised by telemetry helpers.
#[derive(Debug)]
pub enum TelemetryError {
    /// A global subscriber already exists or could not be installed.
    LoggingInstall {
        /// Underlying tracing subscriber error.
        source: TryInitError,
    },
    /// One of the spool collectors could not be set up.
    Collector {
        /// Metric name.
        name: &'static str,
        /// Whether building or registering failed.
        step: CollectorStep,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// The text exposition could not be produced.
    Exposition {
        /// Encoder or UTF-8 failure.
        source: ExpositionFailure,
    },
}

/// Cause of a failed text exposition.
#[derive(Debug)]
pub enum ExpositionFailure {
    /// The Prometheus text encoder failed.
    Encode(PrometheusError),
    /// The encoder produced bytes that are not UTF-8.
    Utf8(FromUtf8Error),
}

impl Display for ExpositionFailure {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => Display::fmt(err, formatter),
            Self::Utf8(err) => Display::fmt(err, formatter),
        }
    }
}

impl Error for ExpositionFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Encode(err) => Some(err),
            Self::Utf8(err) => Some(err),
        }
    }
}

impl Display for TelemetryError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggingInstall { .. } => formatter.write_str("logging already installed"),
            Self::Collector {
                step: CollectorStep::Build,
                ..
            } => formatter.write_str("metrics collector rejected its options"),
            Self::Collector {
                step: CollectorStep::Register,
                ..
            } => formatter.write_str("metrics collector could not be registered"),
            Self::Exposition { .. } => formatter.write_str("metrics exposition failed"),
        }
    }
}

impl Error for TelemetryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::LoggingInstall { source } => Some(source),
            Self::Collector { source, .. } => Some(source),
            Self::Exposition { source } => Some(source),
        }
    }
}
