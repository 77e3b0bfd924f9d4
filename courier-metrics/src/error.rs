//! Error types for metrics operations

use thiserror::Error;

/// Errors raised while setting up the OpenTelemetry pipeline
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metrics system has already been initialized
    #[error("Metrics system already initialized")]
    AlreadyInitialized,

    /// OpenTelemetry SDK error
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),
}

/// Errors raised by a [`Telemetry`](crate::Telemetry) sink.
///
/// Callers on the delivery path log these and carry on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    /// The sink cannot accept records right now
    #[error("Telemetry sink unavailable: {0}")]
    Unavailable(String),

    /// A metrics query asked for a range that ends before it starts
    #[error("Invalid time range: start is after end")]
    InvalidRange,

    /// A metric name was empty or malformed
    #[error("Invalid metric name '{0}'")]
    InvalidName(String),
}
