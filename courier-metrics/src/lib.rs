//! OpenTelemetry metrics and delivery telemetry for courier.
//!
//! Two layers live here:
//!
//! - [`NotificationMetrics`]: OpenTelemetry instruments pushed over OTLP to a
//!   collector, initialised once per process with [`init_metrics`].
//! - [`Telemetry`]: the interface the delivery engine reports through, with
//!   [`InMemoryTelemetry`] keeping a bounded history that can be queried by
//!   time range and forwarding to the OpenTelemetry instruments when enabled.
//!
//! ```text
//! courier → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use courier_metrics::{MetricsConfig, init_metrics};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! init_metrics(&config)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod exporter;
mod notification;
mod telemetry;

pub use config::MetricsConfig;
pub use error::{MetricsError, TelemetryError};
pub use notification::NotificationMetrics;
use once_cell::sync::OnceCell;
pub use telemetry::{ChannelMetrics, InMemoryTelemetry, MessageMetrics, Tags, Telemetry};

static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub notification: NotificationMetrics,
}

/// Initialize the metrics system.
///
/// If metrics are disabled in the config, this is a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(config.endpoint.clone())?;
    opentelemetry::global::set_meter_provider(provider);

    let metrics = Metrics {
        notification: NotificationMetrics::new()?,
    };

    METRICS_INSTANCE
        .set(metrics)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if [`init_metrics`] has enabled it.
#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
