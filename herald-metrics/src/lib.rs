//! OpenTelemetry metrics for herald
//!
//! Queue instruments are pushed over OTLP/HTTP to a collector when enabled.
//! Recording is a no-op until [`init_metrics`] has installed a provider.
//!
//! ```text
//! herald → OTLP/HTTP → OpenTelemetry Collector → Prometheus
//! ```

mod config;
mod error;
mod exporter;
mod queue;

pub use config::MetricsConfig;
pub use error::MetricsError;
use once_cell::sync::OnceCell;
pub use queue::QueueMetrics;

static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub queue: QueueMetrics,
}

/// Initialize the metrics system
///
/// A disabled config leaves metrics uninitialised.
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

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    opentelemetry::global::set_meter_provider(provider);

    METRICS_INSTANCE
        .set(Metrics {
            queue: QueueMetrics::new()?,
        })
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if metrics are enabled
#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}
