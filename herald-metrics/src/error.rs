//! Error types for metrics operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metrics system already initialized")]
    AlreadyInitialized,

    /// OpenTelemetry SDK or exporter error
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),
}
