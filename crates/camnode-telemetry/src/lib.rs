//! Logging and metrics for the camnode device control plane.
//!
//! ```ignore
//! let telemetry = Telemetry::init(TelemetryConfig::new().with_log_level("debug"))?;
//! let metrics = telemetry.metrics();
//! log_startup!(node = %telemetry.config().node, "camnode starting");
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;
pub use metrics::MetricsRegistry;
pub use prometheus::PROMETHEUS_CONTENT_TYPE;

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install log subscriber: {0}")]
    LoggingInit(String),

    #[error("unknown log format: {0} (expected json, pretty or compact)")]
    UnknownLogFormat(String),
}

/// Process-wide telemetry: the installed subscriber and the metrics
/// registry shared by every component.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::detached(config))
    }

    /// Metrics only; leaves the global subscriber alone.
    pub fn detached(config: TelemetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_shares_one_registry() {
        let telemetry = Telemetry::detached(TelemetryConfig::default());
        telemetry.metrics().viewer_attached();

        let rendered = prometheus::render_metrics(&telemetry.metrics()).unwrap();
        assert!(rendered.contains("camnode_active_viewers 1"));
        assert_eq!(telemetry.config().node, "camnode");
    }
}
