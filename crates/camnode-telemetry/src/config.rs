//! Telemetry configuration.

use std::str::FromStr;

use crate::TelemetryError;

/// How log lines are rendered on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One flattened JSON object per line.
    #[default]
    Json,
    /// Multi-line output with source locations.
    Pretty,
    /// Single-line text, close to a serial console.
    Compact,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(TelemetryError::UnknownLogFormat(s.to_string())),
        }
    }
}

/// Logging settings for one node process.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Name reported in the startup event.
    pub node: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            node: "camnode".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(TelemetryError::UnknownLogFormat(f)) if f == "xml"
        ));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = TelemetryConfig::new()
            .with_node("yard-cam")
            .with_log_level("debug")
            .with_log_format(LogFormat::Compact);

        assert_eq!(config.node, "yard-cam");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(TelemetryConfig::default().node, "camnode");
    }
}
