//! Structured logging.
//!
//! JSON lines to stdout by default, pretty output for bench sessions.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::{LogFormat, TelemetryConfig, TelemetryError};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::LoggingInit(format!("bad log level: {e}")))?;

    tracing_subscriber::registry()
        .with(format_layer(config.log_format))
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

fn format_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    }
}

/// Standard log event names.
pub mod events {
    /// Node is starting up.
    pub const STARTUP: &str = "startup";

    /// Node is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// Stream server is listening.
    pub const LISTENING: &str = "listening";

    /// Command link (MQTT session) came up.
    pub const LINK_CONNECTED: &str = "link_connected";

    /// A command produced its result.
    pub const COMMAND_HANDLED: &str = "command_handled";

    /// An inbound message was dropped without a result.
    pub const COMMAND_DROPPED: &str = "command_dropped";

    /// A viewer attached to the MJPEG stream.
    pub const STREAM_STARTED: &str = "stream_started";

    /// A viewer's MJPEG stream ended.
    pub const STREAM_STOPPED: &str = "stream_stopped";

    /// A capture-and-upload attempt finished.
    pub const UPLOAD_COMPLETED: &str = "upload_completed";

    /// A config change asked for a restart.
    pub const RESTART_REQUESTED: &str = "restart_requested";

    /// An outbound message could not be published.
    pub const PUBLISH_FAILED: &str = "publish_failed";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros so every event carries its `event` name.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_link_connected {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LINK_CONNECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_command_handled {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::COMMAND_HANDLED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_command_dropped {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::COMMAND_DROPPED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_stream_started {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STREAM_STARTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_stream_stopped {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STREAM_STOPPED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_upload_completed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::UPLOAD_COMPLETED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_restart_requested {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::RESTART_REQUESTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_publish_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::PUBLISH_FAILED,
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_snake_case() {
        for name in [
            events::STARTUP,
            events::LINK_CONNECTED,
            events::COMMAND_DROPPED,
            events::STREAM_STOPPED,
            events::RESTART_REQUESTED,
        ] {
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
