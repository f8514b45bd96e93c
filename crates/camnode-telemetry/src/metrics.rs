//! Prometheus metrics registry.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Upload duration buckets (in seconds). Uploads run from tens of
/// milliseconds on a LAN up to the 15s response timeout.
const UPLOAD_BUCKETS: [f64; 9] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0];

/// Command labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub op: String,
    /// `ok` or `failed`.
    pub outcome: String,
}

/// Reason an inbound message was dropped.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    pub reason: String,
}

/// Outbound channel labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChannelLabels {
    pub channel: String,
}

/// Upload outcome labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UploadLabels {
    pub outcome: String,
}

/// Metrics registry holding all camnode metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    // Control plane
    pub commands_total: Family<CommandLabels, Counter>,
    pub commands_dropped_total: Family<DropLabels, Counter>,
    pub messages_published_total: Family<ChannelLabels, Counter>,
    pub publish_failures_total: Family<ChannelLabels, Counter>,

    // Stream
    pub frames_streamed_total: Counter,
    pub stream_bytes_total: Counter,
    pub active_viewers: Gauge,
    pub viewers_total: Counter,
    pub frame_checkout_failures_total: Counter,

    // Capture and upload
    pub uploads_total: Family<UploadLabels, Counter>,
    pub upload_duration_seconds: Histogram,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let commands_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "camnode_commands",
            "Commands that produced a result, by operation and outcome",
            commands_total.clone(),
        );

        let commands_dropped_total = Family::<DropLabels, Counter>::default();
        registry.register(
            "camnode_commands_dropped",
            "Inbound messages dropped without a result",
            commands_dropped_total.clone(),
        );

        let messages_published_total = Family::<ChannelLabels, Counter>::default();
        registry.register(
            "camnode_messages_published",
            "Messages handed to the transport, by channel",
            messages_published_total.clone(),
        );

        let publish_failures_total = Family::<ChannelLabels, Counter>::default();
        registry.register(
            "camnode_publish_failures",
            "Messages that could not be encoded or enqueued, by channel",
            publish_failures_total.clone(),
        );

        let frames_streamed_total = Counter::default();
        registry.register(
            "camnode_frames_streamed",
            "MJPEG frames written to viewers",
            frames_streamed_total.clone(),
        );

        let stream_bytes_total = Counter::default();
        registry.register(
            "camnode_stream_bytes",
            "JPEG payload bytes written to viewers",
            stream_bytes_total.clone(),
        );

        let active_viewers = Gauge::default();
        registry.register(
            "camnode_active_viewers",
            "Viewers currently attached to the stream",
            active_viewers.clone(),
        );

        let viewers_total = Counter::default();
        registry.register(
            "camnode_viewers",
            "Viewers accepted on the stream endpoint",
            viewers_total.clone(),
        );

        let frame_checkout_failures_total = Counter::default();
        registry.register(
            "camnode_frame_checkout_failures",
            "Frame buffer checkouts that failed or timed out",
            frame_checkout_failures_total.clone(),
        );

        let uploads_total = Family::<UploadLabels, Counter>::default();
        registry.register(
            "camnode_uploads",
            "Capture-and-upload attempts by outcome",
            uploads_total.clone(),
        );

        let upload_duration_seconds = Histogram::new(UPLOAD_BUCKETS.iter().cloned());
        registry.register(
            "camnode_upload_duration_seconds",
            "Wall time of capture-and-upload attempts",
            upload_duration_seconds.clone(),
        );

        Self {
            registry,
            commands_total,
            commands_dropped_total,
            messages_published_total,
            publish_failures_total,
            frames_streamed_total,
            stream_bytes_total,
            active_viewers,
            viewers_total,
            frame_checkout_failures_total,
            uploads_total,
            upload_duration_seconds,
        }
    }

    /// Record a command that produced its result.
    pub fn record_command(&self, op: &str, ok: bool) {
        let labels = CommandLabels {
            op: op.to_string(),
            outcome: outcome_label(ok).to_string(),
        };
        self.commands_total.get_or_create(&labels).inc();
    }

    /// Record an inbound message dropped before dispatch.
    pub fn record_dropped(&self, reason: &str) {
        let labels = DropLabels {
            reason: reason.to_string(),
        };
        self.commands_dropped_total.get_or_create(&labels).inc();
    }

    /// Record a publish attempt on a channel.
    pub fn record_publish(&self, channel: &str, ok: bool) {
        let labels = ChannelLabels {
            channel: channel.to_string(),
        };
        if ok {
            self.messages_published_total.get_or_create(&labels).inc();
        } else {
            self.publish_failures_total.get_or_create(&labels).inc();
        }
    }

    /// Record one frame written to a viewer.
    pub fn record_frame(&self, bytes: usize) {
        self.frames_streamed_total.inc();
        self.stream_bytes_total.inc_by(bytes as u64);
    }

    /// Record a failed or timed out frame checkout.
    pub fn record_checkout_failure(&self) {
        self.frame_checkout_failures_total.inc();
    }

    /// Record a finished capture-and-upload attempt.
    pub fn record_upload(&self, outcome: &str, duration_secs: f64) {
        let labels = UploadLabels {
            outcome: outcome.to_string(),
        };
        self.uploads_total.get_or_create(&labels).inc();
        self.upload_duration_seconds.observe(duration_secs);
    }

    /// A viewer attached.
    pub fn viewer_attached(&self) {
        self.active_viewers.inc();
        self.viewers_total.inc();
    }

    /// A viewer detached.
    pub fn viewer_detached(&self) {
        self.active_viewers.dec();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.active_viewers.get(), 0);
        assert_eq!(registry.frames_streamed_total.get(), 0);
    }

    #[test]
    fn test_record_command() {
        let registry = MetricsRegistry::new();
        registry.record_command("led", true);
        registry.record_command("led", true);
        registry.record_command("set_wifi", false);

        let led = CommandLabels {
            op: "led".to_string(),
            outcome: "ok".to_string(),
        };
        let wifi = CommandLabels {
            op: "set_wifi".to_string(),
            outcome: "failed".to_string(),
        };
        assert_eq!(registry.commands_total.get_or_create(&led).get(), 2);
        assert_eq!(registry.commands_total.get_or_create(&wifi).get(), 1);
    }

    #[test]
    fn test_viewer_tracking() {
        let registry = MetricsRegistry::new();

        registry.viewer_attached();
        registry.viewer_attached();
        assert_eq!(registry.active_viewers.get(), 2);
        assert_eq!(registry.viewers_total.get(), 2);

        registry.viewer_detached();
        assert_eq!(registry.active_viewers.get(), 1);
        assert_eq!(registry.viewers_total.get(), 2);
    }

    #[test]
    fn test_record_frame_counts_bytes() {
        let registry = MetricsRegistry::new();
        registry.record_frame(1000);
        registry.record_frame(24);
        assert_eq!(registry.frames_streamed_total.get(), 2);
        assert_eq!(registry.stream_bytes_total.get(), 1024);
    }

    #[test]
    fn test_publish_failures_are_separate() {
        let registry = MetricsRegistry::new();
        registry.record_publish("result", true);
        registry.record_publish("config", false);

        let result = ChannelLabels {
            channel: "result".to_string(),
        };
        let config = ChannelLabels {
            channel: "config".to_string(),
        };
        assert_eq!(
            registry.messages_published_total.get_or_create(&result).get(),
            1
        );
        assert_eq!(
            registry.publish_failures_total.get_or_create(&config).get(),
            1
        );
        assert_eq!(
            registry.publish_failures_total.get_or_create(&result).get(),
            0
        );
    }
}
