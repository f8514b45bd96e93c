//! Text exposition for `GET /metrics`.

use std::fmt;

use prometheus_client::encoding::text::encode;

use crate::MetricsRegistry;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Encode every registered metric, including ones never touched.
pub fn render_metrics(metrics: &MetricsRegistry) -> Result<String, fmt::Error> {
    let mut out = String::with_capacity(4096);
    encode(&mut out, &metrics.registry)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_metrics_are_listed() {
        let text = render_metrics(&MetricsRegistry::new()).unwrap();

        assert!(text.contains("# TYPE camnode_frames_streamed counter"));
        assert!(text.contains("camnode_active_viewers 0"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[test]
    fn labelled_samples_are_rendered() {
        let metrics = MetricsRegistry::new();
        metrics.record_command("capture", false);
        metrics.record_upload("connection_failed", 0.2);

        let text = render_metrics(&metrics).unwrap();

        assert!(text.contains(r#"camnode_commands_total{op="capture",outcome="failed"} 1"#));
        assert!(text.contains(r#"camnode_uploads_total{outcome="connection_failed"} 1"#));
        assert!(text.contains("camnode_upload_duration_seconds_count 1"));
    }
}
