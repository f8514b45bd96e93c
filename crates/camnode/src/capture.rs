//! Capture-and-upload pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use camnode_telemetry::{log_upload_completed, MetricsRegistry};

use crate::camera::{CameraError, FrameBuffer, FrameSize, FrameSource, PixelFormat, ResolutionGuard};
use crate::upload::{UploadTarget, Uploader};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_CHECKOUT_WAIT: Duration = Duration::from_secs(5);
const CAPTURE_JPEG_QUALITY: u8 = 90;

/// Pipeline tuning.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Resolution stills are taken at.
    pub capture_size: FrameSize,
    /// Pause after a resolution switch before grabbing.
    pub settle_delay: Duration,
    /// Longest wait for the frame buffer.
    pub checkout_wait: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            capture_size: FrameSize::UXGA,
            settle_delay: DEFAULT_SETTLE_DELAY,
            checkout_wait: DEFAULT_CHECKOUT_WAIT,
        }
    }
}

/// Outcome of one capture, reported as a command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub ok: bool,
    pub info: String,
}

impl CaptureReport {
    fn success() -> Self {
        Self {
            ok: true,
            info: "upload succeeded".to_string(),
        }
    }

    fn failure(info: impl Into<String>) -> Self {
        Self {
            ok: false,
            info: info.into(),
        }
    }
}

pub struct CapturePipeline {
    frames: FrameSource,
    uploader: Uploader,
    settings: CaptureSettings,
    metrics: Arc<MetricsRegistry>,
}

impl CapturePipeline {
    pub fn new(
        frames: FrameSource,
        uploader: Uploader,
        settings: CaptureSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            frames,
            uploader,
            settings,
            metrics,
        }
    }

    /// Take one still at capture resolution and upload it as
    /// `{client_id}_{id}.jpg`. Single attempt.
    ///
    /// The sensor resolution is restored and the frame buffer released on
    /// every path, in that order.
    pub async fn capture_and_upload(&self, id: i64, client_id: &str, url: &str) -> CaptureReport {
        let started = Instant::now();

        let guard = match ResolutionGuard::switch(self.frames.camera(), self.settings.capture_size) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to switch to capture resolution");
                return self.finish(id, started, "capture_failed", CaptureReport::failure("capture failed"));
            }
        };
        if guard.changed() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let frame = match self.frames.checkout_within(self.settings.checkout_wait).await {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.record_checkout_failure();
                tracing::warn!(error = %e, "Capture failed");
                restore(guard);
                return self.finish(id, started, "capture_failed", CaptureReport::failure("capture failed"));
            }
        };

        let jpeg = match self.jpeg_of(&frame) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "Capture could not be encoded");
                restore(guard);
                frame.release();
                return self.finish(id, started, "capture_failed", CaptureReport::failure("capture failed"));
            }
        };

        let file_name = format!("{client_id}_{id}.jpg");
        let size = jpeg.len();
        let uploaded = match UploadTarget::parse(url) {
            Ok(target) => self.uploader.upload(&target, &file_name, jpeg).await,
            Err(e) => Err(e),
        };

        restore(guard);
        frame.release();

        let (outcome, report) = match uploaded {
            Ok(_) => ("success", CaptureReport::success()),
            Err(e) => {
                tracing::warn!(error = %e, detail = ?e, url = %url, "Upload failed");
                (e.outcome(), CaptureReport::failure(e.to_string()))
            }
        };
        tracing::debug!(file_name = %file_name, size, "Capture handled");
        self.finish(id, started, outcome, report)
    }

    fn jpeg_of(&self, frame: &FrameBuffer) -> Result<Bytes, CameraError> {
        match frame.format() {
            PixelFormat::Jpeg => Ok(frame.data().clone()),
            _ => self
                .frames
                .camera()
                .encode_jpeg(frame.raw(), CAPTURE_JPEG_QUALITY),
        }
    }

    fn finish(&self, id: i64, started: Instant, outcome: &str, report: CaptureReport) -> CaptureReport {
        let elapsed = started.elapsed();
        self.metrics.record_upload(outcome, elapsed.as_secs_f64());
        log_upload_completed!(
            id,
            ok = report.ok,
            outcome = %outcome,
            duration_ms = elapsed.as_millis() as u64,
            "Capture finished"
        );
        report
    }
}

fn restore(guard: ResolutionGuard) {
    if let Err(e) = guard.restore() {
        tracing::warn!(error = %e, "Failed to restore resolution");
    }
}
