//! MJPEG stream server.
//!
//! `GET /stream` answers with a `multipart/x-mixed-replace` body that never
//! ends on its own: one worker per viewer checks out frames and pushes each
//! as boundary, part header and JPEG payload. The same listener serves
//! `/health` and `/metrics`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use camnode_telemetry::{
    log_listening, log_stream_started, log_stream_stopped, MetricsRegistry, PROMETHEUS_CONTENT_TYPE,
};
use futures_util::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::camera::{CameraError, FrameBuffer, FrameSource, PixelFormat};

/// Multipart boundary token.
pub const BOUNDARY: &str = "123456789000000000000987654321";

/// Advertised frame rate.
const FRAMERATE: &str = "30";

/// JPEG quality for non-JPEG sensor output.
const TRANSCODE_QUALITY: u8 = 80;

/// Frames between two stats lines.
const STATS_EVERY: u64 = 100;

/// Chunks queued between a worker and its connection. With one slot a
/// chunk is only queued once the connection took the previous one.
const CHUNK_BACKLOG: usize = 1;

pub const DEFAULT_MAX_VIEWERS: usize = 1;

pub type ResponseBody = UnsyncBoxBody<Bytes, StreamError>;

/// Why a stream body failed.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("camera capture failed: {0}")]
    Capture(#[source] CameraError),

    #[error("JPEG transcode failed: {0}")]
    Transcode(#[source] CameraError),
}

/// How a stream worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ViewerGone,
    CaptureFailed,
    TranscodeFailed,
}

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

fn delimiter() -> Bytes {
    Bytes::from(format!("\r\n--{BOUNDARY}\r\n"))
}

/// Part header for one JPEG frame, timestamp as `seconds.micros`.
pub fn part_header(len: usize, timestamp: Duration) -> Bytes {
    Bytes::from(format!(
        "Content-Type: image/jpeg\r\nContent-Length: {len}\r\nX-Timestamp: {}.{:06}\r\n\r\n",
        timestamp.as_secs(),
        timestamp.subsec_micros()
    ))
}

/// The JPEG being sent and what must be returned afterwards.
enum Payload {
    /// The sensor delivered JPEG; the buffer is held until sent.
    Native(FrameBuffer),
    /// Transcoded copy; the sensor buffer was already returned.
    Transcoded { jpeg: Bytes, timestamp: Duration },
}

impl Payload {
    fn jpeg(&self) -> &Bytes {
        match self {
            Payload::Native(frame) => frame.data(),
            Payload::Transcoded { jpeg, .. } => jpeg,
        }
    }

    fn timestamp(&self) -> Duration {
        match self {
            Payload::Native(frame) => frame.timestamp(),
            Payload::Transcoded { timestamp, .. } => *timestamp,
        }
    }

    fn release(self) {
        if let Payload::Native(frame) = self {
            frame.release();
        }
    }
}

/// Advisory frame-rate accounting.
struct FrameStats {
    frames: u64,
    last: Option<Instant>,
}

impl FrameStats {
    fn new() -> Self {
        Self {
            frames: 0,
            last: None,
        }
    }

    fn record(&mut self, size: usize) {
        let now = Instant::now();
        let frame_time = self.last.map(|last| now.duration_since(last));
        self.last = Some(now);
        self.frames += 1;

        if self.frames % STATS_EVERY == 0 {
            let frame_ms = frame_time.map_or(0, |t| t.as_millis() as u64);
            let fps = frame_time
                .filter(|t| !t.is_zero())
                .map_or(0.0, |t| 1.0 / t.as_secs_f64());
            tracing::info!(
                frames = self.frames,
                size_kb = size / 1024,
                frame_ms,
                fps = format!("{fps:.1}"),
                "MJPG stats"
            );
        }
    }
}

/// Push frames into `tx` until the viewer goes away or the camera fails.
///
/// Each frame goes out as three chunks. Exactly one buffer is held at a
/// time and it is released before the next checkout. A chunk counts as
/// written once the connection has taken it off the queue, so the buffer is
/// held until the last chunk of its frame was taken; with a one-slot `tx`
/// a viewer gone mid-frame aborts that frame.
pub async fn pump_frames(
    frames: FrameSource,
    tx: mpsc::Sender<Result<Bytes, StreamError>>,
    metrics: Arc<MetricsRegistry>,
) -> StreamEnd {
    let mut stats = FrameStats::new();

    loop {
        let frame = match frames.checkout().await {
            Ok(frame) => frame,
            Err(e) => {
                metrics.record_checkout_failure();
                tracing::warn!(error = %e, "Camera capture failed");
                let _ = tx.send(Err(StreamError::Capture(e))).await;
                return StreamEnd::CaptureFailed;
            }
        };

        let payload = if frame.format() == PixelFormat::Jpeg {
            Payload::Native(frame)
        } else {
            let encoded = frames.camera().encode_jpeg(frame.raw(), TRANSCODE_QUALITY);
            let timestamp = frame.timestamp();
            frame.release();
            match encoded {
                Ok(jpeg) => Payload::Transcoded { jpeg, timestamp },
                Err(e) => {
                    tracing::warn!(error = %e, "JPEG compression failed");
                    let _ = tx.send(Err(StreamError::Transcode(e))).await;
                    return StreamEnd::TranscodeFailed;
                }
            }
        };

        let jpeg = payload.jpeg().clone();
        let len = jpeg.len();
        let chunks = [delimiter(), part_header(len, payload.timestamp()), jpeg];

        for chunk in chunks {
            if tx.send(Ok(chunk)).await.is_err() {
                payload.release();
                return StreamEnd::ViewerGone;
            }
        }
        if tx.reserve().await.is_err() {
            payload.release();
            return StreamEnd::ViewerGone;
        }

        payload.release();
        metrics.record_frame(len);
        stats.record(len);
    }
}

/// HTTP front of the frame source.
pub struct StreamServer {
    frames: FrameSource,
    viewers: Arc<Semaphore>,
    max_viewers: usize,
    metrics: Arc<MetricsRegistry>,
}

impl StreamServer {
    pub fn new(frames: FrameSource, max_viewers: usize, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        let max_viewers = max_viewers.max(1);
        Arc::new(Self {
            frames,
            viewers: Arc::new(Semaphore::new(max_viewers)),
            max_viewers,
            metrics,
        })
    }

    /// Viewers currently attached.
    pub fn active_viewers(&self) -> usize {
        self.max_viewers - self.viewers.available_permits()
    }

    /// Route one request.
    pub async fn handle<B>(self: &Arc<Self>, req: Request<B>) -> Result<Response<ResponseBody>, Infallible> {
        if req.method() != Method::GET {
            return Ok(method_not_allowed());
        }

        let response = match req.uri().path() {
            "/stream" => self.stream(),
            "/health" => self.health(),
            "/metrics" => self.metrics(),
            _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    fn stream(self: &Arc<Self>) -> Response<ResponseBody> {
        let permit = match Arc::clone(&self.viewers).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(max_viewers = self.max_viewers, "Rejecting viewer, stream busy");
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "stream busy");
            }
        };

        let (tx, rx) = mpsc::channel(CHUNK_BACKLOG);
        let frames = self.frames.clone();
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            metrics.viewer_attached();
            log_stream_started!("Viewer attached");

            let end = pump_frames(frames, tx, Arc::clone(&metrics)).await;

            metrics.viewer_detached();
            drop(permit);
            log_stream_stopped!(reason = ?end, "Viewer detached");
        });

        let chunks = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk.map(Frame::data), rx))
        });

        let mut response = Response::new(StreamBody::new(chunks).boxed_unsync());
        let headers = response.headers_mut();
        insert_header(headers, header::CONTENT_TYPE, &content_type());
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        insert_header(headers, "x-framerate", FRAMERATE);
        response
    }

    fn health(&self) -> Response<ResponseBody> {
        let body = serde_json::json!({
            "status": "ok",
            "viewers": self.active_viewers(),
            "maxViewers": self.max_viewers,
        });
        text_response(StatusCode::OK, "application/json", &body.to_string())
    }

    fn metrics(&self) -> Response<ResponseBody> {
        match camnode_telemetry::prometheus::render_metrics(&self.metrics) {
            Ok(body) => text_response(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, &body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable")
            }
        }
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            log_listening!(address = %addr, max_viewers = self.max_viewers, "Stream server listening");
        }

        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let server = Arc::clone(&self);
            let io = TokioIo::new(socket);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle(req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(peer = %peer, error = %e, "Connection closed");
                }
            });
        }

        tracing::info!("Stream server stopped");
    }
}

fn insert_header<K: header::IntoHeaderName>(headers: &mut http::HeaderMap, name: K, value: &str) {
    if let Ok(value) = http::HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn text_response(status: StatusCode, content_type: &str, body: &str) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from(body.to_string()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    insert_header(response.headers_mut(), header::CONTENT_TYPE, content_type);
    response
}

fn method_not_allowed() -> Response<ResponseBody> {
    let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed");
    insert_header(response.headers_mut(), header::ALLOW, "GET");
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_header_format() {
        let header = part_header(5120, Duration::from_micros(12_000_345));
        assert_eq!(
            &header[..],
            b"Content-Type: image/jpeg\r\nContent-Length: 5120\r\nX-Timestamp: 12.000345\r\n\r\n"
        );
    }

    #[test]
    fn delimiter_format() {
        assert_eq!(
            &delimiter()[..],
            b"\r\n--123456789000000000000987654321\r\n"
        );
        assert_eq!(
            content_type(),
            "multipart/x-mixed-replace; boundary=123456789000000000000987654321"
        );
    }

    #[test]
    fn stats_count_frames() {
        let mut stats = FrameStats::new();
        for _ in 0..STATS_EVERY {
            stats.record(2048);
        }
        assert_eq!(stats.frames, STATS_EVERY);
        assert!(stats.last.is_some());
    }
}
