//! Camera capability and frame buffer checkout.
//!
//! The sensor driver owns a single frame buffer. [`FrameSource`] hands it out
//! as an owned [`FrameBuffer`]; releasing or dropping that value gives the
//! buffer back to the driver exactly once.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Camera errors.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("JPEG encoding failed: {0}")]
    Encode(String),

    #[error("sensor rejected {name}={value}")]
    Rejected { name: String, value: i32 },

    #[error("unknown sensor parameter: {0}")]
    UnknownParam(String),

    #[error("frame buffer busy")]
    Busy,

    #[error("frame source closed")]
    Closed,
}

/// Pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Yuv422,
    Grayscale,
}

/// A frame as delivered by the driver.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Capture time since the driver started.
    pub timestamp: Duration,
}

impl RawFrame {
    fn empty() -> Self {
        Self {
            data: Bytes::new(),
            format: PixelFormat::Jpeg,
            width: 0,
            height: 0,
            timestamp: Duration::ZERO,
        }
    }
}

/// Sensor resolution index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameSize(pub u8);

impl FrameSize {
    pub const QVGA: FrameSize = FrameSize(5);
    pub const CIF: FrameSize = FrameSize(6);
    pub const VGA: FrameSize = FrameSize(8);
    pub const SVGA: FrameSize = FrameSize(9);
    pub const XGA: FrameSize = FrameSize(10);
    pub const HD: FrameSize = FrameSize(11);
    pub const SXGA: FrameSize = FrameSize(12);
    pub const UXGA: FrameSize = FrameSize(13);

    /// Largest index the sensor accepts.
    pub const MAX: FrameSize = FrameSize::UXGA;

    /// Pixel dimensions, when known.
    pub fn dimensions(self) -> Option<(u32, u32)> {
        let dims = match self.0 {
            0 => (96, 96),
            1 => (160, 120),
            2 => (176, 144),
            3 => (240, 176),
            4 => (240, 240),
            5 => (320, 240),
            6 => (400, 296),
            7 => (480, 320),
            8 => (640, 480),
            9 => (800, 600),
            10 => (1024, 768),
            11 => (1280, 720),
            12 => (1280, 1024),
            13 => (1600, 1200),
            _ => return None,
        };
        Some(dims)
    }
}

impl std::fmt::Display for FrameSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of the sensor's tunable parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorStatus {
    pub framesize: u8,
    pub quality: i32,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub sharpness: i32,
    pub denoise: i32,
    pub special_effect: i32,
    pub awb: i32,
    pub awb_gain: i32,
    pub wb_mode: i32,
    pub aec: i32,
    pub aec2: i32,
    pub ae_level: i32,
    pub aec_value: i32,
    pub agc: i32,
    pub agc_gain: i32,
    pub gainceiling: i32,
    pub bpc: i32,
    pub wpc: i32,
    pub raw_gma: i32,
    pub lenc: i32,
    pub hmirror: i32,
    pub vflip: i32,
    pub dcw: i32,
    pub colorbar: i32,
}

impl Default for SensorStatus {
    fn default() -> Self {
        Self {
            framesize: FrameSize::VGA.0,
            quality: 12,
            brightness: 0,
            contrast: 0,
            saturation: 0,
            sharpness: 0,
            denoise: 0,
            special_effect: 0,
            awb: 1,
            awb_gain: 1,
            wb_mode: 0,
            aec: 1,
            aec2: 0,
            ae_level: 0,
            aec_value: 168,
            agc: 1,
            agc_gain: 0,
            gainceiling: 0,
            bpc: 0,
            wpc: 1,
            raw_gma: 1,
            lenc: 1,
            hmirror: 0,
            vflip: 0,
            dcw: 1,
            colorbar: 0,
        }
    }
}

impl SensorStatus {
    /// Update a parameter by its command name. Returns `false` for names the
    /// sensor does not have.
    pub fn set(&mut self, name: &str, value: i32) -> bool {
        let slot = match name {
            "framesize" => {
                self.framesize = value.clamp(0, i32::from(FrameSize::MAX.0)) as u8;
                return true;
            }
            "quality" => &mut self.quality,
            "brightness" => &mut self.brightness,
            "contrast" => &mut self.contrast,
            "saturation" => &mut self.saturation,
            "sharpness" => &mut self.sharpness,
            "denoise" => &mut self.denoise,
            "special_effect" => &mut self.special_effect,
            "awb" => &mut self.awb,
            "awb_gain" => &mut self.awb_gain,
            "wb_mode" => &mut self.wb_mode,
            "aec" => &mut self.aec,
            "aec2" => &mut self.aec2,
            "ae_level" => &mut self.ae_level,
            "aec_value" => &mut self.aec_value,
            "agc" => &mut self.agc,
            "agc_gain" => &mut self.agc_gain,
            "gainceiling" => &mut self.gainceiling,
            "bpc" => &mut self.bpc,
            "wpc" => &mut self.wpc,
            "raw_gma" => &mut self.raw_gma,
            "lenc" => &mut self.lenc,
            "hmirror" => &mut self.hmirror,
            "vflip" => &mut self.vflip,
            "dcw" => &mut self.dcw,
            "colorbar" => &mut self.colorbar,
            _ => return false,
        };
        *slot = value;
        true
    }
}

/// Camera sensor driver.
///
/// `grab` may block for up to one frame period; callers run it on the
/// blocking pool. Every frame returned by `grab` must be passed back to
/// `give_back` before the next `grab`.
pub trait Camera: Send + Sync {
    fn grab(&self) -> Result<RawFrame, CameraError>;

    fn give_back(&self, frame: RawFrame);

    /// Encode a non-JPEG frame into a new JPEG buffer.
    fn encode_jpeg(&self, frame: &RawFrame, quality: u8) -> Result<Bytes, CameraError>;

    fn frame_size(&self) -> FrameSize;

    fn set_frame_size(&self, size: FrameSize) -> Result<(), CameraError>;

    /// Set a named sensor parameter.
    fn set_param(&self, name: &str, value: i32) -> Result<(), CameraError>;

    fn sensor_status(&self) -> SensorStatus;
}

/// A checked-out frame buffer.
///
/// The frame goes back to the driver on [`release`](FrameBuffer::release) or
/// on drop, whichever comes first. The checkout slot is freed afterwards.
pub struct FrameBuffer {
    frame: RawFrame,
    returned: bool,
    camera: Arc<dyn Camera>,
    _slot: OwnedSemaphorePermit,
}

impl FrameBuffer {
    fn new(frame: RawFrame, camera: Arc<dyn Camera>, slot: OwnedSemaphorePermit) -> Self {
        Self {
            frame,
            returned: false,
            camera,
            _slot: slot,
        }
    }

    pub fn raw(&self) -> &RawFrame {
        &self.frame
    }

    pub fn data(&self) -> &Bytes {
        &self.frame.data
    }

    pub fn len(&self) -> usize {
        self.frame.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.data.is_empty()
    }

    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }

    pub fn timestamp(&self) -> Duration {
        self.frame.timestamp
    }

    /// Give the frame back to the driver.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;
        let frame = std::mem::replace(&mut self.frame, RawFrame::empty());
        self.camera.give_back(frame);
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.frame.data.len())
            .field("format", &self.frame.format)
            .field("width", &self.frame.width)
            .field("height", &self.frame.height)
            .finish()
    }
}

/// Single-slot checkout in front of a [`Camera`].
///
/// Shared by the stream workers and the capture pipeline. Waiters are served
/// in FIFO order.
#[derive(Clone)]
pub struct FrameSource {
    camera: Arc<dyn Camera>,
    slot: Arc<Semaphore>,
}

impl FrameSource {
    pub fn new(camera: Arc<dyn Camera>) -> Self {
        Self {
            camera,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    /// Wait for the slot, then grab a frame.
    pub async fn checkout(&self) -> Result<FrameBuffer, CameraError> {
        let permit = Arc::clone(&self.slot)
            .acquire_owned()
            .await
            .map_err(|_| CameraError::Closed)?;
        self.grab(permit).await
    }

    /// Like [`checkout`](Self::checkout), but give up with
    /// [`CameraError::Busy`] if the slot is not free within `wait`.
    pub async fn checkout_within(&self, wait: Duration) -> Result<FrameBuffer, CameraError> {
        let permit = match tokio::time::timeout(wait, Arc::clone(&self.slot).acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CameraError::Closed),
            Err(_) => return Err(CameraError::Busy),
        };
        self.grab(permit).await
    }

    async fn grab(&self, permit: OwnedSemaphorePermit) -> Result<FrameBuffer, CameraError> {
        let camera = Arc::clone(&self.camera);
        // The buffer is built on the blocking thread so a cancelled caller
        // still drops (and so returns) it.
        tokio::task::spawn_blocking(move || {
            let frame = camera.grab()?;
            Ok::<_, CameraError>(FrameBuffer::new(frame, camera, permit))
        })
        .await
        .map_err(|e| CameraError::Capture(format!("capture task failed: {e}")))?
    }
}

/// Temporarily switches the sensor resolution and puts it back.
///
/// Restores on [`restore`](ResolutionGuard::restore) or on drop.
pub struct ResolutionGuard {
    camera: Arc<dyn Camera>,
    previous: Option<FrameSize>,
}

impl ResolutionGuard {
    /// Switch to `target` unless the sensor is already there.
    pub fn switch(camera: &Arc<dyn Camera>, target: FrameSize) -> Result<Self, CameraError> {
        let current = camera.frame_size();
        let previous = if current == target {
            None
        } else {
            camera.set_frame_size(target)?;
            tracing::debug!(from = %current, to = %target, "Switched capture resolution");
            Some(current)
        };

        Ok(Self {
            camera: Arc::clone(camera),
            previous,
        })
    }

    /// Whether the resolution was changed.
    pub fn changed(&self) -> bool {
        self.previous.is_some()
    }

    pub fn restore(mut self) -> Result<(), CameraError> {
        self.put_back()
    }

    fn put_back(&mut self) -> Result<(), CameraError> {
        match self.previous.take() {
            Some(previous) => self.camera.set_frame_size(previous),
            None => Ok(()),
        }
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.put_back() {
            tracing::warn!(error = %e, "Failed to restore resolution");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCamera {
        grabbed: AtomicUsize,
        returned: AtomicUsize,
        size: Mutex<FrameSize>,
    }

    impl CountingCamera {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                grabbed: AtomicUsize::new(0),
                returned: AtomicUsize::new(0),
                size: Mutex::new(FrameSize::VGA),
            })
        }
    }

    impl Camera for CountingCamera {
        fn grab(&self) -> Result<RawFrame, CameraError> {
            self.grabbed.fetch_add(1, Ordering::SeqCst);
            Ok(RawFrame {
                data: Bytes::from_static(b"\xff\xd8jpeg\xff\xd9"),
                format: PixelFormat::Jpeg,
                width: 640,
                height: 480,
                timestamp: Duration::from_millis(1500),
            })
        }

        fn give_back(&self, _frame: RawFrame) {
            self.returned.fetch_add(1, Ordering::SeqCst);
        }

        fn encode_jpeg(&self, frame: &RawFrame, _quality: u8) -> Result<Bytes, CameraError> {
            Ok(frame.data.clone())
        }

        fn frame_size(&self) -> FrameSize {
            *self.size.lock()
        }

        fn set_frame_size(&self, size: FrameSize) -> Result<(), CameraError> {
            *self.size.lock() = size;
            Ok(())
        }

        fn set_param(&self, name: &str, _value: i32) -> Result<(), CameraError> {
            Err(CameraError::UnknownParam(name.to_string()))
        }

        fn sensor_status(&self) -> SensorStatus {
            SensorStatus::default()
        }
    }

    #[tokio::test]
    async fn release_returns_frame_once() {
        let camera = CountingCamera::new();
        let source = FrameSource::new(camera.clone());

        let frame = source.checkout().await.unwrap();
        assert_eq!(frame.len(), 8);
        frame.release();

        assert_eq!(camera.grabbed.load(Ordering::SeqCst), 1);
        assert_eq!(camera.returned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_returns_frame() {
        let camera = CountingCamera::new();
        let source = FrameSource::new(camera.clone());

        {
            let _frame = source.checkout().await.unwrap();
        }

        assert_eq!(camera.returned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_checkout_times_out_while_held() {
        let camera = CountingCamera::new();
        let source = FrameSource::new(camera.clone());

        let held = source.checkout().await.unwrap();
        let err = source
            .checkout_within(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CameraError::Busy));

        held.release();
        let again = source
            .checkout_within(Duration::from_millis(20))
            .await
            .unwrap();
        drop(again);

        assert_eq!(camera.grabbed.load(Ordering::SeqCst), 2);
        assert_eq!(camera.returned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn resolution_guard_restores_on_drop() {
        let camera = CountingCamera::new();
        let dyn_camera: Arc<dyn Camera> = camera.clone();

        {
            let guard = ResolutionGuard::switch(&dyn_camera, FrameSize::UXGA).unwrap();
            assert!(guard.changed());
            assert_eq!(camera.frame_size(), FrameSize::UXGA);
        }
        assert_eq!(camera.frame_size(), FrameSize::VGA);
    }

    #[test]
    fn resolution_guard_noop_when_already_there() {
        let camera = CountingCamera::new();
        let dyn_camera: Arc<dyn Camera> = camera.clone();

        let guard = ResolutionGuard::switch(&dyn_camera, FrameSize::VGA).unwrap();
        assert!(!guard.changed());
        guard.restore().unwrap();
        assert_eq!(camera.frame_size(), FrameSize::VGA);
    }

    #[test]
    fn sensor_status_set_by_name() {
        let mut status = SensorStatus::default();
        assert!(status.set("vflip", 1));
        assert_eq!(status.vflip, 1);
        assert!(status.set("framesize", 99));
        assert_eq!(status.framesize, 13);
        assert!(!status.set("zoom", 2));
    }

    #[test]
    fn frame_size_dimensions() {
        assert_eq!(FrameSize::UXGA.dimensions(), Some((1600, 1200)));
        assert_eq!(FrameSize::VGA.dimensions(), Some((640, 480)));
        assert_eq!(FrameSize(42).dimensions(), None);
    }
}
