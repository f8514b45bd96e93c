//! Host simulation backend.
//!
//! Stands in for the sensor, GPIO and runtime drivers so the control plane
//! runs on a regular machine. Real drivers implement the same traits.

use std::net::UdpSocket;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::camera::{Camera, CameraError, FrameSize, PixelFormat, RawFrame, SensorStatus};
use crate::hardware::{Actuators, Sensors, SystemProbe, SystemSnapshot};
use crate::state::Climate;

/// Smallest well-formed JPEG marker pair, served when no frames are loaded.
const PLACEHOLDER_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xD9];

struct CameraInner {
    next: usize,
    outstanding: bool,
    last_grab: Option<Instant>,
    status: SensorStatus,
}

/// Serves JPEG files from a directory in a loop, paced to a frame rate.
pub struct DirectoryCamera {
    frames: Vec<Bytes>,
    period: Duration,
    started: Instant,
    inner: Mutex<CameraInner>,
}

impl DirectoryCamera {
    /// Load every `.jpg`/`.jpeg` file in `dir`, in name order.
    pub fn open(dir: &Path, fps: u32) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::Capture(format!("cannot read {}: {e}", dir.display())))?;

        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            let data = std::fs::read(path)
                .map_err(|e| CameraError::Capture(format!("cannot read {}: {e}", path.display())))?;
            frames.push(Bytes::from(data));
        }

        if frames.is_empty() {
            return Err(CameraError::Capture(format!(
                "no JPEG files in {}",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), frames = frames.len(), fps, "Loaded simulated frames");
        Ok(Self::from_frames(frames, fps))
    }

    /// A camera that cycles over `frames`. An empty list serves a placeholder.
    pub fn from_frames(mut frames: Vec<Bytes>, fps: u32) -> Self {
        if frames.is_empty() {
            frames.push(Bytes::from_static(PLACEHOLDER_JPEG));
        }
        let status = SensorStatus {
            framesize: FrameSize::VGA.0,
            ..SensorStatus::default()
        };

        Self {
            frames,
            period: Duration::from_secs(1) / fps.max(1),
            started: Instant::now(),
            inner: Mutex::new(CameraInner {
                next: 0,
                outstanding: false,
                last_grab: None,
                status,
            }),
        }
    }
}

impl Camera for DirectoryCamera {
    fn grab(&self) -> Result<RawFrame, CameraError> {
        let wait = {
            let inner = self.inner.lock();
            if inner.outstanding {
                return Err(CameraError::Capture("previous frame not returned".to_string()));
            }
            inner
                .last_grab
                .map(|last| self.period.saturating_sub(last.elapsed()))
        };
        if let Some(wait) = wait.filter(|w| !w.is_zero()) {
            std::thread::sleep(wait);
        }

        let mut inner = self.inner.lock();
        let data = self.frames[inner.next % self.frames.len()].clone();
        inner.next = inner.next.wrapping_add(1);
        inner.outstanding = true;
        inner.last_grab = Some(Instant::now());

        let (width, height) = FrameSize(inner.status.framesize)
            .dimensions()
            .unwrap_or((0, 0));

        Ok(RawFrame {
            data,
            format: PixelFormat::Jpeg,
            width,
            height,
            timestamp: self.started.elapsed(),
        })
    }

    fn give_back(&self, _frame: RawFrame) {
        self.inner.lock().outstanding = false;
    }

    fn encode_jpeg(&self, frame: &RawFrame, _quality: u8) -> Result<Bytes, CameraError> {
        match frame.format {
            PixelFormat::Jpeg => Ok(frame.data.clone()),
            other => Err(CameraError::Encode(format!("cannot encode {other:?}"))),
        }
    }

    fn frame_size(&self) -> FrameSize {
        FrameSize(self.inner.lock().status.framesize)
    }

    fn set_frame_size(&self, size: FrameSize) -> Result<(), CameraError> {
        if size > FrameSize::MAX {
            return Err(CameraError::Rejected {
                name: "framesize".to_string(),
                value: i32::from(size.0),
            });
        }
        self.inner.lock().status.framesize = size.0;
        Ok(())
    }

    fn set_param(&self, name: &str, value: i32) -> Result<(), CameraError> {
        if self.inner.lock().status.set(name, value) {
            Ok(())
        } else {
            Err(CameraError::UnknownParam(name.to_string()))
        }
    }

    fn sensor_status(&self) -> SensorStatus {
        self.inner.lock().status.clone()
    }
}

/// Actuators that only log what they would drive.
#[derive(Debug, Default)]
pub struct LoggingActuators;

impl Actuators for LoggingActuators {
    fn set_led_duty(&self, duty: u8) {
        tracing::info!(duty, "Flash LED");
    }

    fn set_red_led(&self, on: bool) {
        tracing::info!(on, "Indicator LED");
    }

    fn set_servo_duty(&self, duty: u32) {
        tracing::info!(duty, "Servo");
    }

    fn set_relay(&self, on: bool) {
        tracing::info!(on, "Fan relay");
    }
}

/// Sensors returning fixed readings.
#[derive(Debug, Clone, Copy)]
pub struct StaticSensors {
    pub climate: Option<Climate>,
    pub dark: bool,
}

impl Default for StaticSensors {
    fn default() -> Self {
        Self {
            climate: Some(Climate {
                temperature: 22.5,
                humidity: 45.0,
            }),
            dark: false,
        }
    }
}

impl Sensors for StaticSensors {
    fn read_climate(&self) -> Option<Climate> {
        self.climate
    }

    fn read_light_dark(&self) -> bool {
        self.dark
    }
}

/// Runtime counters of the host process.
pub struct HostProbe {
    started: Instant,
    ip: String,
}

impl HostProbe {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ip: local_ip().unwrap_or_else(|| "0.0.0.0".to_string()),
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for HostProbe {
    fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            uptime: self.started.elapsed(),
            free_heap: available_memory().unwrap_or(0),
            rssi: 0,
            ip: self.ip.clone(),
        }
    }
}

/// Address of the interface holding the default route. Connecting a UDP
/// socket sends nothing.
fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
