//! Fake drivers with recording and failure injection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use camnode_lib::bus::{BusError, Publisher, Qos};
use camnode_lib::camera::{Camera, CameraError, FrameSize, PixelFormat, RawFrame, SensorStatus};
use camnode_lib::hardware::{Actuators, Sensors, SystemProbe, SystemSnapshot};
use camnode_lib::state::Climate;
use camnode_lib::store::{KvStore, StoreError, StoredValue};

/// Bytes a [`FakeCamera`] returns from `encode_jpeg`.
pub const ENCODED_JPEG: &[u8] = b"\xFF\xD8encoded\xFF\xD9";

struct CameraState {
    frame_size: FrameSize,
    status: SensorStatus,
    size_history: Vec<FrameSize>,
    params: Vec<(String, i32)>,
}

/// A camera that counts every grab, give-back and encode.
pub struct FakeCamera {
    format: PixelFormat,
    fail_after: Option<usize>,
    fail_encode: bool,
    grabs: AtomicUsize,
    returns: AtomicUsize,
    encodes: AtomicUsize,
    state: Mutex<CameraState>,
}

impl FakeCamera {
    /// A JPEG camera at VGA.
    pub fn new() -> Self {
        Self {
            format: PixelFormat::Jpeg,
            fail_after: None,
            fail_encode: false,
            grabs: AtomicUsize::new(0),
            returns: AtomicUsize::new(0),
            encodes: AtomicUsize::new(0),
            state: Mutex::new(CameraState {
                frame_size: FrameSize::VGA,
                status: SensorStatus {
                    framesize: FrameSize::VGA.0,
                    ..SensorStatus::default()
                },
                size_history: Vec::new(),
                params: Vec::new(),
            }),
        }
    }

    /// Deliver frames in `format` instead of JPEG.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Fail every grab after the first `frames` succeed.
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn failing_encode(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    /// Successful grabs so far.
    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }

    pub fn returns(&self) -> usize {
        self.returns.load(Ordering::SeqCst)
    }

    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    /// Frames grabbed and not given back.
    pub fn outstanding(&self) -> usize {
        self.grabs() - self.returns()
    }

    /// Every resolution set, in order.
    pub fn size_history(&self) -> Vec<FrameSize> {
        self.state.lock().size_history.clone()
    }

    /// Every accepted or rejected parameter write, in order.
    pub fn params(&self) -> Vec<(String, i32)> {
        self.state.lock().params.clone()
    }

    /// Payload of the n-th frame (1-based).
    pub fn frame_data(n: usize) -> Bytes {
        Bytes::from(format!("frame-{n}"))
    }
}

impl Default for FakeCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera for FakeCamera {
    fn grab(&self) -> Result<RawFrame, CameraError> {
        if self.outstanding() > 0 {
            return Err(CameraError::Capture("previous frame not returned".to_string()));
        }
        let taken = self.grabs();
        if self.fail_after.is_some_and(|limit| taken >= limit) {
            return Err(CameraError::Capture("sensor timeout".to_string()));
        }
        let n = self.grabs.fetch_add(1, Ordering::SeqCst) + 1;
        let (width, height) = self.frame_size().dimensions().unwrap_or((0, 0));

        Ok(RawFrame {
            data: Self::frame_data(n),
            format: self.format,
            width,
            height,
            timestamp: Duration::from_millis(n as u64 * 33),
        })
    }

    fn give_back(&self, _frame: RawFrame) {
        self.returns.fetch_add(1, Ordering::SeqCst);
    }

    fn encode_jpeg(&self, _frame: &RawFrame, _quality: u8) -> Result<Bytes, CameraError> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_encode {
            return Err(CameraError::Encode("out of memory".to_string()));
        }
        Ok(Bytes::from_static(ENCODED_JPEG))
    }

    fn frame_size(&self) -> FrameSize {
        self.state.lock().frame_size
    }

    fn set_frame_size(&self, size: FrameSize) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        state.frame_size = size;
        state.status.framesize = size.0;
        state.size_history.push(size);
        Ok(())
    }

    fn set_param(&self, name: &str, value: i32) -> Result<(), CameraError> {
        let mut state = self.state.lock();
        state.params.push((name.to_string(), value));
        if state.status.set(name, value) {
            Ok(())
        } else {
            Err(CameraError::UnknownParam(name.to_string()))
        }
    }

    fn sensor_status(&self) -> SensorStatus {
        self.state.lock().status.clone()
    }
}

/// One message handed to the bus.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// A publisher that keeps everything it is given.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<Published>>,
    rejecting: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail.
    pub fn reject_all(&self) {
        self.rejecting.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().clone()
    }

    /// Decoded payloads published to a topic ending in `/{channel}`.
    pub fn on(&self, channel: &str) -> Vec<Value> {
        let suffix = format!("/{channel}");
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic.ends_with(&suffix))
            .map(Published::json)
            .collect()
    }

    pub fn results(&self) -> Vec<Value> {
        self.on("result")
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Publisher for RecordingBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BusError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(BusError::Rejected("bus offline".to_string()));
        }
        self.messages.lock().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
}

/// An actuator write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    LedDuty(u8),
    RedLed(bool),
    ServoDuty(u32),
    Relay(bool),
}

#[derive(Default)]
pub struct RecordingActuators {
    writes: Mutex<Vec<Write>>,
}

impl RecordingActuators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().clone()
    }

    pub fn last(&self) -> Option<Write> {
        self.writes.lock().last().copied()
    }

    pub fn clear(&self) {
        self.writes.lock().clear();
    }
}

impl Actuators for RecordingActuators {
    fn set_led_duty(&self, duty: u8) {
        self.writes.lock().push(Write::LedDuty(duty));
    }

    fn set_red_led(&self, on: bool) {
        self.writes.lock().push(Write::RedLed(on));
    }

    fn set_servo_duty(&self, duty: u32) {
        self.writes.lock().push(Write::ServoDuty(duty));
    }

    fn set_relay(&self, on: bool) {
        self.writes.lock().push(Write::Relay(on));
    }
}

/// Sensors whose readings the test sets.
pub struct FixedSensors {
    climate: Mutex<Option<Climate>>,
    dark: AtomicBool,
}

impl FixedSensors {
    pub fn new(climate: Option<Climate>, dark: bool) -> Self {
        Self {
            climate: Mutex::new(climate),
            dark: AtomicBool::new(dark),
        }
    }

    pub fn set_climate(&self, climate: Option<Climate>) {
        *self.climate.lock() = climate;
    }

    pub fn set_dark(&self, dark: bool) {
        self.dark.store(dark, Ordering::SeqCst);
    }
}

impl Default for FixedSensors {
    fn default() -> Self {
        Self::new(
            Some(Climate {
                temperature: 21.0,
                humidity: 40.0,
            }),
            false,
        )
    }
}

impl Sensors for FixedSensors {
    fn read_climate(&self) -> Option<Climate> {
        *self.climate.lock()
    }

    fn read_light_dark(&self) -> bool {
        self.dark.load(Ordering::SeqCst)
    }
}

/// A probe with constant counters.
pub struct FixedProbe(pub SystemSnapshot);

impl Default for FixedProbe {
    fn default() -> Self {
        Self(SystemSnapshot {
            uptime: Duration::from_secs(42),
            free_heap: 120_000,
            rssi: -61,
            ip: "192.168.4.7".to_string(),
        })
    }
}

impl SystemProbe for FixedProbe {
    fn snapshot(&self) -> SystemSnapshot {
        self.0.clone()
    }
}

/// A store whose writes always fail.
#[derive(Default)]
pub struct FailingStore;

impl KvStore for FailingStore {
    fn get(&self, _namespace: &str, _key: &str) -> Result<Option<StoredValue>, StoreError> {
        Ok(None)
    }

    fn put(&self, _namespace: &str, _entries: &[(&str, StoredValue)]) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("flash write failed")))
    }

    fn clear(&self, _namespace: &str) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("flash erase failed")))
    }
}
