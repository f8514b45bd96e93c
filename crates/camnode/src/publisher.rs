//! Result, status, config and climate messages.
//!
//! Every message has a fixed byte capacity. A message that does not fit is
//! not truncated: it is logged and dropped.

use std::sync::Arc;

use camnode_telemetry::{log_publish_failed, MetricsRegistry};
use serde::Serialize;
use thiserror::Error;

use crate::bus::{BusError, Publisher, Qos, Topics};
use crate::camera::{Camera, SensorStatus};
use crate::config_store::DeviceConfig;
use crate::hardware::{SystemProbe, SystemSnapshot};
use crate::state::{Climate, DeviceState};

pub const RESULT_CAPACITY: usize = 256;
pub const STATUS_CAPACITY: usize = 256;
pub const CONFIG_CAPACITY: usize = 2048;
pub const CLIMATE_CAPACITY: usize = 128;

/// Outbound message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Result,
    Status,
    Config,
    Climate,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Result => "result",
            Channel::Status => "status",
            Channel::Config => "config",
            Channel::Climate => "dht",
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            Channel::Result => RESULT_CAPACITY,
            Channel::Status => STATUS_CAPACITY,
            Channel::Config => CONFIG_CAPACITY,
            Channel::Climate => CLIMATE_CAPACITY,
        }
    }

    fn qos(self) -> Qos {
        match self {
            Channel::Result => Qos::AtLeastOnce,
            _ => Qos::AtMostOnce,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishing errors.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{channel} message needs {needed} bytes, capacity is {capacity}")]
    Overflow {
        channel: Channel,
        needed: usize,
        capacity: usize,
    },

    #[error("failed to encode {channel} message: {source}")]
    Encode {
        channel: Channel,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Serialize)]
pub struct ResultMessage<'a> {
    pub id: i64,
    pub ok: bool,
    pub info: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage<'a> {
    pub client_id: &'a str,
    pub uptime: u64,
    pub free_heap: u64,
    pub rssi: i32,
    pub led_status: bool,
    pub led_brightness: u8,
    pub red_led_status: bool,
    pub servo_angle: u8,
    pub relay_status: bool,
    pub framesize: u8,
}

impl<'a> StatusMessage<'a> {
    pub fn new(client_id: &'a str, state: &DeviceState, system: &SystemSnapshot, framesize: u8) -> Self {
        Self {
            client_id,
            uptime: system.uptime.as_secs(),
            free_heap: system.free_heap,
            rssi: system.rssi,
            led_status: state.led_on,
            led_brightness: state.led_brightness,
            red_led_status: state.red_led_on,
            servo_angle: state.servo_angle,
            relay_status: state.relay_on,
            framesize,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClimateMessage<'a> {
    pub client_id: &'a str,
    pub temperature: f32,
    pub humidity: f32,
    pub light_dark: bool,
}

/// Sensor parameters as they appear in the config dump.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorFields {
    pub framesize: u8,
    pub quality: i32,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub sharpness: i32,
    pub denoise: i32,
    pub special_effect: i32,
    pub white_balance: i32,
    pub awb_gain: i32,
    pub wb_mode: i32,
    pub exposure_ctrl: i32,
    pub aec: i32,
    pub aec_value: i32,
    pub aec2: i32,
    pub ae_level: i32,
    pub gain_ctrl: i32,
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

impl From<&SensorStatus> for SensorFields {
    fn from(s: &SensorStatus) -> Self {
        Self {
            framesize: s.framesize,
            quality: s.quality,
            brightness: s.brightness,
            contrast: s.contrast,
            saturation: s.saturation,
            sharpness: s.sharpness,
            denoise: s.denoise,
            special_effect: s.special_effect,
            white_balance: s.awb,
            awb_gain: s.awb_gain,
            wb_mode: s.wb_mode,
            exposure_ctrl: s.aec,
            aec: s.aec,
            aec_value: s.aec_value,
            aec2: s.aec2,
            ae_level: s.ae_level,
            gain_ctrl: s.agc,
            agc_gain: s.agc_gain,
            gainceiling: s.gainceiling,
            bpc: s.bpc,
            wpc: s.wpc,
            raw_gma: s.raw_gma,
            lenc: s.lenc,
            hmirror: s.hmirror,
            vflip: s.vflip,
            dcw: s.dcw,
            colorbar: s.colorbar,
        }
    }
}

/// Full configuration dump, including the WiFi password.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMessage<'a> {
    pub client_id: &'a str,
    pub uptime: u64,
    pub free_heap: u64,
    pub wifi_ssid: &'a str,
    pub wifi_password: &'a str,
    pub wifi_ip: &'a str,
    pub rssi: i32,
    pub mqtt_broker: &'a str,
    pub mqtt_port: u16,
    pub led_status: bool,
    pub led_brightness: u8,
    pub red_led_status: bool,
    pub dht_interval: u64,
    pub status_interval: u64,
    pub upload_url: &'a str,
    #[serde(flatten)]
    pub sensor: SensorFields,
}

impl<'a> ConfigMessage<'a> {
    pub fn new(
        config: &'a DeviceConfig,
        state: &DeviceState,
        system: &'a SystemSnapshot,
        sensor: &SensorStatus,
    ) -> Self {
        Self {
            client_id: &config.mqtt_client_id,
            uptime: system.uptime.as_secs(),
            free_heap: system.free_heap,
            wifi_ssid: &config.wifi_ssid,
            wifi_password: &config.wifi_password,
            wifi_ip: &system.ip,
            rssi: system.rssi,
            mqtt_broker: &config.mqtt_server,
            mqtt_port: config.mqtt_port,
            led_status: state.led_on,
            led_brightness: state.led_brightness,
            red_led_status: state.red_led_on,
            dht_interval: state.intervals.dht_ms(),
            status_interval: state.intervals.status_ms(),
            upload_url: &config.upload_url,
            sensor: SensorFields::from(sensor),
        }
    }
}

/// Serialize into at most `channel.capacity()` bytes.
pub fn encode_bounded<T: Serialize>(channel: Channel, message: &T) -> Result<Vec<u8>, PublishError> {
    let bytes =
        serde_json::to_vec(message).map_err(|source| PublishError::Encode { channel, source })?;
    let capacity = channel.capacity();
    if bytes.len() > capacity {
        return Err(PublishError::Overflow {
            channel,
            needed: bytes.len(),
            capacity,
        });
    }
    Ok(bytes)
}

/// Builds and sends every outbound message of one node.
pub struct StatusPublisher {
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    client_id: String,
    camera: Arc<dyn Camera>,
    probe: Arc<dyn SystemProbe>,
    metrics: Arc<MetricsRegistry>,
}

impl StatusPublisher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        client_id: &str,
        camera: Arc<dyn Camera>,
        probe: Arc<dyn SystemProbe>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            publisher,
            topics: Topics::for_client(client_id),
            client_id: client_id.to_string(),
            camera,
            probe,
            metrics,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Acknowledge a command.
    pub fn publish_result(&self, id: i64, ok: bool, info: &str) {
        let message = ResultMessage { id, ok, info };
        self.send(Channel::Result, &message);
    }

    /// Periodic status report.
    pub fn publish_status(&self, state: &DeviceState) {
        let system = self.probe.snapshot();
        let framesize = self.camera.frame_size().0;
        let message = StatusMessage::new(&self.client_id, state, &system, framesize);
        self.send(Channel::Status, &message);
    }

    /// Full config dump. A non-zero `id` is also acknowledged.
    pub fn publish_config(&self, id: i64, state: &DeviceState, config: &DeviceConfig) {
        let system = self.probe.snapshot();
        let sensor = self.camera.sensor_status();
        let message = ConfigMessage::new(config, state, &system, &sensor);
        self.send(Channel::Config, &message);

        if id != 0 {
            self.publish_result(id, true, "config sent");
        }
    }

    /// Latest climate reading. Nothing is sent without one.
    pub fn publish_climate(&self, state: &DeviceState) {
        let Some(Climate {
            temperature,
            humidity,
        }) = state.climate
        else {
            return;
        };

        let message = ClimateMessage {
            client_id: &self.client_id,
            temperature,
            humidity,
            light_dark: state.light_dark,
        };
        self.send(Channel::Climate, &message);
    }

    fn send<T: Serialize>(&self, channel: Channel, message: &T) {
        let outcome = encode_bounded(channel, message).and_then(|payload| {
            self.publisher
                .publish(self.topic(channel), payload, channel.qos())
                .map_err(PublishError::from)
        });

        match outcome {
            Ok(()) => self.metrics.record_publish(channel.as_str(), true),
            Err(e) => {
                self.metrics.record_publish(channel.as_str(), false);
                log_publish_failed!(channel = %channel, error = %e, "Failed to publish message");
            }
        }
    }

    fn topic(&self, channel: Channel) -> &str {
        match channel {
            Channel::Result => &self.topics.result,
            Channel::Status => &self.topics.status,
            Channel::Config => &self.topics.config,
            Channel::Climate => &self.topics.dht,
        }
    }
}
