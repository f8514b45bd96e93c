//! Command router: turns inbound envelopes into actions and results.

use std::sync::Arc;

use camnode_telemetry::{
    log_command_dropped, log_command_handled, log_restart_requested, MetricsRegistry,
};

use crate::camera::{Camera, FrameSize};
use crate::capture::CapturePipeline;
use crate::command::{Command, Envelope};
use crate::config_store::{ConfigStore, DeviceConfig};
use crate::hardware::{Actuators, Outputs, Sensors, SystemProbe, WindowState};
use crate::publisher::StatusPublisher;
use crate::state::DeviceState;
use crate::voice::VoiceCommand;

/// What the control loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Flush the link and restart with the persisted config.
    Restart,
}

/// Hardware capabilities of one node.
#[derive(Clone)]
pub struct Devices {
    pub camera: Arc<dyn Camera>,
    pub actuators: Arc<dyn Actuators>,
    pub sensors: Arc<dyn Sensors>,
    pub probe: Arc<dyn SystemProbe>,
}

enum Outcome {
    Done { ok: bool, info: String },
    Restart { info: &'static str },
    /// The handler published its own result.
    Published,
}

impl Outcome {
    fn ok(info: impl Into<String>) -> Self {
        Outcome::Done {
            ok: true,
            info: info.into(),
        }
    }

    fn failed(info: impl Into<String>) -> Self {
        Outcome::Done {
            ok: false,
            info: info.into(),
        }
    }
}

pub struct CommandRouter {
    state: DeviceState,
    config: ConfigStore,
    outputs: Outputs,
    camera: Arc<dyn Camera>,
    sensors: Arc<dyn Sensors>,
    capture: CapturePipeline,
    publisher: StatusPublisher,
    metrics: Arc<MetricsRegistry>,
}

impl CommandRouter {
    /// Build a router and drive every actuator to its boot position.
    pub fn new(
        config: ConfigStore,
        devices: &Devices,
        capture: CapturePipeline,
        publisher: StatusPublisher,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let outputs = Outputs::new(Arc::clone(&devices.actuators));
        let mut state = DeviceState::default();
        outputs.init(&mut state);

        Self {
            state,
            config,
            outputs,
            camera: Arc::clone(&devices.camera),
            sensors: Arc::clone(&devices.sensors),
            capture,
            publisher,
            metrics,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn config(&self) -> &DeviceConfig {
        self.config.config()
    }

    /// Handle one raw payload from the command topic.
    ///
    /// Payloads without a usable `id` and `op` are dropped without a result.
    /// Everything else produces exactly one result.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Directive {
        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.record_dropped(e.reason());
                log_command_dropped!(reason = e.reason(), error = %e, "Dropping command");
                return Directive::Continue;
            }
        };
        let id = envelope.id;

        let command = match Command::from_envelope(&envelope) {
            Ok(command) => command,
            Err(fault) => {
                self.metrics.record_command(&envelope.op, false);
                log_command_handled!(id, op = %envelope.op, ok = false, info = %fault, "Command rejected");
                self.publisher.publish_result(id, false, fault.0);
                return Directive::Continue;
            }
        };

        let label = command.label();
        match self.dispatch(id, command).await {
            Outcome::Done { ok, info } => {
                self.metrics.record_command(label, ok);
                log_command_handled!(id, op = label, ok, info = %info, "Command handled");
                self.publisher.publish_result(id, ok, &info);
                Directive::Continue
            }
            Outcome::Restart { info } => {
                self.metrics.record_command(label, true);
                log_restart_requested!(id, op = label, "Config changed, restarting");
                self.publisher.publish_result(id, true, info);
                Directive::Restart
            }
            Outcome::Published => {
                self.metrics.record_command(label, true);
                log_command_handled!(id, op = label, ok = true, "Command handled");
                Directive::Continue
            }
        }
    }

    async fn dispatch(&mut self, id: i64, command: Command) -> Outcome {
        match command {
            Command::SetWifi { ssid, password } => {
                match self.config.save_wifi(&ssid, &password) {
                    Ok(()) => Outcome::Restart {
                        info: "WiFi config saved, restarting",
                    },
                    Err(e) => store_failure(e),
                }
            }
            Command::SetMqtt {
                server,
                port,
                client_id,
            } => {
                let current = self.config.config();
                let port = port.unwrap_or(current.mqtt_port);
                let client_id = client_id.unwrap_or_else(|| current.mqtt_client_id.clone());
                match self.config.save_mqtt(&server, port, &client_id) {
                    Ok(()) => Outcome::Restart {
                        info: "MQTT config saved, restarting",
                    },
                    Err(e) => store_failure(e),
                }
            }
            Command::SetUploadUrl { url } => match self.config.save_upload_url(&url) {
                Ok(()) => Outcome::ok("upload URL updated"),
                Err(e) => store_failure(e),
            },
            Command::ResetConfig => match self.config.reset() {
                Ok(()) => Outcome::Restart {
                    info: "config reset, restarting",
                },
                Err(e) => store_failure(e),
            },
            Command::GetConfig => {
                self.publisher
                    .publish_config(id, &self.state, self.config.config());
                Outcome::Published
            }
            Command::SetDhtInterval { requested_ms } => {
                let ms = self.state.intervals.set_dht_ms(requested_ms);
                Outcome::ok(format!("DHT interval set to {ms} ms"))
            }
            Command::SetStatusInterval { requested_ms } => {
                let ms = self.state.intervals.set_status_ms(requested_ms);
                Outcome::ok(format!("status interval set to {ms} ms"))
            }
            Command::Capture => {
                let report = self.run_capture(id).await;
                Outcome::Done {
                    ok: report.ok,
                    info: report.info,
                }
            }
            Command::Led { on } => {
                self.outputs.led(&mut self.state, on);
                Outcome::ok(if on { "LED on" } else { "LED off" })
            }
            Command::LedBrightness { value } => {
                let brightness = self.outputs.led_brightness(&mut self.state, value);
                Outcome::ok(format!("brightness set to {brightness}"))
            }
            Command::RedLed { on } => {
                self.outputs.red_led(&mut self.state, on);
                Outcome::ok(if on {
                    "indicator LED on"
                } else {
                    "indicator LED off"
                })
            }
            Command::FrameSize { value } => self.set_frame_size(value),
            Command::Servo { angle } => {
                let angle = self.outputs.servo(&mut self.state, angle);
                Outcome::ok(format!(
                    "window {} (angle: {angle})",
                    WindowState::from_angle(angle)
                ))
            }
            Command::ServoPreset(preset) => {
                let angle = self
                    .outputs
                    .servo(&mut self.state, i64::from(preset.angle()));
                Outcome::ok(format!("window {} ({angle})", WindowState::from_angle(angle)))
            }
            Command::Relay { on } => {
                self.outputs.relay(&mut self.state, on);
                Outcome::ok(if on { "fan on" } else { "fan off" })
            }
            Command::SetParam { name, value } => {
                let value = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                if let Err(e) = self.camera.set_param(&name, value) {
                    tracing::debug!(param = %name, value, error = %e, "Sensor ignored parameter");
                }
                Outcome::ok(format!("param {name} set to {value}"))
            }
        }
    }

    fn set_frame_size(&mut self, value: i64) -> Outcome {
        let size = match u8::try_from(value) {
            Ok(raw) if raw <= FrameSize::MAX.0 => FrameSize(raw),
            _ => return Outcome::failed("invalid frame size"),
        };
        match self.camera.set_frame_size(size) {
            Ok(()) => Outcome::ok("frame size updated"),
            Err(e) => {
                tracing::warn!(framesize = %size, error = %e, "Sensor rejected frame size");
                Outcome::failed("frame size rejected")
            }
        }
    }

    async fn run_capture(&self, id: i64) -> crate::capture::CaptureReport {
        let url = &self.config.config().upload_url;
        self.capture
            .capture_and_upload(id, self.publisher.client_id(), url)
            .await
    }

    /// Handle a local voice command. Results carry id `0`.
    pub async fn handle_voice(&mut self, command: VoiceCommand) {
        let info = match command {
            VoiceCommand::LedOn => {
                self.outputs.led(&mut self.state, true);
                "voice: LED on"
            }
            VoiceCommand::LedOff => {
                self.outputs.led(&mut self.state, false);
                "voice: LED off"
            }
            VoiceCommand::LedMax => {
                self.outputs
                    .led_brightness(&mut self.state, i64::from(u8::MAX));
                self.outputs.led(&mut self.state, true);
                "voice: LED max brightness"
            }
            VoiceCommand::LedMid => {
                self.outputs.led_brightness(&mut self.state, 128);
                self.outputs.led(&mut self.state, true);
                "voice: LED medium brightness"
            }
            VoiceCommand::RedLedOn => {
                self.outputs.red_led(&mut self.state, true);
                "voice: indicator on"
            }
            VoiceCommand::RedLedOff => {
                self.outputs.red_led(&mut self.state, false);
                "voice: indicator off"
            }
            VoiceCommand::WindowOpen => {
                self.outputs.servo(&mut self.state, 180);
                "voice: window open"
            }
            VoiceCommand::WindowClose => {
                self.outputs.servo(&mut self.state, 0);
                "voice: window closed"
            }
            VoiceCommand::FanOn => {
                self.outputs.relay(&mut self.state, true);
                "voice: fan on"
            }
            VoiceCommand::FanOff => {
                self.outputs.relay(&mut self.state, false);
                "voice: fan off"
            }
            VoiceCommand::Capture => {
                self.publisher.publish_result(0, true, "voice: capturing");
                let report = self.run_capture(0).await;
                self.metrics.record_command("voice", report.ok);
                log_command_handled!(id = 0, op = "voice", ok = report.ok, info = %report.info, "Voice capture handled");
                self.publisher.publish_result(0, report.ok, &report.info);
                return;
            }
        };

        self.metrics.record_command("voice", true);
        log_command_handled!(id = 0, op = "voice", ok = true, info = %info, "Voice command handled");
        self.publisher.publish_result(0, true, info);
    }

    /// Read the climate and light sensors into the device state. A failed
    /// climate read keeps the previous value.
    pub fn sample_climate(&mut self) {
        match self.sensors.read_climate() {
            Some(climate) => self.state.climate = Some(climate),
            None => tracing::debug!("Climate sensor read failed"),
        }
        self.state.light_dark = self.sensors.read_light_dark();
    }

    pub fn publish_status(&self) {
        self.publisher.publish_status(&self.state);
    }

    pub fn publish_climate(&self) {
        self.publisher.publish_climate(&self.state);
    }
}

fn store_failure(e: crate::store::StoreError) -> Outcome {
    tracing::error!(error = %e, "Failed to persist config");
    Outcome::failed("failed to save config")
}
