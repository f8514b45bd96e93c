//! Inbound command envelopes and per-operation schemas.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config_store::{valid_client_id, valid_server};

/// Largest accepted command payload, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1024;

/// Longest accepted `op`, in bytes. Ops are `[A-Za-z0-9_]` only, so an
/// unknown op echoed back in its result always fits the result capacity.
pub const MAX_OP_BYTES: usize = 64;

/// Why an inbound payload was dropped without a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("payload of {0} bytes exceeds the 1024 byte limit")]
    TooLarge(usize),

    #[error("payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("missing or non-integer id")]
    MissingId,

    #[error("missing, empty or oversized op")]
    MissingOp,

    #[error("op has characters outside [A-Za-z0-9_]")]
    InvalidOp,
}

impl EnvelopeError {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            EnvelopeError::TooLarge(_) => "too_large",
            EnvelopeError::Malformed(_) => "malformed",
            EnvelopeError::MissingId => "missing_id",
            EnvelopeError::MissingOp => "missing_op",
            EnvelopeError::InvalidOp => "invalid_op",
        }
    }
}

/// A validated `{ id, op, ... }` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: i64,
    pub op: String,
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn parse(payload: &[u8]) -> Result<Self, EnvelopeError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(EnvelopeError::TooLarge(payload.len()));
        }

        let mut fields = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(EnvelopeError::Malformed("not an object".to_string())),
            Err(e) => return Err(EnvelopeError::Malformed(e.to_string())),
        };

        let id = fields
            .remove("id")
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or(EnvelopeError::MissingId)?;

        let op = match fields.remove("op") {
            Some(Value::String(op)) if !op.is_empty() && op.len() <= MAX_OP_BYTES => op,
            _ => return Err(EnvelopeError::MissingOp),
        };
        if !op.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(EnvelopeError::InvalidOp);
        }

        Ok(Self { id, op, fields })
    }

    /// Integer `val`, if present and an integer.
    pub fn val(&self) -> Option<i64> {
        self.int("val")
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Known operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SetWifi,
    SetMqtt,
    SetUploadUrl,
    ResetConfig,
    GetConfig,
    SetDhtInterval,
    SetStatusInterval,
    Capture,
    Led,
    LedBrightness,
    RedLed,
    FrameSize,
    Servo,
    ServoFull,
    ServoHalf,
    ServoSmall,
    ServoClose,
    Relay,
    Fan,
    FanOn,
    FanOff,
}

const OPS: &[(&str, Op)] = &[
    ("set_wifi", Op::SetWifi),
    ("set_mqtt", Op::SetMqtt),
    ("set_upload_url", Op::SetUploadUrl),
    ("reset_config", Op::ResetConfig),
    ("get_config", Op::GetConfig),
    ("set_dht_interval", Op::SetDhtInterval),
    ("set_status_interval", Op::SetStatusInterval),
    ("capture", Op::Capture),
    ("led", Op::Led),
    ("led_brightness", Op::LedBrightness),
    ("red_led", Op::RedLed),
    ("framesize", Op::FrameSize),
    ("servo", Op::Servo),
    ("servo_full", Op::ServoFull),
    ("servo_half", Op::ServoHalf),
    ("servo_small", Op::ServoSmall),
    ("servo_close", Op::ServoClose),
    ("relay", Op::Relay),
    ("fan", Op::Fan),
    ("fan_on", Op::FanOn),
    ("fan_off", Op::FanOff),
];

impl Op {
    pub fn lookup(name: &str) -> Option<Op> {
        OPS.iter().find(|(n, _)| *n == name).map(|(_, op)| *op)
    }

    pub fn name(self) -> &'static str {
        OPS.iter()
            .find(|(_, op)| *op == self)
            .map_or("unknown", |(name, _)| *name)
    }
}

/// Window presets reachable by dedicated ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoPreset {
    Full,
    Half,
    Small,
    Close,
}

impl ServoPreset {
    pub fn angle(self) -> u8 {
        match self {
            ServoPreset::Full => 180,
            ServoPreset::Half => 90,
            ServoPreset::Small => 45,
            ServoPreset::Close => 0,
        }
    }
}

/// A command with its op-specific fields checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetWifi {
        ssid: String,
        password: String,
    },
    SetMqtt {
        server: String,
        /// `None` keeps the current port.
        port: Option<u16>,
        /// `None` keeps the current client id.
        client_id: Option<String>,
    },
    SetUploadUrl {
        url: String,
    },
    ResetConfig,
    GetConfig,
    SetDhtInterval {
        requested_ms: i64,
    },
    SetStatusInterval {
        requested_ms: i64,
    },
    Capture,
    Led {
        on: bool,
    },
    LedBrightness {
        value: i64,
    },
    RedLed {
        on: bool,
    },
    FrameSize {
        value: i64,
    },
    Servo {
        angle: i64,
    },
    ServoPreset(ServoPreset),
    Relay {
        on: bool,
    },
    /// Anything else is handed to the sensor as a named parameter.
    SetParam {
        name: String,
        value: i64,
    },
}

/// A configuration command that cannot be applied. Reported as a failed
/// result; nothing is changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConfigFault(pub &'static str);

impl Command {
    pub fn from_envelope(envelope: &Envelope) -> Result<Command, ConfigFault> {
        let Some(op) = Op::lookup(&envelope.op) else {
            return Ok(Command::SetParam {
                name: envelope.op.clone(),
                value: envelope.val().unwrap_or(0),
            });
        };

        let val = envelope.val().unwrap_or(0);
        let command = match op {
            Op::SetWifi => match (envelope.str("ssid"), envelope.str("password")) {
                (Some(ssid), Some(password)) if !ssid.is_empty() => Command::SetWifi {
                    ssid: ssid.to_string(),
                    password: password.to_string(),
                },
                _ => return Err(ConfigFault("missing ssid or password")),
            },
            Op::SetMqtt => {
                let server = match envelope.str("server") {
                    Some(server) if server.is_empty() => return Err(ConfigFault("missing server")),
                    Some(server) if valid_server(server) => server.to_string(),
                    Some(_) => return Err(ConfigFault("invalid server")),
                    None => return Err(ConfigFault("missing server")),
                };
                let port = match envelope.int("port") {
                    None => None,
                    Some(port) => match u16::try_from(port) {
                        Ok(port) if port != 0 => Some(port),
                        _ => return Err(ConfigFault("invalid MQTT port")),
                    },
                };
                let client_id = match envelope.str("clientId") {
                    None | Some("") => None,
                    Some(id) if valid_client_id(id) => Some(id.to_string()),
                    Some(_) => return Err(ConfigFault("invalid client id")),
                };
                Command::SetMqtt {
                    server,
                    port,
                    client_id,
                }
            }
            Op::SetUploadUrl => match envelope.str("url") {
                Some(url) if !url.is_empty() => Command::SetUploadUrl {
                    url: url.to_string(),
                },
                _ => return Err(ConfigFault("missing url")),
            },
            Op::ResetConfig => Command::ResetConfig,
            Op::GetConfig => Command::GetConfig,
            Op::SetDhtInterval => Command::SetDhtInterval {
                requested_ms: envelope
                    .val()
                    .unwrap_or(crate::state::DHT_INTERVAL_DEFAULT_MS as i64),
            },
            Op::SetStatusInterval => Command::SetStatusInterval {
                requested_ms: envelope
                    .val()
                    .unwrap_or(crate::state::STATUS_INTERVAL_DEFAULT_MS as i64),
            },
            Op::Capture => Command::Capture,
            Op::Led => Command::Led { on: val != 0 },
            Op::LedBrightness => Command::LedBrightness { value: val },
            Op::RedLed => Command::RedLed { on: val != 0 },
            Op::FrameSize => Command::FrameSize { value: val },
            Op::Servo => Command::Servo { angle: val },
            Op::ServoFull => Command::ServoPreset(ServoPreset::Full),
            Op::ServoHalf => Command::ServoPreset(ServoPreset::Half),
            Op::ServoSmall => Command::ServoPreset(ServoPreset::Small),
            Op::ServoClose => Command::ServoPreset(ServoPreset::Close),
            Op::Relay | Op::Fan => Command::Relay { on: val != 0 },
            Op::FanOn => Command::Relay { on: true },
            Op::FanOff => Command::Relay { on: false },
        };
        Ok(command)
    }

    /// Metric label. Free-form parameter names share one label.
    pub fn label(&self) -> &'static str {
        match self {
            Command::SetWifi { .. } => "set_wifi",
            Command::SetMqtt { .. } => "set_mqtt",
            Command::SetUploadUrl { .. } => "set_upload_url",
            Command::ResetConfig => "reset_config",
            Command::GetConfig => "get_config",
            Command::SetDhtInterval { .. } => "set_dht_interval",
            Command::SetStatusInterval { .. } => "set_status_interval",
            Command::Capture => "capture",
            Command::Led { .. } => "led",
            Command::LedBrightness { .. } => "led_brightness",
            Command::RedLed { .. } => "red_led",
            Command::FrameSize { .. } => "framesize",
            Command::Servo { .. } => "servo",
            Command::ServoPreset(_) => "servo_preset",
            Command::Relay { .. } => "relay",
            Command::SetParam { .. } => "set_param",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Envelope, EnvelopeError> {
        Envelope::parse(json.as_bytes())
    }

    fn command(json: &str) -> Result<Command, ConfigFault> {
        Command::from_envelope(&parse(json).unwrap())
    }

    #[test]
    fn envelope_requires_id_and_op() {
        assert_eq!(parse(r#"{"op":"led"}"#), Err(EnvelopeError::MissingId));
        assert_eq!(parse(r#"{"id":1}"#), Err(EnvelopeError::MissingOp));
        assert_eq!(parse(r#"{"id":"1","op":"led"}"#), Err(EnvelopeError::MissingId));
        assert_eq!(parse(r#"{"id":1,"op":""}"#), Err(EnvelopeError::MissingOp));
        assert_eq!(parse(r#"{"id":1,"op":5}"#), Err(EnvelopeError::MissingOp));
    }

    #[test]
    fn envelope_rejects_bad_json_and_size() {
        assert!(matches!(parse("not json"), Err(EnvelopeError::Malformed(_))));
        assert!(matches!(parse("[1,2]"), Err(EnvelopeError::Malformed(_))));

        let big = format!(r#"{{"id":1,"op":"led","pad":"{}"}}"#, "x".repeat(1100));
        assert!(matches!(parse(&big), Err(EnvelopeError::TooLarge(_))));

        let long_op = format!(r#"{{"id":1,"op":"{}"}}"#, "a".repeat(65));
        assert_eq!(parse(&long_op), Err(EnvelopeError::MissingOp));
    }

    #[test]
    fn envelope_rejects_op_outside_name_charset() {
        let escaped = format!(r#"{{"id":9,"op":"{}","val":1}}"#, "\\u0001".repeat(64));
        assert_eq!(parse(&escaped), Err(EnvelopeError::InvalidOp));
        assert_eq!(parse(r#"{"id":1,"op":"led on"}"#), Err(EnvelopeError::InvalidOp));
        assert_eq!(parse(r#"{"id":1,"op":"qu\"ote"}"#), Err(EnvelopeError::InvalidOp));
        assert!(parse(r#"{"id":1,"op":"awb_gain"}"#).is_ok());
    }

    #[test]
    fn set_mqtt_checks_identity() {
        let long = format!(r#"{{"id":1,"op":"set_mqtt","server":"b","clientId":"{}"}}"#, "c".repeat(200));
        assert_eq!(command(&long), Err(ConfigFault("invalid client id")));
        assert_eq!(
            command(r#"{"id":1,"op":"set_mqtt","server":"b","clientId":"cam/+"}"#),
            Err(ConfigFault("invalid client id"))
        );
        assert_eq!(
            command(r#"{"id":1,"op":"set_mqtt","server":"mqtt://b"}"#),
            Err(ConfigFault("invalid server"))
        );
        assert_eq!(
            command(r#"{"id":1,"op":"set_mqtt","server":"b.local","clientId":"porch-2"}"#),
            Ok(Command::SetMqtt {
                server: "b.local".to_string(),
                port: None,
                client_id: Some("porch-2".to_string()),
            })
        );
    }

    #[test]
    fn val_defaults_to_zero() {
        assert_eq!(command(r#"{"id":1,"op":"led"}"#), Ok(Command::Led { on: false }));
        assert_eq!(
            command(r#"{"id":1,"op":"led","val":"on"}"#),
            Ok(Command::Led { on: false })
        );
        assert_eq!(
            command(r#"{"id":1,"op":"led","val":1}"#),
            Ok(Command::Led { on: true })
        );
    }

    #[test]
    fn set_wifi_needs_both_fields() {
        assert_eq!(
            command(r#"{"id":1,"op":"set_wifi","ssid":"lab"}"#),
            Err(ConfigFault("missing ssid or password"))
        );
        assert_eq!(
            command(r#"{"id":1,"op":"set_wifi","ssid":"lab","password":"pw"}"#),
            Ok(Command::SetWifi {
                ssid: "lab".to_string(),
                password: "pw".to_string()
            })
        );
    }

    #[test]
    fn set_mqtt_port_rules() {
        assert_eq!(
            command(r#"{"id":1,"op":"set_mqtt"}"#),
            Err(ConfigFault("missing server"))
        );
        assert_eq!(
            command(r#"{"id":1,"op":"set_mqtt","server":"h","port":70000}"#),
            Err(ConfigFault("invalid MQTT port"))
        );
        assert_eq!(
            command(r#"{"id":1,"op":"set_mqtt","server":"h","clientId":"c2"}"#),
            Ok(Command::SetMqtt {
                server: "h".to_string(),
                port: None,
                client_id: Some("c2".to_string())
            })
        );
    }

    #[test]
    fn interval_defaults() {
        assert_eq!(
            command(r#"{"id":1,"op":"set_dht_interval"}"#),
            Ok(Command::SetDhtInterval {
                requested_ms: 5000
            })
        );
        assert_eq!(
            command(r#"{"id":1,"op":"set_status_interval"}"#),
            Ok(Command::SetStatusInterval {
                requested_ms: 60000
            })
        );
    }

    #[test]
    fn unknown_op_becomes_sensor_param() {
        assert_eq!(
            command(r#"{"id":3,"op":"vflip","val":1}"#),
            Ok(Command::SetParam {
                name: "vflip".to_string(),
                value: 1
            })
        );
    }

    #[test]
    fn fan_aliases() {
        assert_eq!(
            command(r#"{"id":1,"op":"fan","val":2}"#),
            Ok(Command::Relay { on: true })
        );
        assert_eq!(
            command(r#"{"id":1,"op":"fan_off"}"#),
            Ok(Command::Relay { on: false })
        );
    }

    #[test]
    fn op_table_round_trips_names() {
        for (name, op) in OPS {
            assert_eq!(Op::lookup(name), Some(*op));
            assert_eq!(op.name(), *name);
        }
        assert_eq!(Op::lookup("brightness"), None);
    }
}
