//! Device configuration persisted in the key-value store.

use std::sync::Arc;

use serde::Serialize;

use crate::store::{KvStore, StoreError, StoredValue};

/// Namespace holding every device setting.
pub const NAMESPACE: &str = "camnode";

/// Persisted key names.
pub mod keys {
    pub const WIFI_SSID: &str = "wifi_ssid";
    pub const WIFI_PASSWORD: &str = "wifi_pass";
    pub const MQTT_SERVER: &str = "mqtt_server";
    pub const MQTT_PORT: &str = "mqtt_port";
    pub const MQTT_CLIENT_ID: &str = "mqtt_client";
    pub const UPLOAD_URL: &str = "upload_url";
}

pub const DEFAULT_WIFI_SSID: &str = "camnode";
pub const DEFAULT_MQTT_SERVER: &str = "broker.emqx.io";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_CLIENT_ID: &str = "esp32cam";
pub const DEFAULT_UPLOAD_URL: &str = "http://127.0.0.1:8080/mqtt/cam/upload";

/// Longest client id. It is repeated in every topic and in the status and
/// climate messages, which must stay within their capacities.
pub const MAX_CLIENT_ID_BYTES: usize = 32;

/// Longest broker host name.
pub const MAX_SERVER_BYTES: usize = 64;

/// A client id usable as one MQTT topic level: `[A-Za-z0-9_-]`, no
/// separators or wildcards.
pub fn valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CLIENT_ID_BYTES
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A host name or IPv4 address.
pub fn valid_server(server: &str) -> bool {
    !server.is_empty()
        && server.len() <= MAX_SERVER_BYTES
        && server
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

/// Network and upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_server: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub upload_url: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: DEFAULT_WIFI_SSID.to_string(),
            wifi_password: String::new(),
            mqtt_server: DEFAULT_MQTT_SERVER.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
        }
    }
}

impl DeviceConfig {
    /// Copy with the WiFi password masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.wifi_password.is_empty() {
            copy.wifi_password = "********".to_string();
        }
        copy
    }
}

/// Loads the device config at boot and applies changes to it.
///
/// WiFi and MQTT changes are persisted only; the running values change after
/// the restart that follows them. The upload URL applies immediately.
pub struct ConfigStore {
    store: Arc<dyn KvStore>,
    current: DeviceConfig,
}

impl ConfigStore {
    /// Load every key, falling back to its default when absent, mistyped or
    /// unreadable.
    pub fn load(store: Arc<dyn KvStore>) -> Self {
        let defaults = DeviceConfig::default();
        let reader = Reader {
            store: store.as_ref(),
        };

        let current = DeviceConfig {
            wifi_ssid: reader.string(keys::WIFI_SSID, defaults.wifi_ssid),
            wifi_password: reader.string(keys::WIFI_PASSWORD, defaults.wifi_password),
            mqtt_server: reader.checked(keys::MQTT_SERVER, defaults.mqtt_server, valid_server),
            mqtt_port: reader.port(keys::MQTT_PORT, defaults.mqtt_port),
            mqtt_client_id: reader.checked(
                keys::MQTT_CLIENT_ID,
                defaults.mqtt_client_id,
                valid_client_id,
            ),
            upload_url: reader.string(keys::UPLOAD_URL, defaults.upload_url),
        };

        tracing::info!(
            mqtt_server = %current.mqtt_server,
            mqtt_port = current.mqtt_port,
            client_id = %current.mqtt_client_id,
            "Device config loaded"
        );

        Self { store, current }
    }

    /// The running configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.current
    }

    pub fn save_wifi(&mut self, ssid: &str, password: &str) -> Result<(), StoreError> {
        self.store.put(
            NAMESPACE,
            &[
                (keys::WIFI_SSID, ssid.into()),
                (keys::WIFI_PASSWORD, password.into()),
            ],
        )
    }

    pub fn save_mqtt(&mut self, server: &str, port: u16, client_id: &str) -> Result<(), StoreError> {
        self.store.put(
            NAMESPACE,
            &[
                (keys::MQTT_SERVER, server.into()),
                (keys::MQTT_PORT, i64::from(port).into()),
                (keys::MQTT_CLIENT_ID, client_id.into()),
            ],
        )
    }

    pub fn save_upload_url(&mut self, url: &str) -> Result<(), StoreError> {
        self.store
            .put(NAMESPACE, &[(keys::UPLOAD_URL, url.into())])?;
        self.current.upload_url = url.to_string();
        Ok(())
    }

    /// Erase every persisted setting. Defaults apply after the restart.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.store.clear(NAMESPACE)
    }
}

struct Reader<'a> {
    store: &'a dyn KvStore,
}

impl Reader<'_> {
    fn value(&self, key: &str) -> Option<StoredValue> {
        match self.store.get(NAMESPACE, key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read setting, using default");
                None
            }
        }
    }

    fn string(&self, key: &str, default: String) -> String {
        match self.value(key) {
            Some(StoredValue::Str(s)) => s,
            Some(StoredValue::Int(_)) => {
                tracing::warn!(key = %key, "Setting has wrong type, using default");
                default
            }
            None => default,
        }
    }

    fn checked(&self, key: &str, default: String, valid: fn(&str) -> bool) -> String {
        let value = self.string(key, default.clone());
        if valid(&value) {
            value
        } else {
            tracing::warn!(key = %key, "Stored setting is not usable, using default");
            default
        }
    }

    fn port(&self, key: &str, default: u16) -> u16 {
        match self.value(key).as_ref().and_then(StoredValue::as_int) {
            Some(n) => match u16::try_from(n) {
                Ok(port) if port != 0 => port,
                _ => {
                    tracing::warn!(key = %key, value = n, "Stored port out of range, using default");
                    default
                }
            },
            None => default,
        }
    }
}
