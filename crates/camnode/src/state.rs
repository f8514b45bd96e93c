//! In-memory device state.

use std::time::Duration;

/// Climate sensor sampling interval bounds, in milliseconds.
pub const DHT_INTERVAL_MIN_MS: u64 = 1_000;
pub const DHT_INTERVAL_MAX_MS: u64 = 60_000;
pub const DHT_INTERVAL_DEFAULT_MS: u64 = 5_000;

/// Status report interval bounds, in milliseconds.
pub const STATUS_INTERVAL_MIN_MS: u64 = 10_000;
pub const STATUS_INTERVAL_MAX_MS: u64 = 300_000;
pub const STATUS_INTERVAL_DEFAULT_MS: u64 = 60_000;

/// Flash LED brightness at boot.
pub const DEFAULT_LED_BRIGHTNESS: u8 = 128;

/// One temperature/humidity reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Relative humidity, percent.
    pub humidity: f32,
}

/// Telemetry intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    dht_ms: u64,
    status_ms: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            dht_ms: DHT_INTERVAL_DEFAULT_MS,
            status_ms: STATUS_INTERVAL_DEFAULT_MS,
        }
    }
}

impl Intervals {
    /// Set the climate interval, returning the clamped value stored.
    pub fn set_dht_ms(&mut self, requested: i64) -> u64 {
        self.dht_ms = clamp_ms(requested, DHT_INTERVAL_MIN_MS, DHT_INTERVAL_MAX_MS);
        self.dht_ms
    }

    /// Set the status interval, returning the clamped value stored.
    pub fn set_status_ms(&mut self, requested: i64) -> u64 {
        self.status_ms = clamp_ms(requested, STATUS_INTERVAL_MIN_MS, STATUS_INTERVAL_MAX_MS);
        self.status_ms
    }

    pub fn dht_ms(&self) -> u64 {
        self.dht_ms
    }

    pub fn status_ms(&self) -> u64 {
        self.status_ms
    }

    pub fn dht(&self) -> Duration {
        Duration::from_millis(self.dht_ms)
    }

    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }
}

fn clamp_ms(requested: i64, min: u64, max: u64) -> u64 {
    u64::try_from(requested).unwrap_or(0).clamp(min, max)
}

/// Actuator and sensor mirror, owned by the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub led_on: bool,
    pub led_brightness: u8,
    pub red_led_on: bool,
    pub servo_angle: u8,
    pub relay_on: bool,
    /// `true` when the light sensor reports darkness.
    pub light_dark: bool,
    /// Last successful climate reading.
    pub climate: Option<Climate>,
    pub intervals: Intervals,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            led_on: false,
            led_brightness: DEFAULT_LED_BRIGHTNESS,
            red_led_on: false,
            servo_angle: 0,
            relay_on: false,
            light_dark: false,
            climate: None,
            intervals: Intervals::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dht_interval_is_clamped() {
        let mut intervals = Intervals::default();
        assert_eq!(intervals.set_dht_ms(500), 1_000);
        assert_eq!(intervals.dht_ms(), 1_000);
        assert_eq!(intervals.set_dht_ms(120_000), 60_000);
        assert_eq!(intervals.set_dht_ms(2_500), 2_500);
        assert_eq!(intervals.set_dht_ms(-4), 1_000);
    }

    #[test]
    fn status_interval_is_clamped() {
        let mut intervals = Intervals::default();
        assert_eq!(intervals.set_status_ms(1), 10_000);
        assert_eq!(intervals.set_status_ms(999_999), 300_000);
        assert_eq!(intervals.status(), Duration::from_secs(300));
    }

    #[test]
    fn boot_state() {
        let state = DeviceState::default();
        assert!(!state.led_on);
        assert_eq!(state.led_brightness, 128);
        assert_eq!(state.intervals.dht_ms(), 5_000);
        assert_eq!(state.intervals.status_ms(), 60_000);
    }
}
