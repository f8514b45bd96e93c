//! Actuator, sensor and system capabilities.
//!
//! Drivers implement the traits; [`Outputs`] keeps [`DeviceState`] in step
//! with what was written to them.

use std::sync::Arc;
use std::time::Duration;

use crate::state::{Climate, DeviceState};

/// Servo pulse width at 0 degrees, in microseconds.
pub const SERVO_MIN_PULSE_US: u32 = 500;
/// Servo pulse width at 180 degrees, in microseconds.
pub const SERVO_MAX_PULSE_US: u32 = 2500;
/// Servo PWM period (50 Hz), in microseconds.
pub const SERVO_PERIOD_US: u32 = 20_000;
/// Servo PWM resolution (12 bit).
pub const SERVO_DUTY_STEPS: u32 = 4096;

pub const SERVO_MAX_ANGLE: u8 = 180;

/// Output drivers.
pub trait Actuators: Send + Sync {
    /// Flash LED PWM duty, 0 is off.
    fn set_led_duty(&self, duty: u8);

    /// Red indicator LED.
    fn set_red_led(&self, on: bool);

    /// Servo PWM duty in [`SERVO_DUTY_STEPS`] units.
    fn set_servo_duty(&self, duty: u32);

    /// Fan relay.
    fn set_relay(&self, on: bool);
}

/// Input drivers.
pub trait Sensors: Send + Sync {
    /// Temperature and humidity, `None` when the read failed.
    fn read_climate(&self) -> Option<Climate>;

    /// Digital light sensor output, `true` when dark.
    fn read_light_dark(&self) -> bool;
}

/// Runtime counters of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSnapshot {
    pub uptime: Duration,
    pub free_heap: u64,
    pub rssi: i32,
    pub ip: String,
}

pub trait SystemProbe: Send + Sync {
    fn snapshot(&self) -> SystemSnapshot;
}

/// PWM duty for a servo angle (clamped to 0..=180).
pub fn servo_duty(angle: u8) -> u32 {
    let angle = u32::from(angle.min(SERVO_MAX_ANGLE));
    let pulse = SERVO_MIN_PULSE_US
        + angle * (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US) / u32::from(SERVO_MAX_ANGLE);
    pulse * SERVO_DUTY_STEPS / SERVO_PERIOD_US
}

/// Window position implied by a servo angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    FullyOpen,
    HalfOpen,
    SlightlyOpen,
    Closed,
    Custom,
}

impl WindowState {
    pub fn from_angle(angle: u8) -> Self {
        match angle {
            170..=u8::MAX => WindowState::FullyOpen,
            80..=100 => WindowState::HalfOpen,
            35..=55 => WindowState::SlightlyOpen,
            0..=10 => WindowState::Closed,
            _ => WindowState::Custom,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WindowState::FullyOpen => "fully open",
            WindowState::HalfOpen => "half open",
            WindowState::SlightlyOpen => "slightly open",
            WindowState::Closed => "closed",
            WindowState::Custom => "custom",
        }
    }
}

impl std::fmt::Display for WindowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes actuators and records the result in [`DeviceState`].
#[derive(Clone)]
pub struct Outputs {
    actuators: Arc<dyn Actuators>,
}

impl Outputs {
    pub fn new(actuators: Arc<dyn Actuators>) -> Self {
        Self { actuators }
    }

    /// Drive every output to its boot position.
    pub fn init(&self, state: &mut DeviceState) {
        self.led(state, false);
        self.red_led(state, false);
        self.servo(state, 0);
        self.relay(state, false);
    }

    /// Switch the flash LED, keeping the stored brightness.
    pub fn led(&self, state: &mut DeviceState, on: bool) {
        state.led_on = on;
        self.actuators
            .set_led_duty(if on { state.led_brightness } else { 0 });
    }

    /// Set the flash brightness (clamped to 0..=255). Takes effect at once
    /// only while the LED is on.
    pub fn led_brightness(&self, state: &mut DeviceState, requested: i64) -> u8 {
        let brightness = requested.clamp(0, i64::from(u8::MAX)) as u8;
        state.led_brightness = brightness;
        if state.led_on {
            self.actuators.set_led_duty(brightness);
        }
        brightness
    }

    pub fn red_led(&self, state: &mut DeviceState, on: bool) {
        state.red_led_on = on;
        self.actuators.set_red_led(on);
    }

    /// Move the servo (clamped to 0..=180), returning the angle applied.
    pub fn servo(&self, state: &mut DeviceState, requested: i64) -> u8 {
        let angle = requested.clamp(0, i64::from(SERVO_MAX_ANGLE)) as u8;
        state.servo_angle = angle;
        self.actuators.set_servo_duty(servo_duty(angle));
        angle
    }

    pub fn relay(&self, state: &mut DeviceState, on: bool) {
        state.relay_on = on;
        self.actuators.set_relay(on);
    }
}
