//! [`HBridgeDriver`] – dual H-bridge differential-drive driver.
//!
//! Each side of the rover is one H-bridge channel with two direction inputs
//! and one PWM enable input:
//!
//! | Value | IN_a | IN_b | Enable duty |
//! |---|---|---|---|
//! | `v >= 0` | high | low | `v * 100 %` |
//! | `v < 0` | low | high | `-v * 100 %` |
//!
//! Pin numbering and register access belong to the [`PinBackend`]; the
//! default [`HBridgePins`] map uses BCM numbering for the L298N wiring on the
//! rover's Raspberry Pi.

use rover_types::{MotorCommand, RoverError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actuator::MotorDriver;

/// Digital output and PWM primitives the driver is built on.
pub trait PinBackend: Send {
    /// Configure `pin` as a digital output.
    fn configure_output(&mut self, pin: u8) -> Result<(), RoverError>;

    /// Drive a configured output high or low.
    fn write(&mut self, pin: u8, high: bool) -> Result<(), RoverError>;

    /// Start PWM on `pin` at `frequency_hz` with a 0 % duty cycle.
    fn start_pwm(&mut self, pin: u8, frequency_hz: u32) -> Result<(), RoverError>;

    /// Change the duty cycle (percent, `0.0..=100.0`) of a running PWM pin.
    fn set_duty_cycle(&mut self, pin: u8, percent: f32) -> Result<(), RoverError>;

    /// Stop PWM on `pin`.
    fn stop_pwm(&mut self, pin: u8) -> Result<(), RoverError>;

    /// Return every pin to its power-on state.
    fn release_all(&mut self) -> Result<(), RoverError>;
}

/// Pin assignment for the two H-bridge channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HBridgePins {
    pub in1_left: u8,
    pub in2_left: u8,
    pub ena_left: u8,
    pub in3_right: u8,
    pub in4_right: u8,
    pub enb_right: u8,
    pub pwm_frequency_hz: u32,
}

impl Default for HBridgePins {
    fn default() -> Self {
        Self {
            in1_left: 17,
            in2_left: 27,
            ena_left: 18,
            in3_right: 23,
            in4_right: 22,
            enb_right: 24,
            pwm_frequency_hz: 100,
        }
    }
}

/// Direction levels and duty cycle for one channel.
///
/// Returns `(in_a_high, in_b_high, duty_percent)`.
pub fn channel_outputs(value: f32) -> (bool, bool, f32) {
    let value = value.clamp(-1.0, 1.0);
    let forward = value >= 0.0;
    (forward, !forward, value.abs() * 100.0)
}

/// Motor driver for a dual H-bridge.
pub struct HBridgeDriver<P: PinBackend> {
    id: String,
    pins: HBridgePins,
    backend: P,
    released: bool,
}

impl<P: PinBackend> HBridgeDriver<P> {
    /// Configure all six pins and start both PWM channels at 0 %.
    ///
    /// # Errors
    ///
    /// Propagates the first backend failure.
    pub fn new(id: impl Into<String>, pins: HBridgePins, mut backend: P) -> Result<Self, RoverError> {
        for pin in [
            pins.in1_left,
            pins.in2_left,
            pins.ena_left,
            pins.in3_right,
            pins.in4_right,
            pins.enb_right,
        ] {
            backend.configure_output(pin)?;
        }
        backend.start_pwm(pins.ena_left, pins.pwm_frequency_hz)?;
        backend.start_pwm(pins.enb_right, pins.pwm_frequency_hz)?;

        Ok(Self {
            id: id.into(),
            pins,
            backend,
            released: false,
        })
    }

    pub fn pins(&self) -> &HBridgePins {
        &self.pins
    }

    fn drive_channel(&mut self, in_a: u8, in_b: u8, enable: u8, value: f32) -> Result<(), RoverError> {
        let (a, b, duty) = channel_outputs(value);
        self.backend.write(in_a, a)?;
        self.backend.write(in_b, b)?;
        self.backend.set_duty_cycle(enable, duty)
    }
}

impl<P: PinBackend> MotorDriver for HBridgeDriver<P> {
    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, command: MotorCommand) -> Result<(), RoverError> {
        if self.released {
            return Err(RoverError::hardware(&self.id, "driver has been released"));
        }
        let pins = self.pins;
        self.drive_channel(pins.in1_left, pins.in2_left, pins.ena_left, command.left)?;
        self.drive_channel(pins.in3_right, pins.in4_right, pins.enb_right, command.right)
    }

    fn stop(&mut self) -> Result<(), RoverError> {
        if self.released {
            return Ok(());
        }
        self.backend.set_duty_cycle(self.pins.ena_left, 0.0)?;
        self.backend.set_duty_cycle(self.pins.enb_right, 0.0)
    }

    fn release(&mut self) -> Result<(), RoverError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Keep going after a PWM failure so the pins are still released.
        let mut first_err = None;
        for pin in [self.pins.ena_left, self.pins.enb_right] {
            if let Err(e) = self.backend.stop_pwm(pin) {
                warn!(driver = %self.id, pin, error = %e, "PWM stop error");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.backend.release_all() {
            first_err.get_or_insert(e);
        }
        debug!(driver = %self.id, "H-bridge released");
        first_err.map_or(Ok(()), Err)
    }
}
