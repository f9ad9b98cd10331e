//! In-process simulated drivers for CI and hosts without rover hardware.
//!
//! Each simulated driver records what it was asked to do in shared state so
//! tests can keep observing it after the driver has been moved into a
//! controller or sensor.
//!
//! # Example
//!
//! ```rust
//! use rover_hal::MotorDriver;
//! use rover_hal::sim::SimMotorDriver;
//! use rover_types::MotorCommand;
//!
//! let (mut driver, probe) = SimMotorDriver::new("drive_base");
//! driver.apply(MotorCommand::new(0.5, -0.5)).unwrap();
//! assert_eq!(probe.last_output(), MotorCommand::new(0.5, -0.5));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rover_types::{MotorCommand, RoverError};

use crate::actuator::MotorDriver;
use crate::camera::{Camera, CameraFrame};
use crate::hbridge::PinBackend;

// ────────────────────────────────────────────────────────────────────────────
// Motor driver
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimMotorState {
    history: Vec<MotorCommand>,
    last: MotorCommand,
    stops: usize,
    releases: usize,
    released: bool,
}

/// A simulated motor driver that records every applied command.
pub struct SimMotorDriver {
    id: String,
    state: Arc<Mutex<SimMotorState>>,
}

/// Read-only view of a [`SimMotorDriver`]'s recorded output.
#[derive(Clone)]
pub struct SimMotorProbe {
    state: Arc<Mutex<SimMotorState>>,
}

impl SimMotorDriver {
    /// Create a driver together with a probe onto its recorded state.
    pub fn new(id: impl Into<String>) -> (Self, SimMotorProbe) {
        let state = Arc::new(Mutex::new(SimMotorState::default()));
        let probe = SimMotorProbe {
            state: Arc::clone(&state),
        };
        (
            Self {
                id: id.into(),
                state,
            },
            probe,
        )
    }
}

impl MotorDriver for SimMotorDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, command: MotorCommand) -> Result<(), RoverError> {
        let mut state = self.state.lock();
        if state.released {
            return Err(RoverError::hardware(&self.id, "driver has been released"));
        }
        state.last = command;
        state.history.push(command);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RoverError> {
        let mut state = self.state.lock();
        state.stops += 1;
        state.last = MotorCommand::STOP;
        Ok(())
    }

    fn release(&mut self) -> Result<(), RoverError> {
        let mut state = self.state.lock();
        if !state.released {
            state.released = true;
            state.releases += 1;
        }
        Ok(())
    }
}

impl SimMotorProbe {
    /// The output currently held by the driver.
    pub fn last_output(&self) -> MotorCommand {
        self.state.lock().last
    }

    /// Every command passed to `apply`, oldest first.
    pub fn history(&self) -> Vec<MotorCommand> {
        self.state.lock().history.clone()
    }

    pub fn apply_count(&self) -> usize {
        self.state.lock().history.len()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().releases
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pin backend
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimPinState {
    configured: BTreeSet<u8>,
    levels: BTreeMap<u8, bool>,
    pwm: BTreeMap<u8, (u32, f32)>,
    releases: usize,
}

/// A simulated GPIO/PWM backend. Clones share the same pin state.
#[derive(Debug, Clone, Default)]
pub struct SimPins {
    state: Arc<Mutex<SimPinState>>,
}

impl SimPins {
    pub fn configured(&self) -> Vec<u8> {
        self.state.lock().configured.iter().copied().collect()
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.state.lock().levels.get(&pin).copied()
    }

    /// Current duty cycle of a running PWM pin.
    pub fn duty(&self, pin: u8) -> Option<f32> {
        self.state.lock().pwm.get(&pin).map(|(_, duty)| *duty)
    }

    pub fn pwm_frequency(&self, pin: u8) -> Option<u32> {
        self.state.lock().pwm.get(&pin).map(|(freq, _)| *freq)
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().releases
    }
}

impl PinBackend for SimPins {
    fn configure_output(&mut self, pin: u8) -> Result<(), RoverError> {
        self.state.lock().configured.insert(pin);
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), RoverError> {
        let mut state = self.state.lock();
        if !state.configured.contains(&pin) {
            return Err(RoverError::hardware(
                format!("gpio{pin}"),
                "write to unconfigured pin",
            ));
        }
        state.levels.insert(pin, high);
        Ok(())
    }

    fn start_pwm(&mut self, pin: u8, frequency_hz: u32) -> Result<(), RoverError> {
        self.state.lock().pwm.insert(pin, (frequency_hz, 0.0));
        Ok(())
    }

    fn set_duty_cycle(&mut self, pin: u8, percent: f32) -> Result<(), RoverError> {
        match self.state.lock().pwm.get_mut(&pin) {
            Some((_, duty)) => {
                *duty = percent.clamp(0.0, 100.0);
                Ok(())
            }
            None => Err(RoverError::hardware(
                format!("gpio{pin}"),
                "PWM not started",
            )),
        }
    }

    fn stop_pwm(&mut self, pin: u8) -> Result<(), RoverError> {
        self.state.lock().pwm.remove(&pin);
        Ok(())
    }

    fn release_all(&mut self) -> Result<(), RoverError> {
        let mut state = self.state.lock();
        state.configured.clear();
        state.levels.clear();
        state.pwm.clear();
        state.releases += 1;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

/// A simulated camera producing small, distinct JPEG-framed payloads.
pub struct SimCamera {
    id: String,
    started: bool,
    captured: u64,
}

impl SimCamera {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started: false,
            captured: 0,
        }
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self) -> Result<(), RoverError> {
        self.started = true;
        Ok(())
    }

    fn capture(&mut self) -> Result<CameraFrame, RoverError> {
        if !self.started {
            return Err(RoverError::hardware(&self.id, "camera not started"));
        }
        // SOI marker, frame counter, EOI marker.
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(&self.captured.to_be_bytes());
        data.extend_from_slice(&[0xFF, 0xD9]);
        self.captured += 1;
        Ok(CameraFrame {
            width: 640,
            height: 480,
            data,
        })
    }

    fn stop(&mut self) -> Result<(), RoverError> {
        self.started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_motor_records_history_and_release() {
        let (mut driver, probe) = SimMotorDriver::new("drive_base");
        driver.apply(MotorCommand::new(0.2, 0.4)).unwrap();
        driver.apply(MotorCommand::new(-0.2, 0.0)).unwrap();
        assert_eq!(probe.apply_count(), 2);
        assert_eq!(probe.last_output(), MotorCommand::new(-0.2, 0.0));

        driver.stop().unwrap();
        driver.release().unwrap();
        driver.release().unwrap();
        assert!(probe.last_output().is_stop());
        assert_eq!(probe.release_count(), 1);
        assert!(probe.is_released());
        assert!(driver.apply(MotorCommand::new(1.0, 1.0)).is_err());
    }

    #[test]
    fn sim_pins_reject_unconfigured_writes() {
        let mut pins = SimPins::default();
        assert!(pins.write(5, true).is_err());
        pins.configure_output(5).unwrap();
        pins.write(5, true).unwrap();
        assert_eq!(pins.level(5), Some(true));
    }

    #[test]
    fn sim_pins_duty_requires_running_pwm() {
        let mut pins = SimPins::default();
        assert!(pins.set_duty_cycle(18, 50.0).is_err());
        pins.start_pwm(18, 100).unwrap();
        pins.set_duty_cycle(18, 150.0).unwrap();
        assert_eq!(pins.duty(18), Some(100.0));
    }

    #[test]
    fn sim_camera_requires_start_and_yields_distinct_frames() {
        let mut cam = SimCamera::new("front_camera");
        assert!(cam.capture().is_err());

        cam.start().unwrap();
        let a = cam.capture().unwrap();
        let b = cam.capture().unwrap();
        assert_ne!(a.data, b.data);
        assert_eq!(&a.data[..2], &[0xFF, 0xD8]);
        assert_eq!(a.width, 640);
    }
}
