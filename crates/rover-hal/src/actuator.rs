//! Generic `MotorDriver` trait for the rover's drive base.
//!
//! A driver only knows how to put a [`MotorCommand`] on its physical outputs.
//! It has no timing or concurrency of its own; the controller that owns it
//! decides when and how often a command is applied.

use rover_types::{MotorCommand, RoverError};

/// A differential-drive motor output stage.
pub trait MotorDriver: Send {
    /// Stable identifier for this driver, e.g. `"drive_base"`.
    fn id(&self) -> &str;

    /// Drive the outputs to `command`.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::HardwareFault`] if the command cannot be applied
    /// (e.g. the driver has already been released).
    fn apply(&mut self, command: MotorCommand) -> Result<(), RoverError>;

    /// Drive the outputs to the safe idle state.
    ///
    /// Must succeed on a driver that is already stopped or released.
    fn stop(&mut self) -> Result<(), RoverError> {
        self.apply(MotorCommand::STOP)
    }

    /// Release every hardware resource held by the driver.
    ///
    /// Calling this more than once is a no-op.
    fn release(&mut self) -> Result<(), RoverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Driver that only remembers the last command.
    struct MockDriver {
        last: MotorCommand,
        released: bool,
    }

    impl MotorDriver for MockDriver {
        fn id(&self) -> &str {
            "mock"
        }

        fn apply(&mut self, command: MotorCommand) -> Result<(), RoverError> {
            if self.released {
                return Err(RoverError::hardware("mock", "released"));
            }
            self.last = command;
            Ok(())
        }

        fn release(&mut self) -> Result<(), RoverError> {
            self.released = true;
            Ok(())
        }
    }

    #[test]
    fn default_stop_applies_zero_command() {
        let mut driver = MockDriver {
            last: MotorCommand::new(0.3, 0.3),
            released: false,
        };
        driver.stop().unwrap();
        assert!(driver.last.is_stop());
    }

    #[test]
    fn apply_after_release_is_a_fault() {
        let mut driver = MockDriver {
            last: MotorCommand::STOP,
            released: false,
        };
        driver.release().unwrap();
        let err = driver.apply(MotorCommand::new(1.0, 1.0)).unwrap_err();
        assert!(matches!(err, RoverError::HardwareFault { .. }));
    }
}
