//! [`MotorController`] – drive-base controller with a safety watchdog.
//!
//! The controller separates *what was last commanded* from *what the motors
//! are doing*:
//!
//! * [`Controller::handle_command`] (network path) only stores the new
//!   command and its arrival time in the [`CommandRecord`].
//! * [`MotorController::tick`] (watchdog path, every
//!   [`WatchdogPolicy::period`]) is the only steady-state writer of the
//!   driver. It re-applies the stored command while it is fresh and applies
//!   [`MotorCommand::STOP`] once no command has arrived for
//!   [`WatchdogPolicy::idle_timeout`].
//!
//! A dropped operator link therefore halts the rover within one idle
//! timeout plus one tick, without any cooperation from the network code.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rover_hal::MotorDriver;
use rover_types::{Envelope, MOTOR_CMD, MotorCommand, RoverError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::watchdog::{self, CommandRecord, DriveState, WatchdogPolicy};

/// Command applied by [`Controller::test`] when no envelope is given.
pub const TEST_COMMAND: MotorCommand = MotorCommand {
    left: 0.5,
    right: 0.5,
};

/// Actuator controller for the differential drive base.
pub struct MotorController<D: MotorDriver> {
    name: String,
    policy: WatchdogPolicy,
    record: Mutex<CommandRecord>,
    driver: Mutex<D>,
    drive_state: Mutex<Option<DriveState>>,
    cleaned_up: AtomicBool,
}

impl<D: MotorDriver> MotorController<D> {
    /// Wrap `driver` with the default watchdog timing.
    pub fn new(driver: D) -> Self {
        Self {
            name: "MotorController".to_string(),
            policy: WatchdogPolicy::default(),
            record: Mutex::new(CommandRecord::empty()),
            driver: Mutex::new(driver),
            drive_state: Mutex::new(None),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Override the controller name (builder-style).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the watchdog timing (builder-style).
    pub fn with_policy(mut self, policy: WatchdogPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> WatchdogPolicy {
        self.policy
    }

    /// Snapshot of the command record.
    pub fn record(&self) -> CommandRecord {
        *self.record.lock()
    }

    /// State chosen by the most recent tick; `None` before the first tick.
    pub fn drive_state(&self) -> Option<DriveState> {
        *self.drive_state.lock()
    }

    /// Store `command` as the latest command, stamped with the current time.
    pub fn set_command(&self, command: MotorCommand) {
        self.record.lock().update(command, Instant::now());
    }

    /// Run one watchdog evaluation and drive the result.
    ///
    /// After [`Controller::cleanup`] this no longer touches the driver.
    pub fn tick(&self) -> DriveState {
        if self.cleaned_up.load(Ordering::Acquire) {
            return DriveState::IdleTimeout;
        }

        let snapshot = self.record();
        let (command, state) = snapshot.evaluate(Instant::now(), self.policy.idle_timeout);

        if let Err(e) = self.driver.lock().apply(command) {
            warn!(controller = %self.name, error = %e, "failed to drive motors");
        }

        let previous = self.drive_state.lock().replace(state);
        if previous != Some(state) {
            match state {
                DriveState::IdleTimeout => warn!(
                    controller = %self.name,
                    timeout_ms = self.policy.idle_timeout.as_millis() as u64,
                    "no fresh command; motors stopped"
                ),
                DriveState::Commanded => info!(
                    controller = %self.name,
                    left = command.left,
                    right = command.right,
                    "command stream active"
                ),
            }
        }
        state
    }
}

#[async_trait]
impl<D: MotorDriver + 'static> Controller for MotorController<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> &str {
        MOTOR_CMD
    }

    fn handle_command(&self, envelope: &Envelope) -> Result<(), RoverError> {
        if envelope.kind != MOTOR_CMD {
            return Ok(());
        }
        let command = MotorCommand::from_envelope(envelope)?;
        debug!(
            controller = %self.name,
            left = format_args!("{:.2}", command.left),
            right = format_args!("{:.2}", command.right),
            "set command"
        );
        self.set_command(command);
        Ok(())
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!(
            controller = %self.name,
            period_ms = self.policy.period.as_millis() as u64,
            "watchdog started"
        );
        watchdog::run_fixed_period(self.policy.period, shutdown, || {
            self.tick();
        })
        .await;
        info!(controller = %self.name, "watchdog stopped");
    }

    fn test(&self, envelope: Option<&Envelope>) -> Result<(), RoverError> {
        let command = match envelope {
            Some(envelope) => MotorCommand::from_envelope(envelope)?,
            None => TEST_COMMAND,
        };
        info!(
            controller = %self.name,
            left = command.left,
            right = command.right,
            "testing motors"
        );
        self.driver.lock().apply(command)
    }

    fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut driver = self.driver.lock();
        if let Err(e) = driver.stop() {
            warn!(controller = %self.name, error = %e, "failed to stop motors during cleanup");
        }
        if let Err(e) = driver.release() {
            warn!(controller = %self.name, error = %e, "failed to release motor driver");
        }
        info!(controller = %self.name, driver = driver.id(), "motors stopped and released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_hal::sim::{SimMotorDriver, SimMotorProbe};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time;

    fn make_controller() -> (MotorController<SimMotorDriver>, SimMotorProbe) {
        let (driver, probe) = SimMotorDriver::new("drive_base");
        (MotorController::new(driver), probe)
    }

    fn motor_cmd(left: f64, right: f64) -> Envelope {
        Envelope::new(MOTOR_CMD)
            .with_field("left_motor", left)
            .with_field("right_motor", right)
    }

    #[tokio::test(start_paused = true)]
    async fn command_then_silence_drives_then_stops() {
        let (controller, probe) = make_controller();
        controller.handle_command(&motor_cmd(0.8, -0.5)).unwrap();

        time::advance(Duration::from_millis(100)).await;
        assert_eq!(controller.tick(), DriveState::Commanded);
        assert_eq!(probe.last_output(), MotorCommand::new(0.8, -0.5));

        time::advance(Duration::from_millis(200)).await;
        assert_eq!(controller.tick(), DriveState::IdleTimeout);
        assert_eq!(probe.last_output(), MotorCommand::STOP);
    }

    #[tokio::test(start_paused = true)]
    async fn command_stays_in_effect_up_to_timeout() {
        let (controller, probe) = make_controller();
        controller.handle_command(&motor_cmd(0.3, 0.3)).unwrap();

        time::advance(Duration::from_millis(200)).await;
        assert_eq!(controller.tick(), DriveState::Commanded);
        assert_eq!(probe.last_output(), MotorCommand::new(0.3, 0.3));

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(controller.tick(), DriveState::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_command_extends_the_deadline() {
        let (controller, probe) = make_controller();
        controller.handle_command(&motor_cmd(0.3, 0.3)).unwrap();
        time::advance(Duration::from_millis(150)).await;
        controller.handle_command(&motor_cmd(-0.6, 0.6)).unwrap();
        time::advance(Duration::from_millis(150)).await;

        assert_eq!(controller.tick(), DriveState::Commanded);
        assert_eq!(probe.last_output(), MotorCommand::new(-0.6, 0.6));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_before_any_command() {
        let (controller, probe) = make_controller();
        assert_eq!(controller.drive_state(), None);
        assert_eq!(controller.tick(), DriveState::IdleTimeout);
        assert!(probe.last_output().is_stop());
        assert_eq!(controller.drive_state(), Some(DriveState::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_command_never_drives_hardware() {
        let (controller, probe) = make_controller();
        controller.handle_command(&motor_cmd(1.0, 1.0)).unwrap();
        controller.handle_command(&motor_cmd(0.5, 0.5)).unwrap();
        assert_eq!(probe.apply_count(), 0);
        assert_eq!(controller.record().last_command(), MotorCommand::new(0.5, 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn other_message_types_are_ignored() {
        let (controller, _probe) = make_controller();
        controller
            .handle_command(&Envelope::new("camera_frame").with_field("left_motor", 1.0))
            .unwrap();
        assert!(controller.record().last_update().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_command_leaves_record_untouched() {
        let (controller, _probe) = make_controller();
        controller.handle_command(&motor_cmd(0.2, 0.2)).unwrap();
        let before = controller.record();

        let bad = Envelope::new(MOTOR_CMD).with_field("left_motor", "full speed");
        assert!(controller.handle_command(&bad).is_err());

        let after = controller.record();
        assert_eq!(after.last_command(), before.last_command());
        assert_eq!(after.last_update(), before.last_update());
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_commands_are_clamped() {
        let (controller, probe) = make_controller();
        controller.handle_command(&motor_cmd(2.5, -9.0)).unwrap();
        controller.tick();
        assert_eq!(probe.last_output(), MotorCommand::new(1.0, -1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_loop_scenario() {
        let (driver, probe) = SimMotorDriver::new("drive_base");
        let controller = Arc::new(MotorController::new(driver));
        let token = CancellationToken::new();

        controller.handle_command(&motor_cmd(0.8, -0.5)).unwrap();
        let handle = {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            tokio::spawn(async move { controller.run(token).await })
        };

        // Last tick at t=0.1 re-applied the command.
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(probe.last_output(), MotorCommand::new(0.8, -0.5));

        // Tick at t=0.3 saw a 0.3 s old command.
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.last_output(), MotorCommand::STOP);
        assert_eq!(controller.drive_state(), Some(DriveState::IdleTimeout));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_keeps_driving_at_fixed_cadence() {
        let (driver, probe) = SimMotorDriver::new("drive_base");
        let controller = Arc::new(MotorController::new(driver));
        let token = CancellationToken::new();
        let handle = {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            tokio::spawn(async move { controller.run(token).await })
        };

        // Commands every 50 ms for one second: output never drops to zero.
        for _ in 0..20 {
            controller.handle_command(&motor_cmd(0.4, 0.4)).unwrap();
            time::sleep(Duration::from_millis(50)).await;
        }
        token.cancel();
        handle.await.unwrap();

        let history = probe.history();
        assert!(history.len() >= 10, "expected ~10 ticks, got {}", history.len());
        assert!(history.iter().skip(1).all(|c| *c == MotorCommand::new(0.4, 0.4)));
    }

    #[tokio::test]
    async fn test_applies_directly_and_defaults_to_half_speed() {
        let (controller, probe) = make_controller();
        controller.test(None).unwrap();
        assert_eq!(probe.last_output(), TEST_COMMAND);

        controller.test(Some(&motor_cmd(-0.2, 0.1))).unwrap();
        assert_eq!(probe.last_output(), MotorCommand::new(-0.2, 0.1));
        assert!(controller.record().last_update().is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (controller, probe) = make_controller();
        controller.test(None).unwrap();

        controller.cleanup();
        controller.cleanup();

        assert!(probe.last_output().is_stop());
        assert_eq!(probe.stop_count(), 1);
        assert_eq!(probe.release_count(), 1);
        assert!(probe.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_after_cleanup_does_not_drive() {
        let (controller, probe) = make_controller();
        controller.handle_command(&motor_cmd(0.9, 0.9)).unwrap();
        controller.cleanup();
        let applied = probe.apply_count();

        controller.tick();
        assert_eq!(probe.apply_count(), applied);
        assert!(probe.last_output().is_stop());
    }
}
