//! `rover-kernel` – Actuator Safety
//!
//! Turns bursty, unreliable command arrival into a continuous, fail-safe
//! drive signal.
//!
//! # Modules
//!
//! - [`controller`] – the [`Controller`][controller::Controller] trait every
//!   actuator controller implements so the router and supervisor can treat
//!   them uniformly.
//! - [`watchdog`] – the [`CommandRecord`][watchdog::CommandRecord] shared
//!   between the network path and the safety loop, the
//!   [`WatchdogPolicy`][watchdog::WatchdogPolicy] timing, and the fixed-period
//!   tick driver.
//! - [`motor_controller`] – [`MotorController`][motor_controller::MotorController]:
//!   owns a [`MotorDriver`][rover_hal::MotorDriver] and is the only writer of
//!   its physical output.

pub mod controller;
pub mod motor_controller;
pub mod watchdog;

pub use controller::Controller;
pub use motor_controller::MotorController;
pub use watchdog::{CommandRecord, DriveState, WatchdogPolicy};
