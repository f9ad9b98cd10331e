//! `rover-hal` – Hardware Abstraction Layer
//!
//! Narrow driver interfaces between the bridge and the physical rover.
//!
//! # Modules
//!
//! - [`actuator`] – the [`MotorDriver`] trait: applies a normalised
//!   [`MotorCommand`][rover_types::MotorCommand] to physical outputs.
//! - [`hbridge`] – [`HBridgeDriver`], a dual H-bridge motor driver written
//!   against a [`PinBackend`] so register access stays out of this crate.
//! - [`camera`] – the [`Camera`] trait for image-capture devices.
//! - [`sim`] – in-process stand-ins for every driver, used by tests and by
//!   hosts without GPIO hardware.

pub mod actuator;
pub mod camera;
pub mod hbridge;
pub mod sim;

pub use actuator::MotorDriver;
pub use camera::{Camera, CameraFrame};
pub use hbridge::{HBridgeDriver, HBridgePins, PinBackend};
