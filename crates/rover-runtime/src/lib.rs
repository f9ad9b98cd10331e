//! `rover-runtime` – The Supervisor
//!
//! Wires the link, the router, the controllers and the sensors together and
//! owns their lifetimes.
//!
//! # Modules
//!
//! - [`supervisor`] – [`BridgeBuilder`] collects every controller and sensor
//!   up front; [`BridgeSupervisor`] starts them in order and runs the
//!   shutdown sequence (stop intake, drive actuators safe, release drivers,
//!   close the link).
//! - [`health`] – a minimal HTTP liveness endpoint (`GET /health`).
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod health;
pub mod supervisor;
pub mod telemetry;

pub use supervisor::{BridgeBuilder, BridgeSupervisor, SHUTDOWN_GRACE};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
