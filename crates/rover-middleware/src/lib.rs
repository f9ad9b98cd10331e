//! `rover-middleware` – The Link
//!
//! Moves envelopes between the operator and the rover without caring what
//! they mean.
//!
//! # Modules
//!
//! - [`transport`] – the [`Connector`] seam and its WebSocket implementation
//!   built on `tokio-tungstenite`.
//! - [`connection`] – [`ConnectionManager`]: owns the single operator link,
//!   reconnects forever with a fixed backoff, pings a quiet link, serialises
//!   outbound frames, and runs the receive loop.
//! - [`router`] – [`CommandRouter`]: delivers each inbound envelope to the
//!   controllers registered for its `type`.
//! - [`sensor`] – the [`Sensor`] trait and [`CameraSensor`], which streams
//!   base64-encoded frames through the outbound path.
//! - [`sim`] – an in-memory loopback transport for tests.

pub mod connection;
pub mod router;
pub mod sensor;
pub mod sim;
pub mod transport;

pub use connection::{ConnectionManager, Keepalive, LinkStats, MalformedFramePolicy, Outbound};
pub use router::{CommandRouter, RouterBuilder};
pub use sensor::{CameraSensor, Sensor};
pub use transport::{Connector, Frame, FrameSink, FrameStream, WsConnector};
