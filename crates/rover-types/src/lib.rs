//! `rover-types` – shared wire and domain types for the rover bridge.
//!
//! Every other crate in the workspace speaks in these types: the
//! [`Envelope`] exchanged with the operator, the normalised
//! [`MotorCommand`] applied to the drive base, the outbound
//! [`TelemetryFrame`], and the single [`RoverError`] taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message type of an inbound differential-drive command.
pub const MOTOR_CMD: &str = "motor_cmd";

/// Message type of an outbound camera frame.
pub const CAMERA_FRAME: &str = "camera_frame";

// ────────────────────────────────────────────────────────────────────────────
// Envelope
// ────────────────────────────────────────────────────────────────────────────

/// A tagged message exchanged over the wire: `{"type": ..., ...fields}`.
///
/// The `type` tag is held in [`Envelope::kind`]; every other top-level key of
/// the JSON object lives in [`Envelope::fields`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope of the given type with no payload fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Attach a payload field (builder-style).
    ///
    /// A `"type"` key is ignored; the tag is always [`Envelope::kind`].
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Parse one wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::MalformedMessage`] when the frame is not JSON,
    /// is not a JSON object, or has no string `type` field.
    pub fn parse(frame: &str) -> Result<Self, RoverError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| RoverError::MalformedMessage(format!("invalid JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(RoverError::MalformedMessage(
                "envelope must be a JSON object".to_string(),
            ));
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(RoverError::MalformedMessage(format!(
                    "`type` must be a string, got {other}"
                )));
            }
            None => {
                return Err(RoverError::MalformedMessage(
                    "missing `type` field".to_string(),
                ));
            }
        };
        Ok(Self { kind, fields })
    }

    /// Serialise to a single wire frame.
    pub fn to_json(&self) -> Result<String, RoverError> {
        serde_json::to_string(self).map_err(|e| RoverError::Serialization(e.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motor command
// ────────────────────────────────────────────────────────────────────────────

/// Normalised differential-drive command. Both sides are always within
/// `[-1.0, 1.0]`; negative values drive in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotorCommand {
    pub left: f32,
    pub right: f32,
}

impl MotorCommand {
    /// The safe idle output.
    pub const STOP: Self = Self {
        left: 0.0,
        right: 0.0,
    };

    /// Build a command, clamping each side to `[-1.0, 1.0]`.
    pub fn new(left: f32, right: f32) -> Self {
        Self {
            left: left.clamp(-1.0, 1.0),
            right: right.clamp(-1.0, 1.0),
        }
    }

    /// Extract a command from a `motor_cmd` envelope.
    ///
    /// Missing `left_motor` / `right_motor` fields default to `0.0`.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::MalformedMessage`] when a field is present but
    /// is not a number.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, RoverError> {
        let left = motor_field(envelope, "left_motor")?;
        let right = motor_field(envelope, "right_motor")?;
        Ok(Self::new(left, right))
    }

    /// Encode as a `motor_cmd` envelope.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(MOTOR_CMD)
            .with_field("left_motor", f64::from(self.left))
            .with_field("right_motor", f64::from(self.right))
    }

    pub fn is_stop(&self) -> bool {
        self.left == 0.0 && self.right == 0.0
    }
}

fn motor_field(envelope: &Envelope, key: &str) -> Result<f32, RoverError> {
    match envelope.field(key) {
        None | Some(Value::Null) => Ok(0.0),
        Some(value) => value
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| {
                RoverError::MalformedMessage(format!("`{key}` must be a number, got {value}"))
            }),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry
// ────────────────────────────────────────────────────────────────────────────

/// One outbound camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Capture time, UTC seconds since the Unix epoch.
    pub timestamp: f64,
    /// Monotonically increasing frame counter, starting at 0.
    pub seq: u64,
    /// Base64-encoded image bytes.
    pub data: String,
}

impl TelemetryFrame {
    pub fn into_envelope(self) -> Envelope {
        Envelope::new(CAMERA_FRAME)
            .with_field("timestamp", self.timestamp)
            .with_field("seq", self.seq)
            .with_field("data", self.data)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection state
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of the single operator link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type spanning transport failures, bad input, and driver faults.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoverError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Malformed Message: {0}")]
    MalformedMessage(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Shutdown in progress")]
    Shutdown,
}

impl RoverError {
    /// Shorthand for a [`RoverError::HardwareFault`].
    pub fn hardware(component: impl Into<String>, details: impl Into<String>) -> Self {
        RoverError::HardwareFault {
            component: component.into(),
            details: details.into(),
        }
    }
}
