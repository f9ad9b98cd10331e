//! Bridge configuration – reads `rover.toml` (or `$ROVER_CONFIG`).
//!
//! Only `server_uri` is required; every other field has a default. The
//! required field may come from the environment instead of the file, so a
//! missing file is not an error by itself.

use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rover_hal::HBridgePins;
use rover_kernel::WatchdogPolicy;
use rover_middleware::{Keepalive, MalformedFramePolicy};
use rover_types::RoverError;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ROVER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "rover.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Operator endpoint, `ws://` or `wss://`.
    #[serde(default)]
    pub server_uri: String,

    #[serde(default = "default_health_port")]
    pub health_port: u16,

    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    /// Inbound silence, in seconds, before the operator is pinged.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,

    /// Seconds a ping may go unanswered, or a write may stall, before the
    /// link is dropped and re-established.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_timeout_secs: u64,

    #[serde(default)]
    pub malformed_frames: MalformedFramePolicy,

    #[serde(default)]
    pub motor: MotorConfig,

    #[serde(default)]
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// H-bridge wiring, BCM numbering.
    #[serde(default)]
    pub pins: HBridgePins,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
}

fn default_health_port() -> u16 {
    5000
}
fn default_reconnect_backoff_secs() -> u64 {
    5
}
fn default_keepalive_secs() -> u64 {
    20
}
fn default_watchdog_period_ms() -> u64 {
    100
}
fn default_idle_timeout_ms() -> u64 {
    200
}
fn default_true() -> bool {
    true
}
fn default_fps() -> u32 {
    10
}
fn default_warmup_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            health_port: default_health_port(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            keepalive_interval_secs: default_keepalive_secs(),
            keepalive_timeout_secs: default_keepalive_secs(),
            malformed_frames: MalformedFramePolicy::default(),
            motor: MotorConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            watchdog_period_ms: default_watchdog_period_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            pins: HBridgePins::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: default_fps(),
            warmup_ms: default_warmup_ms(),
        }
    }
}

impl Config {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            interval: Duration::from_secs(self.keepalive_interval_secs),
            timeout: Duration::from_secs(self.keepalive_timeout_secs),
        }
    }

    pub fn watchdog_policy(&self) -> WatchdogPolicy {
        WatchdogPolicy {
            period: Duration::from_millis(self.motor.watchdog_period_ms),
            idle_timeout: Duration::from_millis(self.motor.idle_timeout_ms),
        }
    }

    /// Configured frame rate; zero is caught by [`Config::validate_hardware`].
    pub fn camera_fps(&self) -> NonZeroU32 {
        NonZeroU32::new(self.camera.fps).unwrap_or(NonZeroU32::MIN)
    }

    pub fn camera_warmup(&self) -> Duration {
        Duration::from_millis(self.camera.warmup_ms)
    }

    /// Check everything the bridge needs, including the operator endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), RoverError> {
        let uri = self.server_uri.trim();
        if uri.is_empty() {
            return Err(RoverError::Config(
                "server_uri is required (set it in the config file or ROVER_SERVER_URI)".to_string(),
            ));
        }
        if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
            return Err(RoverError::Config(format!(
                "server_uri must be a ws:// or wss:// URL, got {uri:?}"
            )));
        }
        if self.keepalive_interval_secs == 0 || self.keepalive_timeout_secs == 0 {
            return Err(RoverError::Config(
                "keepalive_interval_secs and keepalive_timeout_secs must be greater than zero"
                    .to_string(),
            ));
        }
        self.validate_hardware()
    }

    /// Check only the motor and camera settings; enough for the diagnostic
    /// sub-commands, which never connect.
    pub fn validate_hardware(&self) -> Result<(), RoverError> {
        if self.motor.watchdog_period_ms == 0 {
            return Err(RoverError::Config(
                "motor.watchdog_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.motor.idle_timeout_ms < self.motor.watchdog_period_ms {
            return Err(RoverError::Config(format!(
                "motor.idle_timeout_ms ({}) must be at least one watchdog period ({})",
                self.motor.idle_timeout_ms, self.motor.watchdog_period_ms
            )));
        }
        if self.camera.fps == 0 {
            return Err(RoverError::Config(
                "camera.fps must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Path of the config file: `$ROVER_CONFIG`, else `./rover.toml`.
pub fn config_path() -> PathBuf {
    config_path_with(|key| std::env::var(key).ok())
}

fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    env(CONFIG_ENV)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the config file and apply `ROVER_*` overrides. Not validated.
pub fn load() -> Result<Config, RoverError> {
    load_with(&config_path(), |key| std::env::var(key).ok())
}

pub(crate) fn load_with(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, RoverError> {
    let mut cfg = read_file(path)?.unwrap_or_default();
    apply_overrides(&mut cfg, env);
    Ok(cfg)
}

/// Parse `path`. Returns `None` if it does not exist.
pub(crate) fn read_file(path: &Path) -> Result<Option<Config>, RoverError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| RoverError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| RoverError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply environment overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROVER_SERVER_URI` | `server_uri` |
/// | `ROVER_HEALTH_PORT` | `health_port` (ignored unless a valid port) |
pub(crate) fn apply_overrides(cfg: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(uri) = env("ROVER_SERVER_URI") {
        cfg.server_uri = uri;
    }
    if let Some(v) = env("ROVER_HEALTH_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.health_port = port;
    }
}
