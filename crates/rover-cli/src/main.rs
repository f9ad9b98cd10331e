//! `rover` – rover command/telemetry bridge
//!
//! Connects the rover to its operator over WebSocket, drives the motors from
//! `motor_cmd` messages under a safety watchdog, and streams camera frames
//! back.
//!
//! ```text
//! rover [run]                 start the bridge (default)
//! rover test-motor [L R]      drive the motors once, hold 2 s, stop
//! rover test-camera           capture one frame and report its size
//! rover help                  show usage
//! ```
//!
//! No GPIO register backend ships with this binary: the H-bridge driver runs
//! on simulated pins and the camera is simulated.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use rover_hal::HBridgeDriver;
use rover_hal::sim::{SimCamera, SimPins};
use rover_kernel::{Controller, MotorController};
use rover_middleware::{CameraSensor, ConnectionManager, Sensor};
use rover_runtime::{BridgeBuilder, health};
use rover_types::{MotorCommand, RoverError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::Config;

/// How long `test-motor` holds its command before stopping.
const MOTOR_TEST_HOLD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Run,
    TestMotor { left: f32, right: f32 },
    TestCamera,
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self, String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            [] | ["run"] => Ok(Command::Run),
            ["test-motor"] => Ok(Command::TestMotor {
                left: 0.5,
                right: 0.5,
            }),
            ["test-motor", left, right] => Ok(Command::TestMotor {
                left: parse_speed(left)?,
                right: parse_speed(right)?,
            }),
            ["test-camera"] => Ok(Command::TestCamera),
            ["help" | "--help" | "-h"] => Ok(Command::Help),
            _ => Err(format!("unrecognised arguments: {}", args.join(" "))),
        }
    }
}

fn parse_speed(raw: &str) -> Result<f32, String> {
    raw.parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("motor speed must be a number in [-1, 1], got {raw:?}"))
}

fn main() -> ExitCode {
    let _tracing = rover_runtime::init_tracing("rover-bridge");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("{}: {msg}", "error".red().bold());
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    if command == Command::Help {
        print_usage();
        return ExitCode::SUCCESS;
    }

    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => return fail(&e),
    };
    let validated = match command {
        Command::Run => cfg.validate(),
        _ => cfg.validate_hardware(),
    };
    if let Err(e) = validated {
        return fail(&e);
    }
    println!(
        "  Config: {}",
        config::config_path().display().to_string().bold()
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fail(&RoverError::Config(format!("cannot start async runtime: {e}"))),
    };

    let outcome = runtime.block_on(async {
        match command {
            Command::Run => run_bridge(&cfg).await,
            Command::TestMotor { left, right } => test_motor(&cfg, left, right).await,
            Command::TestCamera => test_camera(&cfg).await,
            Command::Help => Ok(()),
        }
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn fail(e: &RoverError) -> ExitCode {
    error!(error = %e, "rover bridge failed");
    eprintln!("{}: {e}", "error".red().bold());
    ExitCode::FAILURE
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

async fn run_bridge(cfg: &Config) -> Result<(), RoverError> {
    let listener = health::bind(cfg.health_port).await?;

    let link = ConnectionManager::websocket(cfg.server_uri.trim())
        .with_backoff(cfg.reconnect_backoff())
        .with_keepalive(cfg.keepalive())
        .with_malformed_policy(cfg.malformed_frames);

    let mut builder = BridgeBuilder::new().controller(Arc::new(build_motor(cfg)?));
    if cfg.camera.enabled {
        builder = builder.sensor(Arc::new(build_camera(cfg)));
    } else {
        info!("camera disabled by configuration");
    }
    let mut bridge = builder.build(link);
    let shutdown = bridge.shutdown_token();
    install_signal_handler(shutdown.clone());

    let health = tokio::spawn(health::serve(listener, shutdown.clone()));

    println!(
        "  Connecting to {} …",
        cfg.server_uri.trim().cyan()
    );
    if bridge.start().await.is_ok() {
        println!("  {} Bridge running. Press Ctrl-C to stop.", "✓".green().bold());
        shutdown.cancelled().await;
    }

    bridge.shutdown().await;
    if let Err(e) = health.await {
        warn!(error = %e, "health endpoint task failed");
    }
    println!("  {} Motors stopped, link closed.", "✓".green().bold());
    Ok(())
}

async fn test_motor(cfg: &Config, left: f32, right: f32) -> Result<(), RoverError> {
    let motor = build_motor(cfg)?;
    let command = MotorCommand::new(left, right);

    let applied = motor.test(Some(&command.to_envelope()));
    if applied.is_ok() {
        println!(
            "  Driving left={:.2} right={:.2} for {}s …",
            command.left,
            command.right,
            MOTOR_TEST_HOLD.as_secs()
        );
        tokio::time::sleep(MOTOR_TEST_HOLD).await;
    }
    motor.cleanup();
    applied?;

    println!("  {} Motor test complete.", "✓".green().bold());
    Ok(())
}

async fn test_camera(cfg: &Config) -> Result<(), RoverError> {
    let camera = build_camera(cfg);
    let frame = camera.test().await;
    camera.cleanup();
    let frame = frame?;

    let encoded = frame
        .field("data")
        .and_then(|v| v.as_str())
        .map(str::len)
        .unwrap_or_default();
    info!(bytes_base64 = encoded, "camera test frame");
    println!(
        "  {} Captured frame ({:.1} KiB base64).",
        "✓".green().bold(),
        encoded as f64 / 1024.0
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Hardware
// ─────────────────────────────────────────────────────────────────────────────

fn build_motor(cfg: &Config) -> Result<MotorController<HBridgeDriver<SimPins>>, RoverError> {
    warn!("no GPIO backend on this host, H-bridge runs on simulated pins");
    let driver = HBridgeDriver::new("drive_base", cfg.motor.pins, SimPins::default())?;
    Ok(MotorController::new(driver).with_policy(cfg.watchdog_policy()))
}

fn build_camera(cfg: &Config) -> CameraSensor<SimCamera> {
    warn!("no camera backend on this host, using simulated camera");
    CameraSensor::new(SimCamera::new("front_camera"))
        .with_fps(cfg.camera_fps())
        .with_warmup(cfg.camera_warmup())
}

fn install_signal_handler(shutdown: CancellationToken) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Signal received – stopping the rover …".yellow().bold());
        shutdown.cancel();
    }) {
        warn!(error = %e, "failed to install signal handler; Ctrl-C will not stop the bridge cleanly");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}",
        "Rover Bridge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Operator link · motor watchdog · camera stream");
    println!();
}

fn print_usage() {
    println!("{}", "Usage:".bold());
    println!("  rover [run]              start the bridge");
    println!("  rover test-motor [L R]   drive motors at L/R (default 0.5 0.5) for 2s");
    println!("  rover test-camera        capture one frame");
    println!("  rover help               show this message");
    println!();
    println!("{}", "Environment:".bold());
    println!("  ROVER_CONFIG       config file (default ./rover.toml)");
    println!("  ROVER_SERVER_URI   operator endpoint, overrides server_uri");
    println!("  ROVER_HEALTH_PORT  health endpoint port, overrides health_port");
    println!("  ROVER_LOG_FORMAT   set to json for JSON logs");
}
