//! Command record and safety-watchdog timing.
//!
//! The network path writes a [`CommandRecord`] whenever a command arrives.
//! A fixed-period loop reads it on every tick and asks
//! [`CommandRecord::evaluate`] what to drive: the stored command while it is
//! fresh, the zero command once it has gone stale.
//!
//! Timestamps come from [`tokio::time::Instant`] so the whole state machine
//! can be exercised under a paused test clock.

use std::time::Duration;

use rover_types::MotorCommand;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default watchdog tick period.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(100);

/// Default age after which a command is considered stale.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogPolicy {
    /// Interval between watchdog ticks.
    pub period: Duration,
    /// A command older than this is replaced by the zero command.
    pub idle_timeout: Duration,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            period: DEFAULT_TICK_PERIOD,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// What the watchdog decided to drive on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    /// A fresh command is being re-applied.
    Commanded,
    /// No fresh command; the zero command is being applied.
    IdleTimeout,
}

/// Latest command plus the instant it arrived.
///
/// Both fields are always replaced together.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRecord {
    last_command: MotorCommand,
    last_update: Option<Instant>,
}

impl CommandRecord {
    /// A record that has never seen a command. Evaluates to idle.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn update(&mut self, command: MotorCommand, at: Instant) {
        *self = Self {
            last_command: command,
            last_update: Some(at),
        };
    }

    pub fn last_command(&self) -> MotorCommand {
        self.last_command
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Decide the output for a tick at `now`.
    ///
    /// The stored command is kept while its age is at most `idle_timeout`;
    /// strictly older commands (and an empty record) yield
    /// [`MotorCommand::STOP`].
    pub fn evaluate(&self, now: Instant, idle_timeout: Duration) -> (MotorCommand, DriveState) {
        match self.last_update {
            Some(at) if now.saturating_duration_since(at) <= idle_timeout => {
                (self.last_command, DriveState::Commanded)
            }
            _ => (MotorCommand::STOP, DriveState::IdleTimeout),
        }
    }
}

/// Call `tick` every `period` until `shutdown` fires.
///
/// The first tick happens immediately. Late ticks are delayed rather than
/// bursted so the output cadence stays even after a stall. No tick runs once
/// cancellation has been observed.
pub async fn run_fixed_period<F>(period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut(),
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => tick(),
        }
    }
}
