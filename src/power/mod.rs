//! Display power, standby and shutdown
//!
//! [`PowerManager`] only runs the privileged commands for a transition.
//! The camera controller decides when a transition happens and records the
//! resulting [`PowerState`] in the settings store, so the state is always
//! the last one confirmed by a successful command.

pub mod battery;
pub mod hotspot;
pub mod system;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandBus, CommandSource};
use crate::config::PowerConfig;
use crate::error::ControlError;
use crate::settings::{PowerState, SettingsStore};
use system::SystemCommands;

/// One privileged display operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    MonitorOff,
    MonitorOn,
    StandbyEnter,
    StandbyLeave,
}

impl PowerAction {
    fn inverse(self) -> PowerAction {
        match self {
            PowerAction::MonitorOff => PowerAction::MonitorOn,
            PowerAction::MonitorOn => PowerAction::MonitorOff,
            PowerAction::StandbyEnter => PowerAction::StandbyLeave,
            PowerAction::StandbyLeave => PowerAction::StandbyEnter,
        }
    }
}

/// Operations needed to move between two power states, in order
pub fn plan(from: PowerState, to: PowerState) -> Result<Vec<PowerAction>, ControlError> {
    use PowerAction::{MonitorOn, StandbyEnter, StandbyLeave};
    use PowerState::{Active, Standby};

    Ok(match (from, to) {
        (Active, Active) | (PowerState::MonitorOff, PowerState::MonitorOff) | (Standby, Standby) => {
            Vec::new()
        }
        (Active, PowerState::MonitorOff) => vec![PowerAction::MonitorOff],
        (PowerState::MonitorOff, Active) => vec![MonitorOn],
        (Active, Standby) => vec![PowerAction::MonitorOff, StandbyEnter],
        (PowerState::MonitorOff, Standby) => vec![StandbyEnter],
        (Standby, Active) => vec![StandbyLeave, MonitorOn],
        (Standby, PowerState::MonitorOff) => {
            return Err(ControlError::InvalidValue(
                "standby can only be left by waking to active".to_string(),
            ))
        }
    })
}

/// Camera preview keeps running unless the device is in standby
pub fn preview_enabled(state: PowerState) -> bool {
    state != PowerState::Standby
}

/// Last backlight reading taken after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayReading {
    pub brightness: u32,
    pub dark: bool,
}

/// Shared view of the last [`DisplayReading`]; informational only, the
/// power state is never derived from it
#[derive(Clone, Default)]
pub struct DisplayStatus {
    latest: Arc<Mutex<Option<DisplayReading>>>,
}

impl DisplayStatus {
    pub fn latest(&self) -> Option<DisplayReading> {
        *self.latest.lock()
    }

    fn record(&self, reading: DisplayReading) {
        *self.latest.lock() = Some(reading);
    }
}

pub struct PowerManager {
    runner: Arc<dyn SystemCommands>,
    config: PowerConfig,
    display: DisplayStatus,
}

impl PowerManager {
    pub fn new(runner: Arc<dyn SystemCommands>, config: PowerConfig) -> Self {
        Self {
            runner,
            config,
            display: DisplayStatus::default(),
        }
    }

    pub fn display_status(&self) -> DisplayStatus {
        self.display.clone()
    }

    fn argv(&self, action: PowerAction) -> &[String] {
        match action {
            PowerAction::MonitorOff => &self.config.monitor_off_command,
            PowerAction::MonitorOn => &self.config.monitor_on_command,
            PowerAction::StandbyEnter => &self.config.standby_enter_command,
            PowerAction::StandbyLeave => &self.config.standby_leave_command,
        }
    }

    async fn run_action(&self, action: PowerAction) -> Result<(), ControlError> {
        let argv = self.argv(action);
        debug!(?action, "Running power action");
        self.runner
            .run(argv)
            .await
            .map(|_| ())
            .map_err(|e| e.into_control(argv))
    }

    /// Run the display commands for `from -> to`.
    ///
    /// If a step fails, the steps already done are undone (best effort) so
    /// the hardware matches `from` again, and the error is returned.
    pub async fn transition(&self, from: PowerState, to: PowerState) -> Result<(), ControlError> {
        let steps = plan(from, to)?;
        let mut done: Vec<PowerAction> = Vec::with_capacity(steps.len());

        for action in steps {
            if let Err(e) = self.run_action(action).await {
                warn!(%from, %to, ?action, error = %e, "Power transition failed");
                for undo in done.into_iter().rev() {
                    if let Err(e) = self.run_action(undo.inverse()).await {
                        warn!(action = ?undo.inverse(), error = %e, "Power rollback step failed");
                    }
                }
                return Err(e);
            }
            done.push(action);
        }

        if from != to {
            info!(%from, %to, "Power state changed");
        }
        Ok(())
    }

    /// Backlight brightness as reported by the display, 0 when dark
    pub async fn display_brightness(&self) -> Result<u32, ControlError> {
        let argv = &self.config.display_status_command;
        let output = self.runner.run(argv).await.map_err(|e| e.into_control(argv))?;
        output
            .stdout
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ControlError::ExternalCommandFault {
                command: argv.join(" "),
                reason: format!("unexpected output {:?}", output.stdout.trim()),
            })
    }

    /// Read the backlight and compare it with what `expected` should show.
    ///
    /// A mismatch is logged and recorded but does not fail the call.
    pub async fn check_display(&self, expected: PowerState) -> Result<DisplayReading, ControlError> {
        let brightness = self.display_brightness().await?;
        let reading = DisplayReading {
            brightness,
            dark: brightness == 0,
        };
        let should_be_dark = expected != PowerState::Active;
        if reading.dark != should_be_dark {
            warn!(%expected, brightness, "Display does not match power state");
        }
        self.display.record(reading);
        Ok(reading)
    }

    pub async fn shutdown(&self) -> Result<(), ControlError> {
        let argv = &self.config.shutdown_command;
        warn!(command = %argv.join(" "), "Shutting down the device");
        self.runner
            .run(argv)
            .await
            .map(|_| ())
            .map_err(|e| e.into_control(argv))
    }
}

/// Time of the last user interaction on any surface
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

/// How often an already-dark display rechecks the idle timer
const IDLE_RECHECK: Duration = Duration::from_secs(1);

/// Turn the display off after `timeout` without activity.
///
/// The request goes through the command queue like any other, so it is
/// ordered against user commands.
pub fn spawn_idle_watcher(
    activity: ActivityTracker,
    settings: SettingsStore,
    bus: CommandBus,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let idle = activity.idle_for();
            let active = settings.read().settings.power == PowerState::Active;

            if active && idle >= timeout {
                info!(idle_secs = idle.as_secs(), "Idle timeout, turning display off");
                match bus
                    .submit(CommandSource::IdleTimer, Command::SetPower(PowerState::MonitorOff))
                    .await
                {
                    Ok(_) => {}
                    Err(ControlError::Unavailable) => break,
                    Err(e) => {
                        warn!(error = %e, "Idle display off failed");
                        // avoid retrying in a tight loop
                        activity.touch();
                    }
                }
                continue;
            }

            let wait = if active {
                timeout.saturating_sub(idle)
            } else {
                IDLE_RECHECK.min(timeout)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
        debug!("Idle watcher stopped");
    })
}
