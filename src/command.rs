//! Unified command vocabulary and the single ordered command queue
//!
//! GPIO, touch and remote surfaces all submit through a [`CommandBus`];
//! the camera controller is the only consumer of the matching
//! [`CommandQueue`]. Commands are applied strictly in arrival order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ControlError;
use crate::gallery::{GalleryDirection, GalleryPosition, PhotoAsset};
use crate::power::hotspot::HotspotState;
use crate::settings::{Iso, PowerState, SettingsSnapshot, ShutterSpeed, Step};

/// A request any surface may submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "value", rename_all = "snake_case")]
pub enum Command {
    Capture,
    SetIso(Iso),
    SetShutter(ShutterSpeed),
    CycleIso(Step),
    CycleShutter(Step),
    SetMonochrome(bool),
    ToggleMonochrome,
    SetPower(PowerState),
    ToggleHotspot,
    DeleteAsset(String),
    NavigateGallery(GalleryDirection),
    Shutdown,
}

impl Command {
    /// Whether applying this command changes camera settings
    pub fn is_settings_change(&self) -> bool {
        matches!(
            self,
            Command::SetIso(_)
                | Command::SetShutter(_)
                | Command::CycleIso(_)
                | Command::CycleShutter(_)
                | Command::SetMonochrome(_)
                | Command::ToggleMonochrome
        )
    }
}

/// Which control surface a command came from, kept for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "surface", rename_all = "snake_case")]
pub enum CommandSource {
    Gpio,
    Touch,
    Remote { session: u32 },
    IdleTimer,
    System,
}

impl CommandSource {
    /// Interactive sources count as user activity and wake the device
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            CommandSource::Gpio | CommandSource::Touch | CommandSource::Remote { .. }
        )
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::Gpio => f.write_str("gpio"),
            CommandSource::Touch => f.write_str("touch"),
            CommandSource::Remote { session } => write!(f, "remote#{}", session),
            CommandSource::IdleTimer => f.write_str("idle-timer"),
            CommandSource::System => f.write_str("system"),
        }
    }
}

/// Successful result of a command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Settings(SettingsSnapshot),
    Captured(PhotoAsset),
    Deleted { name: String },
    Gallery(GalleryPosition),
    Hotspot { state: HotspotState },
    ShuttingDown,
}

pub type CommandResult = Result<CommandOutcome, ControlError>;

/// Released when dropped; at most one exists at a time
pub struct CapturePermit {
    gate: Arc<AtomicBool>,
}

impl CapturePermit {
    fn try_acquire(gate: &Arc<AtomicBool>) -> Option<Self> {
        gate.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CapturePermit {
                gate: Arc::clone(gate),
            })
    }
}

impl Drop for CapturePermit {
    fn drop(&mut self) {
        self.gate.store(false, Ordering::Release);
    }
}

/// A queued command plus the channel its result goes back on
pub struct CommandEnvelope {
    pub command: Command,
    pub source: CommandSource,
    /// Settings version the submitter based its change on, if any
    pub expected_version: Option<u64>,
    pub capture_permit: Option<CapturePermit>,
    pub reply: oneshot::Sender<CommandResult>,
}

/// Result that has not been produced yet
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<CommandResult>,
}

impl PendingReply {
    pub async fn outcome(self) -> CommandResult {
        self.rx.await.unwrap_or(Err(ControlError::Unavailable))
    }
}

/// Submission handle shared by all control surfaces
#[derive(Clone)]
pub struct CommandBus {
    tx: mpsc::Sender<CommandEnvelope>,
    capture_gate: Arc<AtomicBool>,
}

/// Consumer side, owned by the camera controller
pub struct CommandQueue {
    rx: mpsc::Receiver<CommandEnvelope>,
}

impl CommandQueue {
    pub async fn recv(&mut self) -> Option<CommandEnvelope> {
        self.rx.recv().await
    }
}

/// Create the command queue
pub fn channel(capacity: usize) -> (CommandBus, CommandQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        CommandBus {
            tx,
            capture_gate: Arc::new(AtomicBool::new(false)),
        },
        CommandQueue { rx },
    )
}

impl CommandBus {
    /// Put a command on the queue and return a handle for its result.
    ///
    /// A capture submitted while another capture is queued or running is
    /// answered with `Busy` right here, without touching the queue.
    pub async fn enqueue(
        &self,
        source: CommandSource,
        command: Command,
        expected_version: Option<u64>,
    ) -> Result<PendingReply, ControlError> {
        let capture_permit = if command == Command::Capture {
            match CapturePermit::try_acquire(&self.capture_gate) {
                Some(permit) => Some(permit),
                None => {
                    debug!(%source, "Capture rejected, another capture is in flight");
                    return Err(ControlError::Busy);
                }
            }
        } else {
            None
        };

        let (reply, rx) = oneshot::channel();
        let envelope = CommandEnvelope {
            command,
            source,
            expected_version,
            capture_permit,
            reply,
        };

        self.tx
            .send(envelope)
            .await
            .map_err(|_| ControlError::Unavailable)?;

        Ok(PendingReply { rx })
    }

    /// Submit and wait for the result
    pub async fn submit(&self, source: CommandSource, command: Command) -> CommandResult {
        self.enqueue(source, command, None).await?.outcome().await
    }

    /// Submit a settings change based on a previously read version
    pub async fn submit_versioned(
        &self,
        source: CommandSource,
        command: Command,
        expected_version: u64,
    ) -> CommandResult {
        self.enqueue(source, command, Some(expected_version))
            .await?
            .outcome()
            .await
    }

    pub fn capture_in_flight(&self) -> bool {
        self.capture_gate.load(Ordering::Acquire)
    }
}
