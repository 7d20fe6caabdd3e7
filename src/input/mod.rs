//! Local control surfaces: the shutter button and the touch panel

pub mod gpio;
pub mod touch;

use tracing::{info, warn};

use crate::command::{CommandOutcome, CommandSource, PendingReply};
use crate::error::ControlError;

pub use gpio::{ButtonSource, Debouncer, EdgeOutcome};
pub use touch::{GestureDecoder, TouchLayout, TouchSource};

/// Wait for a fire-and-forget command and log how it ended.
///
/// Local surfaces have no reply channel of their own; their feedback is the
/// settings change or the new photo showing up on screen.
pub(crate) async fn log_outcome(source: CommandSource, command: String, pending: PendingReply) {
    match pending.outcome().await {
        Ok(CommandOutcome::Captured(asset)) => {
            info!(%source, photo = %asset.name, "Photo captured")
        }
        Ok(_) => {}
        Err(ControlError::Busy) => info!(%source, %command, "Command rejected, busy"),
        Err(e) => warn!(%source, %command, error = %e, "Command failed"),
    }
}
