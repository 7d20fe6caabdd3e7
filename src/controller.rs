//! The camera controller: sole consumer of the command queue
//!
//! Owns the camera handle and is the only writer of the settings store and
//! the photo directory. Commands are applied one at a time in arrival
//! order, so no two commands ever touch the hardware concurrently.

use bytes::Bytes;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraError, CameraHandle};
use crate::command::{Command, CommandEnvelope, CommandOutcome, CommandQueue, CommandResult, CommandSource};
use crate::config::CameraConfig;
use crate::error::ControlError;
use crate::gallery::{validate_name, Gallery, ReservedPhoto};
use crate::power::hotspot::HotspotManager;
use crate::power::{preview_enabled, ActivityTracker, PowerManager};
use crate::settings::{CameraSettings, PowerState, SettingsSnapshot, SettingsStore};

#[derive(Debug, Clone, Copy)]
pub struct ControllerTimeouts {
    /// Hard bound on one still capture
    pub capture: Duration,
    /// Bound on reset, preview toggles and settings pushes
    pub hardware: Duration,
}

impl From<&CameraConfig> for ControllerTimeouts {
    fn from(cfg: &CameraConfig) -> Self {
        Self {
            capture: cfg.capture_timeout(),
            hardware: cfg.reset_timeout(),
        }
    }
}

pub struct CameraController {
    camera: CameraHandle,
    settings: SettingsStore,
    gallery: Arc<Gallery>,
    power: PowerManager,
    hotspot: HotspotManager,
    activity: ActivityTracker,
    timeouts: ControllerTimeouts,
}

impl CameraController {
    pub fn new(
        camera: CameraHandle,
        settings: SettingsStore,
        gallery: Arc<Gallery>,
        power: PowerManager,
        hotspot: HotspotManager,
        activity: ActivityTracker,
        timeouts: ControllerTimeouts,
    ) -> Self {
        Self {
            camera,
            settings,
            gallery,
            power,
            hotspot,
            activity,
            timeouts,
        }
    }

    /// Serve the queue until every submitter is gone
    pub async fn run(mut self, mut queue: CommandQueue) {
        info!("Camera controller started");
        while let Some(envelope) = queue.recv().await {
            let CommandEnvelope {
                command,
                source,
                expected_version,
                capture_permit,
                reply,
            } = envelope;

            debug!(%source, ?command, "Applying command");
            let result = self.apply_command(source, command, expected_version).await;
            // the next capture may be accepted as soon as this one is answered
            drop(capture_permit);

            if let Err(e) = &result {
                warn!(%source, kind = e.kind(), error = %e, "Command failed");
            }
            if reply.send(result).is_err() {
                debug!(%source, "Submitter went away before the result");
            }
        }
        info!("Camera controller stopped");
    }

    pub async fn apply_command(
        &mut self,
        source: CommandSource,
        command: Command,
        expected_version: Option<u64>,
    ) -> CommandResult {
        // checked before any wake-up bumps the version
        if let Some(expected) = expected_version {
            let current = self.settings.version();
            if command.is_settings_change() && expected != current {
                return Err(ControlError::StaleWrite { expected, current });
            }
        }

        if source.is_interactive() {
            self.activity.touch();
            if !matches!(command, Command::SetPower(_)) {
                self.wake().await;
            }
        }

        match command {
            Command::Capture => self.capture().await,
            Command::SetIso(iso) => self.change_settings(|s| s.iso = iso).await,
            Command::SetShutter(speed) => self.change_settings(|s| s.shutter = speed).await,
            Command::CycleIso(step) => self.change_settings(|s| s.iso = s.iso.step(step)).await,
            Command::CycleShutter(step) => {
                self.change_settings(|s| s.shutter = s.shutter.step(step)).await
            }
            Command::SetMonochrome(on) => self.change_settings(|s| s.monochrome = on).await,
            Command::ToggleMonochrome => {
                self.change_settings(|s| s.monochrome = !s.monochrome).await
            }
            Command::SetPower(target) => self.set_power(target).await.map(CommandOutcome::Settings),
            Command::ToggleHotspot => {
                let state = self.hotspot.toggle()?;
                Ok(CommandOutcome::Hotspot { state })
            }
            Command::DeleteAsset(name) => self.delete(name).await,
            Command::NavigateGallery(direction) => {
                Ok(CommandOutcome::Gallery(self.gallery.navigate(direction)))
            }
            Command::Shutdown => {
                self.power.shutdown().await?;
                Ok(CommandOutcome::ShuttingDown)
            }
        }
    }

    fn store(&self, update: impl FnOnce(&mut CameraSettings)) -> Result<SettingsSnapshot, ControlError> {
        let current = self.settings.read();
        let mut next = current.settings;
        update(&mut next);
        self.settings.compare_and_set(current.version, next)
    }

    /// Push the new values to the sensor, then publish them. A hardware
    /// failure leaves the store at the last applied settings.
    async fn change_settings(&mut self, update: impl FnOnce(&mut CameraSettings)) -> CommandResult {
        let mut next = self.settings.read().settings;
        update(&mut next);

        self.camera
            .apply_settings(next, self.timeouts.hardware)
            .await?;
        let snapshot = self.store(|s| *s = next)?;
        info!(
            iso = %snapshot.settings.iso,
            shutter = %snapshot.settings.shutter,
            monochrome = snapshot.settings.monochrome,
            version = snapshot.version,
            "Settings applied"
        );
        Ok(CommandOutcome::Settings(snapshot))
    }

    async fn set_power(&mut self, target: PowerState) -> Result<SettingsSnapshot, ControlError> {
        let current = self.settings.read();
        let from = current.settings.power;
        if from == target {
            return Ok(current);
        }

        self.power.transition(from, target).await?;

        if preview_enabled(from) != preview_enabled(target) {
            if let Err(e) = self
                .camera
                .set_preview(preview_enabled(target), self.timeouts.hardware)
                .await
            {
                warn!(power = %target, error = %e, "Preview did not follow power state");
            }
        }

        let snapshot = self.store(|s| s.power = target)?;
        if let Err(e) = self.power.check_display(target).await {
            warn!(power = %target, error = %e, "Display status unavailable");
        }
        Ok(snapshot)
    }

    async fn wake(&mut self) {
        if self.settings.read().settings.power == PowerState::Active {
            return;
        }
        match self.set_power(PowerState::Active).await {
            Ok(_) => info!("Woke up on user activity"),
            Err(e) => warn!(error = %e, "Wake-up failed"),
        }
    }

    async fn capture(&mut self) -> CommandResult {
        let reserved = self.gallery.reserve(Local::now().naive_local());
        let jpeg = self.capture_with_retry().await?;
        let size = self.write_photo(&reserved, &jpeg).await?;
        let asset = self.gallery.commit(reserved, size);
        info!(photo = %asset.name, bytes = size, "Photo saved");
        Ok(CommandOutcome::Captured(asset))
    }

    /// One automatic retry for transient read failures. A capture that
    /// overruns its bound is abandoned and the stream reset.
    async fn capture_with_retry(&mut self) -> Result<Bytes, ControlError> {
        let mut retried = false;
        loop {
            match self.camera.capture(self.timeouts.capture).await {
                Ok(jpeg) => return Ok(jpeg),
                Err(e) if e.is_transient() && !retried => {
                    warn!(error = %e, "Capture failed, retrying once");
                    retried = true;
                }
                Err(CameraError::Timeout(limit)) => {
                    error!(?limit, "Capture timed out, resetting camera");
                    self.reset_camera().await;
                    return Err(ControlError::HardwareFault(format!(
                        "capture did not finish within {:?}",
                        limit
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn reset_camera(&mut self) {
        // the worker serves the reset once the stuck capture returns
        match self.camera.reset(self.timeouts.hardware).await {
            Ok(()) => info!("Camera stream reset"),
            Err(e) => error!(error = %e, "Camera reset failed"),
        }
    }

    async fn write_photo(&self, reserved: &ReservedPhoto, jpeg: &[u8]) -> Result<u64, ControlError> {
        let write = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&reserved.path)
                .await?;
            file.write_all(jpeg).await?;
            file.sync_all().await
        };

        if let Err(e) = write.await {
            error!(path = %reserved.path.display(), error = %e, "Failed to write photo");
            let _ = tokio::fs::remove_file(&reserved.path).await;
            return Err(ControlError::IoFault(format!("{}: {}", reserved.name, e)));
        }
        Ok(jpeg.len() as u64)
    }

    async fn delete(&mut self, name: String) -> CommandResult {
        validate_name(&name)?;
        let path = self.gallery.dir().join(&name);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            // already gone from disk, still drop the stale index entry
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.gallery.remove(&name).is_none() {
                    return Err(ControlError::NotFound(name));
                }
                return Ok(CommandOutcome::Deleted { name });
            }
            Err(e) => return Err(ControlError::IoFault(format!("{}: {}", name, e))),
        }

        self.gallery.remove(&name);
        info!(photo = %name, "Photo deleted");
        Ok(CommandOutcome::Deleted { name })
    }
}
