//! Camera hardware abstraction
//!
//! A [`CameraBackend`] is driven from exactly one thread, the camera worker
//! (see [`worker`]). Everything async talks to it through a
//! [`CameraHandle`].

#[cfg(feature = "libcamera")]
pub mod libcamera;
pub mod platform;
pub mod test_pattern;
pub mod worker;

pub use platform::PlatformInfo;
pub use test_pattern::TestPatternCamera;
pub use worker::{CameraHandle, CameraWorker};

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{CameraBackendKind, CameraConfig};
use crate::error::ControlError;
use crate::settings::CameraSettings;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("failed to open camera: {0}")]
    Open(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// A still or frame could not be read; worth one retry
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("camera did not answer within {0:?}")]
    Timeout(Duration),

    #[error("camera worker has stopped")]
    WorkerStopped,
}

impl CameraError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Capture(_))
    }
}

impl From<CameraError> for ControlError {
    fn from(err: CameraError) -> Self {
        ControlError::HardwareFault(err.to_string())
    }
}

/// Still/preview geometry and encoding shared by every backend
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: String,
    pub preview_width: u32,
    pub preview_height: u32,
    pub preview_fps: u32,
    pub still_width: u32,
    pub still_height: u32,
    pub quality: u32,
    pub flip_method: Option<String>,
    pub settle: Duration,
}

impl From<&CameraConfig> for CaptureConfig {
    fn from(cfg: &CameraConfig) -> Self {
        Self {
            device: cfg.device.clone(),
            preview_width: cfg.preview_width,
            preview_height: cfg.preview_height,
            preview_fps: cfg.preview_fps,
            still_width: cfg.still_width,
            still_height: cfg.still_height,
            quality: cfg.jpeg_quality,
            flip_method: cfg.flip_method.clone(),
            settle: Duration::from_millis(cfg.settle_ms),
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.preview_fps.max(1)
    }
}

/// One camera sensor. All calls block; only the camera worker makes them.
pub trait CameraBackend: Send {
    fn name(&self) -> &str;

    /// Begin continuous low-resolution JPEG production
    fn start_preview(&mut self) -> Result<(), CameraError>;

    fn stop_preview(&mut self) -> Result<(), CameraError>;

    /// Wait up to `wait` for the next preview JPEG
    fn next_preview_frame(&mut self, wait: Duration) -> Result<Option<Bytes>, CameraError>;

    /// Push ISO, shutter and colour settings to the sensor
    fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError>;

    /// Full-resolution JPEG still. Preview is stopped while this runs.
    fn capture_still(&mut self) -> Result<Bytes, CameraError>;

    /// Tear the stream down and bring it back to a known state
    fn reset(&mut self) -> Result<(), CameraError>;
}

/// Open the configured backend. Failure here is fatal for the process.
pub fn open_backend(
    kind: CameraBackendKind,
    config: &CameraConfig,
) -> Result<Box<dyn CameraBackend>, CameraError> {
    let capture = CaptureConfig::from(config);
    let backend: Box<dyn CameraBackend> = match kind {
        CameraBackendKind::TestPattern => Box::new(TestPatternCamera::new(capture)),
        #[cfg(feature = "libcamera")]
        CameraBackendKind::Libcamera => Box::new(libcamera::LibcameraCamera::open(capture)?),
        #[cfg(not(feature = "libcamera"))]
        CameraBackendKind::Libcamera => {
            return Err(CameraError::Unsupported(
                "built without the `libcamera` feature".to_string(),
            ))
        }
    };
    info!(backend = backend.name(), "Camera opened");
    Ok(backend)
}
