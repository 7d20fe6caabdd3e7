//! The camera thread
//!
//! One OS thread owns the [`CameraBackend`]. Between requests it produces
//! preview frames into the [`FrameBroadcaster`]; requests from the
//! controller are served in order and answered over oneshot channels.
//! Every wait on the async side is bounded, so a wedged sensor surfaces as
//! a timeout instead of a hung controller.

use bytes::Bytes;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{CameraBackend, CameraError};
use crate::settings::CameraSettings;
use crate::streaming::FrameBroadcaster;

/// How long to back off before retrying a preview that failed to restart
const PREVIEW_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Longest single wait for a preview frame, so requests stay responsive
const MAX_FRAME_WAIT: Duration = Duration::from_millis(100);

type Reply<T> = oneshot::Sender<Result<T, CameraError>>;

enum HardwareRequest {
    ApplySettings(CameraSettings, Reply<()>),
    Capture(Reply<Bytes>),
    SetPreview(bool, Reply<()>),
    Reset(Reply<()>),
}

pub struct CameraWorker {
    backend: Box<dyn CameraBackend>,
    broadcaster: Arc<FrameBroadcaster>,
    frame_wait: Duration,
    preview_wanted: bool,
    preview_running: bool,
}

impl CameraWorker {
    /// Configure the sensor, start preview and hand the backend to a
    /// dedicated thread. Errors here mean the camera is unusable.
    pub fn spawn(
        mut backend: Box<dyn CameraBackend>,
        initial: CameraSettings,
        broadcaster: Arc<FrameBroadcaster>,
        frame_interval: Duration,
    ) -> Result<CameraHandle, CameraError> {
        backend.apply_settings(&initial)?;
        backend.start_preview()?;

        let mut worker = CameraWorker {
            backend,
            broadcaster,
            frame_wait: frame_interval.min(MAX_FRAME_WAIT),
            preview_wanted: true,
            preview_running: true,
        };

        let (tx, rx) = mpsc::channel();
        // detached: the thread exits once every handle is dropped
        thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| CameraError::Open(format!("failed to spawn camera thread: {}", e)))?;

        Ok(CameraHandle { tx })
    }

    fn run(&mut self, rx: mpsc::Receiver<HardwareRequest>) {
        info!(backend = self.backend.name(), "Camera thread started");

        loop {
            if self.preview_wanted && !self.preview_running {
                self.try_start_preview();
            }

            let request = if self.preview_running {
                match rx.try_recv() {
                    Ok(request) => Some(request),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else if self.preview_wanted {
                match rx.recv_timeout(PREVIEW_RETRY_INTERVAL) {
                    Ok(request) => Some(request),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match rx.recv() {
                    Ok(request) => Some(request),
                    Err(_) => break,
                }
            };

            match request {
                Some(request) => self.handle(request),
                None => self.produce_frame(),
            }
        }

        if self.preview_running {
            if let Err(e) = self.backend.stop_preview() {
                warn!(error = %e, "Failed to stop preview on shutdown");
            }
        }
        info!("Camera thread stopped");
    }

    fn produce_frame(&mut self) {
        match self.backend.next_preview_frame(self.frame_wait) {
            Ok(Some(data)) => {
                self.broadcaster.publish(data);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Preview frame failed");
                thread::sleep(self.frame_wait);
            }
        }
    }

    fn handle(&mut self, request: HardwareRequest) {
        match request {
            HardwareRequest::ApplySettings(settings, reply) => {
                let _ = reply.send(self.backend.apply_settings(&settings));
            }
            HardwareRequest::Capture(reply) => {
                let result = self.capture();
                if reply.send(result).is_err() {
                    warn!("Capture finished after its caller gave up, discarding");
                }
            }
            HardwareRequest::SetPreview(enabled, reply) => {
                let _ = reply.send(self.set_preview(enabled));
            }
            HardwareRequest::Reset(reply) => {
                let result = self.reset();
                let _ = reply.send(result);
            }
        }
    }

    /// Preview is suspended for exactly the duration of the still
    fn capture(&mut self) -> Result<Bytes, CameraError> {
        let resume = self.preview_running;
        if resume {
            self.backend.stop_preview()?;
            self.preview_running = false;
        }

        let result = self.backend.capture_still();

        if resume {
            self.try_start_preview();
        }
        result
    }

    fn set_preview(&mut self, enabled: bool) -> Result<(), CameraError> {
        self.preview_wanted = enabled;
        if enabled && !self.preview_running {
            self.backend.start_preview()?;
            self.preview_running = true;
            info!("Preview resumed");
        } else if !enabled && self.preview_running {
            self.preview_running = false;
            self.backend.stop_preview()?;
            info!("Preview suspended");
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CameraError> {
        warn!(backend = self.backend.name(), "Resetting camera stream");
        self.preview_running = false;
        self.backend.reset()?;
        if self.preview_wanted {
            self.backend.start_preview()?;
            self.preview_running = true;
        }
        Ok(())
    }

    fn try_start_preview(&mut self) {
        match self.backend.start_preview() {
            Ok(()) => {
                self.preview_running = true;
                debug!("Preview running");
            }
            Err(e) => error!(error = %e, "Failed to start preview, will retry"),
        }
    }
}

/// Async-side access to the camera thread
pub struct CameraHandle {
    tx: mpsc::Sender<HardwareRequest>,
}

impl CameraHandle {
    async fn call<T>(
        &self,
        limit: Duration,
        make: impl FnOnce(Reply<T>) -> HardwareRequest,
    ) -> Result<T, CameraError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CameraError::WorkerStopped)?;

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CameraError::WorkerStopped),
            Err(_) => Err(CameraError::Timeout(limit)),
        }
    }

    pub async fn apply_settings(
        &self,
        settings: CameraSettings,
        limit: Duration,
    ) -> Result<(), CameraError> {
        self.call(limit, |reply| HardwareRequest::ApplySettings(settings, reply))
            .await
    }

    /// Full-resolution still; preview pauses while it runs
    pub async fn capture(&self, limit: Duration) -> Result<Bytes, CameraError> {
        self.call(limit, HardwareRequest::Capture).await
    }

    pub async fn set_preview(&self, enabled: bool, limit: Duration) -> Result<(), CameraError> {
        self.call(limit, |reply| HardwareRequest::SetPreview(enabled, reply))
            .await
    }

    pub async fn reset(&self, limit: Duration) -> Result<(), CameraError> {
        self.call(limit, HardwareRequest::Reset).await
    }
}
