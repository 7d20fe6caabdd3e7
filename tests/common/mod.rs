//! Shared test rig: scripted camera, recording command runner, wired service

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use picam_control::camera::{CameraBackend, CameraError, CameraWorker};
use picam_control::command::{self, CommandBus};
use picam_control::config::{HotspotConfig, PowerConfig};
use picam_control::controller::{CameraController, ControllerTimeouts};
use picam_control::gallery::Gallery;
use picam_control::power::battery::BatteryMonitor;
use picam_control::power::hotspot::HotspotManager;
use picam_control::power::system::{CommandOutput, ExternalCommandError, SystemCommands};
use picam_control::power::{ActivityTracker, DisplayStatus, PowerManager};
use picam_control::settings::{CameraSettings, SettingsStore};
use picam_control::streaming::{FrameBroadcaster, SessionRegistry};
use picam_control::web::AppState;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

pub const JPEG: &[u8] = b"\xFF\xD8scripted-still\xFF\xD9";

/// What the next still capture does
pub enum CaptureStep {
    Succeed,
    Delay(Duration),
    Fail(CameraError),
}

#[derive(Default)]
pub struct CameraTally {
    pub script: Mutex<VecDeque<CaptureStep>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub captures: AtomicUsize,
    pub resets: AtomicUsize,
}

impl CameraTally {
    pub fn push(&self, step: CaptureStep) {
        self.script.lock().push_back(step);
    }
}

pub struct ScriptedCamera {
    tally: Arc<CameraTally>,
}

impl CameraBackend for ScriptedCamera {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start_preview(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn next_preview_frame(&mut self, wait: Duration) -> Result<Option<Bytes>, CameraError> {
        thread::sleep(wait);
        Ok(Some(Bytes::from_static(b"\xFF\xD8preview\xFF\xD9")))
    }

    fn apply_settings(&mut self, _settings: &CameraSettings) -> Result<(), CameraError> {
        Ok(())
    }

    fn capture_still(&mut self) -> Result<Bytes, CameraError> {
        let now = self.tally.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.tally.captures.fetch_add(1, Ordering::SeqCst);

        let step = self.tally.script.lock().pop_front();
        let result = match step {
            Some(CaptureStep::Delay(d)) => {
                thread::sleep(d);
                Ok(Bytes::from_static(JPEG))
            }
            Some(CaptureStep::Fail(e)) => Err(e),
            Some(CaptureStep::Succeed) | None => Ok(Bytes::from_static(JPEG)),
        };

        self.tally.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn reset(&mut self) -> Result<(), CameraError> {
        self.tally.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every privileged command. `nmcli con up|down` takes effect after
/// `hotspot_polls` status queries; `display-status` reports 0 while the
/// monitor is off.
pub struct RecordingRunner {
    pub calls: Mutex<Vec<String>>,
    display_lit: Mutex<bool>,
    hotspot_active: Mutex<bool>,
    pending: Mutex<Option<(bool, u32)>>,
    hotspot_polls: u32,
}

impl RecordingRunner {
    pub fn new(hotspot_polls: u32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            display_lit: Mutex::new(true),
            hotspot_active: Mutex::new(false),
            pending: Mutex::new(None),
            hotspot_polls,
        }
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl SystemCommands for RecordingRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, ExternalCommandError> {
        let line = argv.join(" ");
        self.calls.lock().push(line.clone());

        match line.as_str() {
            "monitor-off" => *self.display_lit.lock() = false,
            "monitor-on" => *self.display_lit.lock() = true,
            "display-status" => {
                let brightness = if *self.display_lit.lock() { 255 } else { 0 };
                return Ok(CommandOutput {
                    stdout: format!("{}\n", brightness),
                });
            }
            _ => {}
        }
        if line.contains("con show") {
            let mut pending = self.pending.lock();
            if let Some((target, remaining)) = pending.as_mut() {
                if *remaining == 0 {
                    *self.hotspot_active.lock() = *target;
                    *pending = None;
                } else {
                    *remaining -= 1;
                }
            }
            let active = if *self.hotspot_active.lock() { "yes" } else { "no" };
            return Ok(CommandOutput {
                stdout: format!("{}:RaspiCam_Hotspot\n", active),
            });
        }
        if line.contains("nmcli con up") || line.contains("nmcli con down") {
            *self.pending.lock() = Some((line.contains(" up "), self.hotspot_polls));
        }
        Ok(CommandOutput::default())
    }
}

pub struct Rig {
    pub dir: TempDir,
    pub bus: CommandBus,
    pub settings: SettingsStore,
    pub gallery: Arc<Gallery>,
    pub frames: Arc<FrameBroadcaster>,
    pub hotspot: HotspotManager,
    pub sessions: SessionRegistry,
    pub battery: BatteryMonitor,
    pub activity: ActivityTracker,
    pub display: DisplayStatus,
    pub camera: Arc<CameraTally>,
    pub system: Arc<RecordingRunner>,
}

impl Rig {
    pub fn app_state(&self) -> AppState {
        AppState {
            bus: self.bus.clone(),
            settings: self.settings.clone(),
            gallery: Arc::clone(&self.gallery),
            frames: Arc::clone(&self.frames),
            sessions: self.sessions.clone(),
            hotspot: self.hotspot.clone(),
            battery: self.battery.clone(),
            activity: self.activity.clone(),
            display: self.display.clone(),
            web_dir: PathBuf::from("web"),
            stream_fps_limit: 30,
        }
    }

    /// Wait until the preview has published a frame newer than `after`
    pub async fn wait_for_frame_after(&self, after: u64) -> u64 {
        let mut sub = self.frames.subscribe("test");
        loop {
            let frame = sub.next_frame().await.expect("broadcaster stopped");
            if frame.sequence > after {
                return frame.sequence;
            }
        }
    }
}

pub fn rig() -> Rig {
    rig_with(ControllerTimeouts {
        capture: Duration::from_secs(2),
        hardware: Duration::from_secs(2),
    })
}

pub fn rig_with(timeouts: ControllerTimeouts) -> Rig {
    build(timeouts, 3, 2_000)
}

/// Hotspot confirms after `polls` status queries and gives up after
/// `toggle_timeout_ms`
pub fn rig_with_hotspot(polls: u32, toggle_timeout_ms: u64) -> Rig {
    build(
        ControllerTimeouts {
            capture: Duration::from_secs(2),
            hardware: Duration::from_secs(2),
        },
        polls,
        toggle_timeout_ms,
    )
}

fn build(timeouts: ControllerTimeouts, hotspot_polls: u32, toggle_timeout_ms: u64) -> Rig {
    let dir = TempDir::new().unwrap();
    let gallery = Arc::new(Gallery::open(dir.path()).unwrap());
    let settings = SettingsStore::new(CameraSettings::default());
    let frames = Arc::new(FrameBroadcaster::new());

    let camera = Arc::new(CameraTally::default());
    let handle = CameraWorker::spawn(
        Box::new(ScriptedCamera {
            tally: Arc::clone(&camera),
        }),
        CameraSettings::default(),
        Arc::clone(&frames),
        Duration::from_millis(5),
    )
    .unwrap();

    let system = Arc::new(RecordingRunner::new(hotspot_polls));
    let argv = |s: &str| vec![s.to_string()];
    let power = PowerManager::new(
        system.clone(),
        PowerConfig {
            monitor_off_command: argv("monitor-off"),
            monitor_on_command: argv("monitor-on"),
            standby_enter_command: argv("standby-enter"),
            standby_leave_command: argv("standby-leave"),
            display_status_command: argv("display-status"),
            shutdown_command: argv("shutdown"),
            ..Default::default()
        },
    );
    let display = power.display_status();
    let hotspot = HotspotManager::new(
        system.clone(),
        HotspotConfig {
            poll_interval_ms: 20,
            toggle_timeout_ms,
            ..Default::default()
        },
    );

    let activity = ActivityTracker::new();
    let (bus, queue) = command::channel(32);
    let controller = CameraController::new(
        handle,
        settings.clone(),
        Arc::clone(&gallery),
        power,
        hotspot.clone(),
        activity.clone(),
        timeouts,
    );
    tokio::spawn(controller.run(queue));

    Rig {
        dir,
        bus,
        settings,
        gallery,
        frames,
        hotspot,
        sessions: SessionRegistry::new(),
        battery: BatteryMonitor::new(),
        activity,
        display,
        camera,
        system,
    }
}
