//! Resistive touch panel read straight from evdev
//!
//! Raw `input_event` records are decoded into taps and swipes, mapped to
//! screen coordinates with the panel calibration and translated into the
//! shared command vocabulary by [`TouchLayout`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::log_outcome;
use crate::command::{Command, CommandBus, CommandSource};
use crate::config::{InputConfig, TouchCalibration};
use crate::gallery::{Gallery, GalleryDirection};
use crate::settings::{PowerState, SettingsStore, Step};

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;
const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;
const BTN_TOUCH: u16 = 0x14a;

/// `struct input_event`: a `timeval` followed by type, code and value
#[cfg(target_pointer_width = "64")]
pub const INPUT_EVENT_SIZE: usize = 24;
#[cfg(not(target_pointer_width = "64"))]
pub const INPUT_EVENT_SIZE: usize = 16;

const TIMEVAL_SIZE: usize = INPUT_EVENT_SIZE - 8;

/// Design width the sidebar size is specified against
const REFERENCE_WIDTH: f32 = 480.0;
const REFERENCE_SIDEBAR: f32 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn parse(raw: &[u8; INPUT_EVENT_SIZE]) -> Self {
        let field = |at: usize| [raw[at], raw[at + 1]];
        InputEvent {
            kind: u16::from_ne_bytes(field(TIMEVAL_SIZE)),
            code: u16::from_ne_bytes(field(TIMEVAL_SIZE + 2)),
            value: i32::from_ne_bytes([
                raw[TIMEVAL_SIZE + 4],
                raw[TIMEVAL_SIZE + 5],
                raw[TIMEVAL_SIZE + 6],
                raw[TIMEVAL_SIZE + 7],
            ]),
        }
    }
}

/// Map a raw panel reading to screen pixels
pub fn calibrate(cal: &TouchCalibration, raw_x: i32, raw_y: i32, width: u32, height: u32) -> (u32, u32) {
    let (raw_x, raw_y) = if cal.swap_xy { (raw_y, raw_x) } else { (raw_x, raw_y) };

    // raw readings are untrusted, widen before subtracting
    let normalize = |v: i32, min: i32, max: i32, invert: bool| {
        let (v, min, max) = (i64::from(v), i64::from(min), i64::from(max));
        let n = (v - min) as f32 / (max - min).max(1) as f32;
        let n = if invert { 1.0 - n } else { n };
        n.clamp(0.0, 1.0)
    };
    let x = normalize(raw_x, cal.x_min, cal.x_max, cal.invert_x);
    let y = normalize(raw_y, cal.y_min, cal.y_max, cal.invert_y);

    let scale = |n: f32, size: u32| ((n * size as f32) as u32).min(size.saturating_sub(1));
    (scale(x, width), scale(y, height))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Left,
    Right,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Tap { x: u32, y: u32 },
    Swipe { direction: SwipeDirection, x: u32, y: u32 },
}

/// Turns the evdev stream into gestures, one per press/release
pub struct GestureDecoder {
    calibration: TouchCalibration,
    width: u32,
    height: u32,
    swipe_threshold: u32,
    raw_x: i32,
    raw_y: i32,
    pressed: bool,
    start: Option<(u32, u32)>,
}

impl GestureDecoder {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            calibration: config.calibration,
            width: config.screen_width,
            height: config.screen_height,
            swipe_threshold: config.swipe_threshold,
            raw_x: 0,
            raw_y: 0,
            pressed: false,
            start: None,
        }
    }

    fn position(&self) -> (u32, u32) {
        calibrate(&self.calibration, self.raw_x, self.raw_y, self.width, self.height)
    }

    pub fn feed(&mut self, event: InputEvent) -> Option<Gesture> {
        match (event.kind, event.code) {
            (EV_ABS, ABS_X) => self.raw_x = event.value,
            (EV_ABS, ABS_Y) => self.raw_y = event.value,
            (EV_SYN, _) if self.pressed && self.start.is_none() => {
                self.start = Some(self.position());
            }
            (EV_KEY, BTN_TOUCH) if event.value == 1 => {
                self.pressed = true;
                self.start = None;
            }
            (EV_KEY, BTN_TOUCH) if event.value == 0 && self.pressed => {
                self.pressed = false;
                let end = self.position();
                let start = self.start.take().unwrap_or(end);
                return Some(self.classify(start, end));
            }
            _ => {}
        }
        None
    }

    fn classify(&self, start: (u32, u32), end: (u32, u32)) -> Gesture {
        let dx = end.0 as i64 - start.0 as i64;
        let dy = end.1 as i64 - start.1 as i64;
        let threshold = self.swipe_threshold as i64;

        if dx.abs().max(dy.abs()) < threshold {
            return Gesture::Tap { x: end.0, y: end.1 };
        }
        let direction = if dx.abs() >= dy.abs() {
            if dx < 0 {
                SwipeDirection::Left
            } else {
                SwipeDirection::Right
            }
        } else if dy < 0 {
            SwipeDirection::Up
        } else {
            SwipeDirection::Down
        };
        Gesture::Swipe {
            direction,
            x: start.0,
            y: start.1,
        }
    }
}

/// Which local screen the touch surface is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TouchMode {
    #[default]
    Camera,
    Gallery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchAction {
    Submit(Command),
    DeleteCurrent,
    EnterGallery,
    LeaveGallery,
    Ignore,
}

/// Screen regions of the local UI
///
/// Camera screen: the left sidebar holds shutter +/- above ISO +/-, the
/// right sidebar holds standby, gallery and black-and-white buttons, and a
/// tap on the preview captures. Vertical swipes on the preview step ISO,
/// horizontal ones step the shutter.
///
/// Gallery screen: back (top left), delete (top right), and the outer
/// thirds or horizontal swipes move between photos.
#[derive(Debug, Clone, Copy)]
pub struct TouchLayout {
    width: u32,
    height: u32,
    sidebar: u32,
}

impl TouchLayout {
    pub fn new(width: u32, height: u32) -> Self {
        let sidebar = (REFERENCE_SIDEBAR * width as f32 / REFERENCE_WIDTH).round() as u32;
        Self {
            width,
            height,
            sidebar: sidebar.max(1),
        }
    }

    pub fn action(&self, mode: TouchMode, gesture: Gesture) -> TouchAction {
        match mode {
            TouchMode::Camera => self.camera_action(gesture),
            TouchMode::Gallery => self.gallery_action(gesture),
        }
    }

    fn camera_action(&self, gesture: Gesture) -> TouchAction {
        match gesture {
            Gesture::Tap { x, y } if x < self.sidebar => {
                let quarter = (y * 4 / self.height.max(1)).min(3);
                TouchAction::Submit(match quarter {
                    0 => Command::CycleShutter(Step::Up),
                    1 => Command::CycleShutter(Step::Down),
                    2 => Command::CycleIso(Step::Up),
                    _ => Command::CycleIso(Step::Down),
                })
            }
            Gesture::Tap { x, y } if x >= self.width.saturating_sub(self.sidebar) => {
                match (y * 3 / self.height.max(1)).min(2) {
                    0 => TouchAction::Submit(Command::SetPower(PowerState::Standby)),
                    1 => TouchAction::EnterGallery,
                    _ => TouchAction::Submit(Command::ToggleMonochrome),
                }
            }
            Gesture::Tap { .. } => TouchAction::Submit(Command::Capture),
            Gesture::Swipe { direction, .. } => TouchAction::Submit(match direction {
                SwipeDirection::Up => Command::CycleIso(Step::Up),
                SwipeDirection::Down => Command::CycleIso(Step::Down),
                SwipeDirection::Right => Command::CycleShutter(Step::Up),
                SwipeDirection::Left => Command::CycleShutter(Step::Down),
            }),
        }
    }

    fn gallery_action(&self, gesture: Gesture) -> TouchAction {
        let corner = self.sidebar.max(self.height / 6);
        match gesture {
            Gesture::Tap { x, y } if y < corner && x < corner => TouchAction::LeaveGallery,
            Gesture::Tap { x, y } if y < corner && x >= self.width.saturating_sub(corner) => {
                TouchAction::DeleteCurrent
            }
            Gesture::Tap { x, .. } if x < self.width / 3 => {
                TouchAction::Submit(Command::NavigateGallery(GalleryDirection::Older))
            }
            Gesture::Tap { x, .. } if x > self.width * 2 / 3 => {
                TouchAction::Submit(Command::NavigateGallery(GalleryDirection::Newer))
            }
            Gesture::Swipe {
                direction: SwipeDirection::Left,
                ..
            } => TouchAction::Submit(Command::NavigateGallery(GalleryDirection::Newer)),
            Gesture::Swipe {
                direction: SwipeDirection::Right,
                ..
            } => TouchAction::Submit(Command::NavigateGallery(GalleryDirection::Older)),
            _ => TouchAction::Ignore,
        }
    }
}

/// Submits touch gestures as commands from the `Touch` surface
pub struct TouchSource {
    bus: CommandBus,
    settings: SettingsStore,
    gallery: Arc<Gallery>,
    layout: TouchLayout,
    mode: TouchMode,
}

impl TouchSource {
    pub fn new(
        bus: CommandBus,
        settings: SettingsStore,
        gallery: Arc<Gallery>,
        layout: TouchLayout,
    ) -> Self {
        Self {
            bus,
            settings,
            gallery,
            layout,
            mode: TouchMode::Camera,
        }
    }

    pub fn mode(&self) -> TouchMode {
        self.mode
    }

    /// Translate one gesture and queue the resulting command, if any.
    ///
    /// While the display is not active, any touch only wakes it.
    pub async fn handle(&mut self, gesture: Gesture) -> Option<Command> {
        let command = if self.settings.read().settings.power != PowerState::Active {
            Command::SetPower(PowerState::Active)
        } else {
            match self.layout.action(self.mode, gesture) {
                TouchAction::Submit(command) => command,
                TouchAction::DeleteCurrent => {
                    let asset = self.gallery.position().asset?;
                    Command::DeleteAsset(asset.name)
                }
                TouchAction::EnterGallery => {
                    self.mode = TouchMode::Gallery;
                    Command::NavigateGallery(GalleryDirection::Newest)
                }
                TouchAction::LeaveGallery => {
                    self.mode = TouchMode::Camera;
                    return None;
                }
                TouchAction::Ignore => return None,
            }
        };

        debug!(?gesture, ?command, "Touch command");
        match self.bus.enqueue(CommandSource::Touch, command.clone(), None).await {
            Ok(pending) => {
                let label = format!("{:?}", command);
                tokio::spawn(log_outcome(CommandSource::Touch, label, pending));
            }
            Err(e) => info!(?command, error = %e, "Touch command rejected"),
        }
        Some(command)
    }

    pub async fn run(mut self, mut gestures: mpsc::Receiver<Gesture>) {
        while let Some(gesture) = gestures.recv().await {
            self.handle(gesture).await;
        }
        debug!("Touch source stopped");
    }
}

/// Read gestures from an evdev node until it disappears
pub fn spawn_device_reader(
    path: PathBuf,
    mut decoder: GestureDecoder,
) -> (mpsc::Receiver<Gesture>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        if let Err(e) = read_device(&path, &mut decoder, &tx).await {
            warn!(device = %path.display(), error = %e, "Touch device reader stopped");
        }
    });
    (rx, handle)
}

async fn read_device(
    path: &Path,
    decoder: &mut GestureDecoder,
    tx: &mpsc::Sender<Gesture>,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    info!(device = %path.display(), "Touch device opened");

    let mut raw = [0u8; INPUT_EVENT_SIZE];
    loop {
        file.read_exact(&mut raw).await?;
        if let Some(gesture) = decoder.feed(InputEvent::parse(&raw)) {
            if tx.send(gesture).await.is_err() {
                return Ok(());
            }
        }
    }
}
