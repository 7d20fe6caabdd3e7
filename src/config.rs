//! Configuration management for the camera control service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub hotspot: HotspotConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Upper bound on frames per second sent to each MJPEG viewer
    #[serde(default = "default_stream_fps_limit")]
    pub stream_fps_limit: u32,

    /// Directory holding `live.html`; an embedded page is used if absent
    #[serde(default = "default_web_dir")]
    pub web_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            web_port: default_web_port(),
            stream_fps_limit: default_stream_fps_limit(),
            web_dir: default_web_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraBackendKind {
    /// libcamera through GStreamer (`libcamerasrc`)
    Libcamera,
    /// Synthetic frames, no hardware needed
    TestPattern,
}

/// Camera-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    #[serde(default = "default_backend")]
    pub backend: CameraBackendKind,

    /// Camera name for libcamerasrc, empty picks the first sensor
    #[serde(default)]
    pub device: String,

    #[serde(default = "default_preview_width")]
    pub preview_width: u32,

    #[serde(default = "default_preview_height")]
    pub preview_height: u32,

    #[serde(default = "default_preview_fps")]
    pub preview_fps: u32,

    #[serde(default = "default_still_width")]
    pub still_width: u32,

    #[serde(default = "default_still_height")]
    pub still_height: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub jpeg_quality: u32,

    /// Flip method (optional)
    /// - "vertical-flip"
    /// - "horizontal-flip"
    /// - "rotate-180"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flip_method: Option<String>,

    /// Hard bound on a still capture, including preview restart
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Bound on a stream reset after a hardware fault
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Time given to auto exposure before a still is taken
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            device: String::new(),
            preview_width: default_preview_width(),
            preview_height: default_preview_height(),
            preview_fps: default_preview_fps(),
            still_width: default_still_width(),
            still_height: default_still_height(),
            jpeg_quality: default_quality(),
            flip_method: None,
            capture_timeout_ms: default_capture_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl CameraConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    #[serde(default = "default_photos_dir")]
    pub photos_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            photos_dir: default_photos_dir(),
        }
    }
}

/// Raw touch controller range mapped onto the screen
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TouchCalibration {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
    #[serde(default)]
    pub swap_xy: bool,
    #[serde(default)]
    pub invert_x: bool,
    #[serde(default)]
    pub invert_y: bool,
}

impl Default for TouchCalibration {
    fn default() -> Self {
        // XPT2046 resistive panel on the 3.5" displays
        Self {
            x_min: 280,
            x_max: 3820,
            y_min: 290,
            y_max: 3910,
            swap_xy: true,
            invert_x: true,
            invert_y: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InputConfig {
    /// Shutter button, BCM numbering
    #[serde(default = "default_button_pin")]
    pub button_pin: u8,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// evdev node of the touch panel; touch input is off when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touch_device: Option<PathBuf>,

    #[serde(default)]
    pub calibration: TouchCalibration,

    /// Minimum travel in pixels for a touch to count as a swipe
    #[serde(default = "default_swipe_threshold")]
    pub swipe_threshold: u32,

    #[serde(default = "default_screen_width")]
    pub screen_width: u32,

    #[serde(default = "default_screen_height")]
    pub screen_height: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            button_pin: default_button_pin(),
            debounce_ms: default_debounce_ms(),
            touch_device: None,
            calibration: TouchCalibration::default(),
            swipe_threshold: default_swipe_threshold(),
            screen_width: default_screen_width(),
            screen_height: default_screen_height(),
        }
    }
}

impl InputConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Privileged display and system commands, each given as an argv list
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PowerConfig {
    /// Seconds without activity before the display is turned off; 0 disables
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_monitor_off_command")]
    pub monitor_off_command: Vec<String>,

    #[serde(default = "default_monitor_on_command")]
    pub monitor_on_command: Vec<String>,

    #[serde(default = "default_standby_enter_command")]
    pub standby_enter_command: Vec<String>,

    #[serde(default = "default_standby_leave_command")]
    pub standby_leave_command: Vec<String>,

    /// Prints the backlight brightness; 0 means the display is dark
    #[serde(default = "default_display_status_command")]
    pub display_status_command: Vec<String>,

    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: Vec<String>,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            monitor_off_command: default_monitor_off_command(),
            monitor_on_command: default_monitor_on_command(),
            standby_enter_command: default_standby_enter_command(),
            standby_leave_command: default_standby_leave_command(),
            display_status_command: default_display_status_command(),
            shutdown_command: default_shutdown_command(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl PowerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HotspotConfig {
    /// NetworkManager connection profile of the access point
    #[serde(default = "default_hotspot_connection")]
    pub connection: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_toggle_timeout_ms")]
    pub toggle_timeout_ms: u64,

    /// Prefix for the nmcli calls, usually `sudo`
    #[serde(default = "default_privilege_prefix")]
    pub privilege_prefix: Vec<String>,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            connection: default_hotspot_connection(),
            poll_interval_ms: default_poll_interval_ms(),
            toggle_timeout_ms: default_toggle_timeout_ms(),
            privilege_prefix: default_privilege_prefix(),
        }
    }
}

impl HotspotConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn toggle_timeout(&self) -> Duration {
        Duration::from_millis(self.toggle_timeout_ms)
    }
}

/// CW2015 fuel gauge on the UPS-Lite HAT
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatteryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,

    #[serde(default = "default_battery_address")]
    pub address: u16,

    #[serde(default = "default_battery_poll_secs")]
    pub poll_interval_secs: u64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            i2c_bus: default_i2c_bus(),
            address: default_battery_address(),
            poll_interval_secs: default_battery_poll_secs(),
        }
    }
}

// Default value functions
fn default_bind_ip() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8000 }
fn default_stream_fps_limit() -> u32 { 15 }
fn default_web_dir() -> PathBuf { PathBuf::from("web") }
fn default_backend() -> CameraBackendKind { CameraBackendKind::Libcamera }
fn default_preview_width() -> u32 { 640 }
fn default_preview_height() -> u32 { 480 }
fn default_preview_fps() -> u32 { 30 }
fn default_still_width() -> u32 { 3280 }
fn default_still_height() -> u32 { 2464 }
fn default_quality() -> u32 { 90 }
fn default_capture_timeout_ms() -> u64 { 5_000 }
fn default_reset_timeout_ms() -> u64 { 5_000 }
fn default_settle_ms() -> u64 { 200 }
fn default_photos_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photos")
}
fn default_button_pin() -> u8 { 26 }
fn default_debounce_ms() -> u64 { 300 }
fn default_swipe_threshold() -> u32 { 60 }
fn default_screen_width() -> u32 { 480 }
fn default_screen_height() -> u32 { 320 }
fn default_idle_timeout_secs() -> u64 { 120 }
fn default_monitor_off_command() -> Vec<String> {
    sh("echo 0 > /sys/class/backlight/*/brightness")
}
fn default_monitor_on_command() -> Vec<String> {
    sh("echo 255 > /sys/class/backlight/*/brightness")
}
fn default_standby_enter_command() -> Vec<String> {
    sh("echo 1 > /sys/class/graphics/fb1/blank")
}
fn default_standby_leave_command() -> Vec<String> {
    sh("echo 0 > /sys/class/graphics/fb1/blank")
}
fn default_display_status_command() -> Vec<String> {
    vec!["sh".into(), "-c".into(), "cat /sys/class/backlight/*/brightness".into()]
}
fn default_shutdown_command() -> Vec<String> {
    vec!["sudo".into(), "shutdown".into(), "now".into()]
}
fn default_command_timeout_ms() -> u64 { 5_000 }
fn default_hotspot_connection() -> String { "RaspiCam_Hotspot".to_string() }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_toggle_timeout_ms() -> u64 { 20_000 }
fn default_privilege_prefix() -> Vec<String> { vec!["sudo".into()] }
fn default_i2c_bus() -> u8 { 1 }
fn default_battery_address() -> u16 { 0x62 }
fn default_battery_poll_secs() -> u64 { 30 }

fn sh(script: &str) -> Vec<String> {
    vec!["sudo".into(), "sh".into(), "-c".into(), script.into()]
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;

        if cam.preview_width == 0 || cam.preview_height == 0 {
            return Err(ConfigError::Invalid(
                "camera: preview width and height must be > 0".to_string(),
            ));
        }
        if cam.still_width == 0 || cam.still_height == 0 {
            return Err(ConfigError::Invalid(
                "camera: still width and height must be > 0".to_string(),
            ));
        }
        if cam.preview_fps == 0 || cam.preview_fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera: preview FPS must be between 1 and 120, got {}",
                cam.preview_fps
            )));
        }
        if cam.jpeg_quality == 0 || cam.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "camera: quality must be between 1 and 100, got {}",
                cam.jpeg_quality
            )));
        }
        if cam.capture_timeout_ms == 0 || cam.reset_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera: capture and reset timeouts must be > 0".to_string(),
            ));
        }

        if self.server.stream_fps_limit == 0 {
            return Err(ConfigError::Invalid(
                "server: stream-fps-limit must be > 0".to_string(),
            ));
        }

        let cal = &self.input.calibration;
        if cal.x_max <= cal.x_min || cal.y_max <= cal.y_min {
            return Err(ConfigError::Invalid(
                "input: calibration max must be greater than min".to_string(),
            ));
        }
        if self.input.screen_width == 0 || self.input.screen_height == 0 {
            return Err(ConfigError::Invalid(
                "input: screen width and height must be > 0".to_string(),
            ));
        }

        let power = &self.power;
        for (name, argv) in [
            ("monitor-off-command", &power.monitor_off_command),
            ("monitor-on-command", &power.monitor_on_command),
            ("standby-enter-command", &power.standby_enter_command),
            ("standby-leave-command", &power.standby_leave_command),
            ("display-status-command", &power.display_status_command),
            ("shutdown-command", &power.shutdown_command),
        ] {
            if argv.is_empty() {
                return Err(ConfigError::Invalid(format!("power: {} must not be empty", name)));
            }
        }
        if power.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "power: command-timeout-ms must be > 0".to_string(),
            ));
        }

        let hotspot = &self.hotspot;
        if hotspot.connection.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "hotspot: connection must not be empty".to_string(),
            ));
        }
        if hotspot.poll_interval_ms == 0 || hotspot.toggle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "hotspot: poll interval and toggle timeout must be > 0".to_string(),
            ));
        }

        if self.battery.enabled && self.battery.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "battery: poll-interval-secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
