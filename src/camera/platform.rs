//! Platform detection for camera sources

use std::env;
use std::fmt;

/// Platform information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformInfo {
    /// macOS (Darwin)
    MacOS,

    /// Raspberry Pi (detected via the device tree model)
    RaspberryPi,

    /// Generic Linux
    Linux,
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformInfo::MacOS => f.write_str("macos"),
            PlatformInfo::RaspberryPi => f.write_str("raspberry-pi"),
            PlatformInfo::Linux => f.write_str("linux"),
        }
    }
}

/// Detects current platform
pub fn detect_platform() -> PlatformInfo {
    match env::consts::OS {
        "macos" => PlatformInfo::MacOS,
        "linux" if is_raspberry_pi() => PlatformInfo::RaspberryPi,
        _ => PlatformInfo::Linux,
    }
}

fn is_raspberry_pi() -> bool {
    ["/proc/device-tree/model", "/sys/firmware/devicetree/base/model"]
        .iter()
        .filter_map(|p| std::fs::read(p).ok())
        .any(|model| model_is_raspberry_pi(&model))
}

fn model_is_raspberry_pi(model: &[u8]) -> bool {
    String::from_utf8_lossy(model).contains("Raspberry Pi")
}

/// Whether GPIO, the touch panel and the I2C fuel gauge can exist here
pub fn has_board_peripherals(platform: PlatformInfo) -> bool {
    platform == PlatformInfo::RaspberryPi
}

/// GStreamer source element for the platform's camera
pub fn source_element(platform: PlatformInfo, device: &str) -> String {
    match platform {
        PlatformInfo::RaspberryPi if device.is_empty() => "libcamerasrc".to_string(),
        PlatformInfo::RaspberryPi => format!("libcamerasrc camera-name=\"{}\"", device),
        PlatformInfo::MacOS => format!(
            "avfvideosrc device-index={}",
            if device.is_empty() { "0" } else { device }
        ),
        PlatformInfo::Linux if device.is_empty() => "v4l2src device=/dev/video0".to_string(),
        PlatformInfo::Linux => format!("v4l2src device={}", device),
    }
}
