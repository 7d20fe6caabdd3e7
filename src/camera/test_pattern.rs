//! Synthetic camera used with `--test-mode` and on machines without a sensor

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{CameraBackend, CameraError, CaptureConfig};
use crate::settings::CameraSettings;

const MAX_STILL_WIDTH: u32 = 1640;
const MAX_STILL_HEIGHT: u32 = 1232;

/// Renders a moving gradient whose brightness follows ISO and shutter
pub struct TestPatternCamera {
    config: CaptureConfig,
    settings: CameraSettings,
    preview_running: bool,
    next_frame_at: Instant,
    frame_counter: u32,
}

impl TestPatternCamera {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            settings: CameraSettings::default(),
            preview_running: false,
            next_frame_at: Instant::now(),
            frame_counter: 0,
        }
    }

    /// Relative exposure, 1.0 for automatic settings
    fn exposure_factor(&self) -> f32 {
        let gain = self.settings.iso.analogue_gain().unwrap_or(1.0);
        let time = self
            .settings
            .shutter
            .exposure_us()
            .map(|us| us as f32 / 8_000.0)
            .unwrap_or(1.0);
        (gain * time).clamp(0.15, 3.0)
    }

    fn render(&self, width: u32, height: u32) -> Result<Bytes, CameraError> {
        let factor = self.exposure_factor();
        let offset = self.frame_counter.wrapping_mul(4);
        let monochrome = self.settings.monochrome;

        let img = RgbImage::from_fn(width, height, |x, y| {
            let r = ((x + offset) % 256) as f32;
            let g = (y * 255 / height.max(1)) as f32;
            let b = (((x + y) / 2 + offset) % 256) as f32;
            let scale = |v: f32| (v * factor).min(255.0) as u8;
            if monochrome {
                let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                let l = scale(luma);
                Rgb([l, l, l])
            } else {
                Rgb([scale(r), scale(g), scale(b)])
            }
        });

        let mut buf = Vec::new();
        let quality = self.config.quality.clamp(1, 100) as u8;
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder
            .encode_image(&img)
            .map_err(|e| CameraError::Capture(format!("failed to encode JPEG: {}", e)))?;
        Ok(Bytes::from(buf))
    }
}

impl CameraBackend for TestPatternCamera {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn start_preview(&mut self) -> Result<(), CameraError> {
        self.preview_running = true;
        self.next_frame_at = Instant::now();
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<(), CameraError> {
        self.preview_running = false;
        Ok(())
    }

    fn next_preview_frame(&mut self, wait: Duration) -> Result<Option<Bytes>, CameraError> {
        if !self.preview_running {
            return Err(CameraError::Pipeline("preview is not running".to_string()));
        }

        let now = Instant::now();
        if self.next_frame_at > now {
            let remaining = self.next_frame_at - now;
            thread::sleep(remaining.min(wait));
            if remaining > wait {
                return Ok(None);
            }
        }

        self.frame_counter = self.frame_counter.wrapping_add(1);
        self.next_frame_at = Instant::now() + self.config.frame_interval();
        self.render(self.config.preview_width, self.config.preview_height)
            .map(Some)
    }

    fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        debug!(
            iso = %settings.iso,
            shutter = %settings.shutter,
            monochrome = settings.monochrome,
            "Test pattern settings applied"
        );
        self.settings = *settings;
        Ok(())
    }

    fn capture_still(&mut self) -> Result<Bytes, CameraError> {
        thread::sleep(self.config.settle);
        self.render(
            self.config.still_width.min(MAX_STILL_WIDTH),
            self.config.still_height.min(MAX_STILL_HEIGHT),
        )
    }

    fn reset(&mut self) -> Result<(), CameraError> {
        self.frame_counter = 0;
        self.next_frame_at = Instant::now();
        Ok(())
    }
}
