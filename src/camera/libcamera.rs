//! GStreamer-based libcamera backend

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::platform::{self, PlatformInfo};
use super::{CameraBackend, CameraError, CaptureConfig};
use crate::settings::CameraSettings;

/// Time allowed for the still pipeline to deliver its first buffer
const STILL_PULL_TIMEOUT: Duration = Duration::from_secs(3);

impl From<gst::glib::Error> for CameraError {
    fn from(e: gst::glib::Error) -> Self {
        CameraError::Pipeline(e.to_string())
    }
}

impl From<gst::glib::BoolError> for CameraError {
    fn from(e: gst::glib::BoolError) -> Self {
        CameraError::Pipeline(e.to_string())
    }
}

struct Stream {
    pipeline: gst::Pipeline,
    sink: gst_app::AppSink,
}

impl Stream {
    fn launch(description: &str) -> Result<Self, CameraError> {
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(description)?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| CameraError::Pipeline("Not a pipeline".to_string()))?;

        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Pipeline("No appsink found".to_string()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| CameraError::Pipeline("Not an appsink".to_string()))?;

        sink.set_property("max-buffers", 2u32);
        sink.set_property("drop", true);
        sink.set_property("emit-signals", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CameraError::Pipeline(format!("{:?}", e)))?;

        Ok(Self { pipeline, sink })
    }

    fn pull(&self, wait: Duration) -> Result<Option<Bytes>, CameraError> {
        let Some(sample) = self
            .sink
            .try_pull_sample(gst::ClockTime::from_nseconds(wait.as_nanos() as u64))
        else {
            if self.sink.is_eos() {
                return Err(CameraError::Capture("stream ended".to_string()));
            }
            return Ok(None);
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CameraError::Capture("sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CameraError::Capture("buffer not readable".to_string()))?;
        Ok(Some(Bytes::copy_from_slice(map.as_slice())))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// libcamera sensor through `libcamerasrc` (or the platform equivalent
/// when developing off-device)
pub struct LibcameraCamera {
    config: CaptureConfig,
    platform: PlatformInfo,
    settings: CameraSettings,
    preview: Option<Stream>,
}

impl LibcameraCamera {
    pub fn open(config: CaptureConfig) -> Result<Self, CameraError> {
        gst::init().map_err(|e| CameraError::Open(e.to_string()))?;

        let platform = platform::detect_platform();
        if gst::ElementFactory::find(source_factory(platform)).is_none() {
            return Err(CameraError::Open(format!(
                "GStreamer element {} is not installed",
                source_factory(platform)
            )));
        }

        info!(
            %platform,
            device = %config.device,
            preview = %format!("{}x{}@{}", config.preview_width, config.preview_height, config.preview_fps),
            still = %format!("{}x{}", config.still_width, config.still_height),
            quality = config.quality,
            "Opening libcamera backend"
        );

        Ok(Self {
            config,
            platform,
            settings: CameraSettings::default(),
            preview: None,
        })
    }

    fn pipeline_description(&self, width: u32, height: u32, fps: Option<u32>) -> String {
        let mut pipeline = source_with_controls(self.platform, &self.config.device, &self.settings);

        let rate = fps.map(|f| format!(",framerate={}/1", f)).unwrap_or_default();
        let format = if self.platform == PlatformInfo::RaspberryPi {
            "format=NV12,"
        } else {
            ""
        };
        pipeline.push_str(&format!(
            " ! video/x-raw,{}width={},height={}{}",
            format, width, height, rate
        ));

        if let Some(ref flip) = self.config.flip_method {
            pipeline.push_str(&flip_element(flip));
        }

        // libcamerasrc applies saturation itself
        if self.settings.monochrome && self.platform != PlatformInfo::RaspberryPi {
            pipeline.push_str(" ! videobalance saturation=0.0");
        }

        pipeline.push_str(&format!(
            " ! queue max-size-buffers=2 leaky=downstream ! videoconvert ! jpegenc quality={} ! appsink name=sink",
            self.config.quality
        ));

        pipeline
    }
}

fn source_factory(platform: PlatformInfo) -> &'static str {
    match platform {
        PlatformInfo::RaspberryPi => "libcamerasrc",
        PlatformInfo::MacOS => "avfvideosrc",
        PlatformInfo::Linux => "v4l2src",
    }
}

/// Source element with exposure controls where the source supports them
fn source_with_controls(platform: PlatformInfo, device: &str, settings: &CameraSettings) -> String {
    let mut source = platform::source_element(platform, device);
    if platform != PlatformInfo::RaspberryPi {
        return source;
    }

    match (settings.iso.analogue_gain(), settings.shutter.exposure_us()) {
        (None, None) => source.push_str(" ae-enable=true"),
        (gain, exposure) => {
            source.push_str(" ae-enable=false");
            if let Some(gain) = gain {
                source.push_str(&format!(" analogue-gain={:.2}", gain));
            }
            if let Some(us) = exposure {
                source.push_str(&format!(" exposure-time={}", us));
            }
        }
    }
    if settings.monochrome {
        source.push_str(" saturation=0.0");
    }
    source
}

/// Gets GStreamer flip element
fn flip_element(method: &str) -> String {
    match method {
        "vertical-flip" => " ! videoflip video-direction=5".to_string(),
        "horizontal-flip" => " ! videoflip video-direction=4".to_string(),
        "rotate-180" => " ! videoflip video-direction=2".to_string(),
        "rotate-90" => " ! videoflip video-direction=1".to_string(),
        "rotate-270" => " ! videoflip video-direction=3".to_string(),
        _ => {
            warn!(method = %method, "Unknown flip method");
            String::new()
        }
    }
}

impl CameraBackend for LibcameraCamera {
    fn name(&self) -> &str {
        "libcamera"
    }

    fn start_preview(&mut self) -> Result<(), CameraError> {
        if self.preview.is_some() {
            return Ok(());
        }
        let description = self.pipeline_description(
            self.config.preview_width,
            self.config.preview_height,
            Some(self.config.preview_fps),
        );
        self.preview = Some(Stream::launch(&description)?);
        info!("Preview pipeline started");
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<(), CameraError> {
        if let Some(stream) = self.preview.take() {
            stream
                .pipeline
                .set_state(gst::State::Null)
                .map_err(|e| CameraError::Pipeline(format!("{:?}", e)))?;
            info!("Preview pipeline stopped");
        }
        Ok(())
    }

    fn next_preview_frame(&mut self, wait: Duration) -> Result<Option<Bytes>, CameraError> {
        match self.preview.as_ref() {
            Some(stream) => stream.pull(wait),
            None => Err(CameraError::Pipeline("preview is not running".to_string())),
        }
    }

    fn apply_settings(&mut self, settings: &CameraSettings) -> Result<(), CameraError> {
        if self.settings == *settings {
            return Ok(());
        }
        self.settings = *settings;

        // controls are pipeline parameters, so a running preview is rebuilt
        if self.preview.is_some() {
            self.stop_preview()?;
            self.start_preview()?;
        }
        Ok(())
    }

    fn capture_still(&mut self) -> Result<Bytes, CameraError> {
        let description =
            self.pipeline_description(self.config.still_width, self.config.still_height, None);
        let stream = Stream::launch(&description)?;

        // let auto exposure converge before keeping a frame
        let settle_until = Instant::now() + self.config.settle;
        let deadline = Instant::now() + self.config.settle + STILL_PULL_TIMEOUT;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(CameraError::Capture("no still frame delivered".to_string()));
            }
            if let Some(jpeg) = stream.pull(deadline - now)? {
                if Instant::now() >= settle_until {
                    debug!(bytes = jpeg.len(), "Still captured");
                    return Ok(jpeg);
                }
            }
        }
    }

    fn reset(&mut self) -> Result<(), CameraError> {
        self.preview = None;
        Ok(())
    }
}
