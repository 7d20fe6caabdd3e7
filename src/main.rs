//! Camera control service entry point

use anyhow::{Context, Result};
use clap::Parser;
use picam_control::camera::platform::{detect_platform, has_board_peripherals};
use picam_control::camera::{open_backend, CameraWorker, CaptureConfig};
use picam_control::command::{self, CommandBus};
use picam_control::config::{CameraBackendKind, Config, ConfigError, InputConfig};
use picam_control::controller::{CameraController, ControllerTimeouts};
use picam_control::gallery::Gallery;
use picam_control::input::touch::{spawn_device_reader, GestureDecoder, TouchLayout, TouchSource};
use picam_control::power::battery::{open_gauge, BatteryMonitor};
use picam_control::power::hotspot::HotspotManager;
use picam_control::power::system::{ShellRunner, SystemCommands};
use picam_control::power::{spawn_idle_watcher, ActivityTracker, PowerManager};
use picam_control::settings::{CameraSettings, PowerState, SettingsStore};
use picam_control::streaming::{FrameBroadcaster, SessionRegistry};
use picam_control::web::{run_server, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const COMMAND_QUEUE_DEPTH: usize = 64;
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "picam-control")]
#[command(about = "Camera control with GPIO, touch and web surfaces for Raspberry Pi")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Use the synthetic camera and skip GPIO, touch and battery hardware
    #[arg(long)]
    test_mode: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    info!("picam-control starting");
    info!(config_path = %cli.config, "Loading configuration");

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(config_path = %cli.config, "Config file not found, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).context("failed to load configuration"),
    };

    if cli.test_mode {
        info!("Test mode: synthetic camera, no local input or battery hardware");
        config.camera.backend = CameraBackendKind::TestPattern;
        config.input.touch_device = None;
        config.battery.enabled = false;
    }

    let platform = detect_platform();
    info!(%platform, backend = ?config.camera.backend, "Platform detected");

    let gallery = Arc::new(
        Gallery::open(&config.storage.photos_dir).with_context(|| {
            format!("cannot open photo directory {}", config.storage.photos_dir.display())
        })?,
    );
    info!(
        photos_dir = %config.storage.photos_dir.display(),
        photos = gallery.len(),
        "Gallery indexed"
    );

    let settings = SettingsStore::new(CameraSettings::default());
    let frames = Arc::new(FrameBroadcaster::new());

    // no degraded mode without a camera
    let backend = open_backend(config.camera.backend, &config.camera)
        .context("failed to open camera")?;
    let capture = CaptureConfig::from(&config.camera);
    let camera = CameraWorker::spawn(
        backend,
        settings.read().settings,
        Arc::clone(&frames),
        capture.frame_interval(),
    )
    .context("failed to start camera")?;

    let runner: Arc<dyn SystemCommands> = Arc::new(ShellRunner::new(config.power.command_timeout()));
    let power = PowerManager::new(Arc::clone(&runner), config.power.clone());
    let display = power.display_status();
    let hotspot = HotspotManager::new(Arc::clone(&runner), config.hotspot.clone());
    if !cli.test_mode {
        if let Err(e) = power.check_display(PowerState::Active).await {
            warn!(error = %e, "Could not read display status");
        }
        match hotspot.refresh().await {
            Ok(state) => info!(%state, "Hotspot state"),
            Err(e) => warn!(error = %e, "Could not query hotspot state"),
        }
    }

    let activity = ActivityTracker::new();
    let (bus, queue) = command::channel(COMMAND_QUEUE_DEPTH);

    let controller = CameraController::new(
        camera,
        settings.clone(),
        Arc::clone(&gallery),
        power,
        hotspot.clone(),
        activity.clone(),
        ControllerTimeouts::from(&config.camera),
    );
    tokio::spawn(controller.run(queue));

    if let Some(timeout) = config.power.idle_timeout() {
        spawn_idle_watcher(activity.clone(), settings.clone(), bus.clone(), timeout);
        info!(idle_timeout_secs = timeout.as_secs(), "Idle display timeout armed");
    }

    let battery = BatteryMonitor::new();
    if let Some(gauge) = open_gauge(&config.battery) {
        battery.spawn_polling(gauge, Duration::from_secs(config.battery.poll_interval_secs));
        info!("Battery monitoring started");
    }

    let _button = if !cli.test_mode && has_board_peripherals(platform) {
        start_button(&config.input, bus.clone())
    } else {
        None
    };

    if let Some(device) = &config.input.touch_device {
        let (gestures, _reader) =
            spawn_device_reader(device.clone(), GestureDecoder::new(&config.input));
        let touch = TouchSource::new(
            bus.clone(),
            settings.clone(),
            Arc::clone(&gallery),
            TouchLayout::new(config.input.screen_width, config.input.screen_height),
        );
        tokio::spawn(touch.run(gestures));
    }

    let stats_frames = Arc::clone(&frames);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            stats_frames.log_stats();
        }
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind_ip, config.server.web_port)
        .parse()
        .context("invalid bind address")?;
    let state = AppState {
        bus,
        settings,
        gallery,
        frames,
        sessions: SessionRegistry::new(),
        hotspot,
        battery,
        activity,
        display,
        web_dir: config.server.web_dir.clone(),
        stream_fps_limit: config.server.stream_fps_limit,
    };

    info!("Service running, press Ctrl+C to stop");
    run_server(state, addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await
    .context("web server failed")?;

    Ok(())
}

#[cfg(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))]
fn start_button(
    config: &InputConfig,
    bus: CommandBus,
) -> Option<picam_control::input::gpio::ButtonPin> {
    use picam_control::input::gpio::{ButtonPin, ButtonSource};

    match ButtonPin::watch(config.button_pin) {
        Ok((pin, edges)) => {
            ButtonSource::new(bus, config.debounce()).spawn(edges);
            Some(pin)
        }
        Err(e) => {
            warn!(pin = config.button_pin, error = %e, "Shutter button unavailable");
            None
        }
    }
}

#[cfg(not(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64"))))]
fn start_button(config: &InputConfig, _bus: CommandBus) -> Option<()> {
    info!(pin = config.button_pin, "Built without GPIO support, shutter button disabled");
    None
}
