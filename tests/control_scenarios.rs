//! End-to-end scenarios through the command queue with scripted hardware

mod common;

use assert_matches::assert_matches;
use bytes::Bytes;
use common::{rig, rig_with, CaptureStep};
use picam_control::camera::CameraError;
use picam_control::command::{Command, CommandOutcome, CommandSource};
use picam_control::controller::ControllerTimeouts;
use picam_control::power::hotspot::HotspotState;
use picam_control::power::spawn_idle_watcher;
use picam_control::settings::{Iso, PowerState};
use picam_control::streaming::FrameBroadcaster;
use picam_control::ControlError;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_captures_never_overlap_and_all_get_answers() {
    let rig = rig();
    for _ in 0..4 {
        rig.camera.push(CaptureStep::Delay(Duration::from_millis(100)));
    }

    let mut tasks = Vec::new();
    for i in 0..12u32 {
        let bus = rig.bus.clone();
        let source = match i % 3 {
            0 => CommandSource::Gpio,
            1 => CommandSource::Touch,
            _ => CommandSource::Remote { session: i },
        };
        tasks.push(tokio::spawn(async move {
            bus.submit(source, Command::Capture).await
        }));
    }

    let (mut captured, mut busy) = (0, 0);
    for task in tasks {
        match timeout(WAIT, task).await.unwrap().unwrap() {
            Ok(CommandOutcome::Captured(_)) => captured += 1,
            Err(ControlError::Busy) => busy += 1,
            other => panic!("unexpected capture result: {:?}", other),
        }
    }

    assert_eq!(captured + busy, 12);
    assert!(captured >= 1);
    assert_eq!(rig.camera.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(rig.gallery.len(), captured);
}

#[tokio::test]
async fn captures_in_the_same_second_get_distinct_names() {
    let rig = rig();
    let mut names = HashSet::new();
    for _ in 0..3 {
        let outcome = rig.bus.submit(CommandSource::Gpio, Command::Capture).await;
        let asset = assert_matches!(outcome, Ok(CommandOutcome::Captured(asset)) => asset);
        assert!(rig.dir.path().join(&asset.name).exists());
        names.insert(asset.name);
    }
    assert_eq!(names.len(), 3);
    assert_eq!(rig.gallery.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_iso_changes_converge_on_last_applied() {
    let rig = rig();
    let mut observers: Vec<_> = (0..3).map(|_| rig.settings.subscribe()).collect();

    let requests = [
        (CommandSource::Remote { session: 1 }, Iso::Iso400),
        (CommandSource::Remote { session: 2 }, Iso::Iso800),
        (CommandSource::Touch, Iso::Iso100),
    ];
    let tasks: Vec<_> = requests
        .into_iter()
        .map(|(source, iso)| {
            let bus = rig.bus.clone();
            tokio::spawn(async move { bus.submit(source, Command::SetIso(iso)).await })
        })
        .collect();

    let mut snapshots = Vec::new();
    for task in tasks {
        let outcome = timeout(WAIT, task).await.unwrap().unwrap();
        snapshots.push(assert_matches!(outcome, Ok(CommandOutcome::Settings(s)) => s));
    }

    let versions: HashSet<u64> = snapshots.iter().map(|s| s.version).collect();
    assert_eq!(versions.len(), 3, "every mutation gets its own version");

    let last = snapshots.iter().max_by_key(|s| s.version).unwrap();
    let current = rig.settings.read();
    assert_eq!(current.settings.iso, last.settings.iso);
    assert_eq!(current.version, last.version);

    for observer in &mut observers {
        timeout(WAIT, observer.changed()).await.unwrap().unwrap();
        assert_eq!(*observer.borrow_and_update(), current);
    }
}

#[tokio::test]
async fn hotspot_toggle_while_starting_is_rejected_without_second_command() {
    let rig = rig();

    let first = rig
        .bus
        .submit(CommandSource::Remote { session: 1 }, Command::ToggleHotspot)
        .await;
    assert_matches!(
        first,
        Ok(CommandOutcome::Hotspot {
            state: HotspotState::Starting
        })
    );

    let second = rig.bus.submit(CommandSource::Touch, Command::ToggleHotspot).await;
    assert_matches!(second, Err(ControlError::Busy));

    let mut state = rig.hotspot.subscribe();
    timeout(WAIT, state.wait_for(|s| *s == HotspotState::On))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rig.system.count("nmcli con up"), 1);
}

#[tokio::test]
async fn capture_timeout_reports_fault_then_recovers() {
    let rig = rig_with(ControllerTimeouts {
        capture: Duration::from_millis(100),
        hardware: Duration::from_secs(2),
    });
    rig.camera.push(CaptureStep::Delay(Duration::from_millis(400)));

    let result = rig.bus.submit(CommandSource::Gpio, Command::Capture).await;
    assert_matches!(result, Err(ControlError::HardwareFault(_)));
    assert_eq!(rig.camera.resets.load(Ordering::SeqCst), 1);
    assert!(rig.gallery.is_empty());

    // preview production resumed
    let seen = rig.frames.latest().map(|f| f.sequence).unwrap_or(0);
    timeout(WAIT, rig.wait_for_frame_after(seen)).await.unwrap();

    let again = rig.bus.submit(CommandSource::Gpio, Command::Capture).await;
    assert_matches!(again, Ok(CommandOutcome::Captured(_)));
    assert_eq!(rig.gallery.len(), 1);
}

#[tokio::test]
async fn persistent_capture_failure_is_surfaced_after_one_retry() {
    let rig = rig();
    rig.camera
        .push(CaptureStep::Fail(CameraError::Capture("dma timeout".into())));
    rig.camera
        .push(CaptureStep::Fail(CameraError::Capture("dma timeout".into())));

    let result = rig.bus.submit(CommandSource::Touch, Command::Capture).await;
    assert_matches!(result, Err(ControlError::HardwareFault(_)));
    assert_eq!(rig.camera.captures.load(Ordering::SeqCst), 2);
    assert!(!rig.bus.capture_in_flight());
}

#[tokio::test]
async fn idle_timeout_blanks_display_and_interaction_wakes_it() {
    let rig = rig();
    let _watcher = spawn_idle_watcher(
        rig.activity.clone(),
        rig.settings.clone(),
        rig.bus.clone(),
        Duration::from_millis(150),
    );

    let mut updates = rig.settings.subscribe();
    timeout(
        WAIT,
        updates.wait_for(|s| s.settings.power == PowerState::MonitorOff),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(rig.system.count("monitor-off"), 1);

    rig.bus
        .submit(CommandSource::Remote { session: 9 }, Command::ToggleMonochrome)
        .await
        .unwrap();
    let snapshot = rig.settings.read();
    assert_eq!(snapshot.settings.power, PowerState::Active);
    assert!(snapshot.settings.monochrome);
    assert_eq!(rig.system.count("monitor-on"), 1);
}

#[tokio::test]
async fn standby_pauses_preview_until_wake() {
    let rig = rig();
    rig.bus
        .submit(CommandSource::Touch, Command::SetPower(PowerState::Standby))
        .await
        .unwrap();
    assert_eq!(rig.display.latest().map(|d| d.dark), Some(true));

    let published = rig.frames.stats().frames_published;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.frames.stats().frames_published, published);

    rig.bus
        .submit(CommandSource::Touch, Command::SetPower(PowerState::Active))
        .await
        .unwrap();
    let seen = rig.frames.latest().map(|f| f.sequence).unwrap_or(0);
    timeout(WAIT, rig.wait_for_frame_after(seen)).await.unwrap();
    assert_eq!(rig.display.latest().map(|d| d.brightness), Some(255));
    assert_eq!(
        *rig.system.calls.lock(),
        vec![
            "monitor-off",
            "standby-enter",
            "display-status",
            "standby-leave",
            "monitor-on",
            "display-status",
        ]
    );
}

#[tokio::test]
async fn stalled_viewer_never_slows_the_publisher() {
    let broadcaster = FrameBroadcaster::new();
    let _stalled = broadcaster.subscribe("stalled");

    let started = Instant::now();
    for i in 0..10_000u32 {
        broadcaster.publish(Bytes::from(i.to_be_bytes().to_vec()));
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    let latest = broadcaster.latest().unwrap().sequence;
    let mut late = broadcaster.subscribe("late");
    let first = late.next_frame().await.unwrap();
    assert!(first.sequence >= latest);
}
