//! HTTP and WebSocket surface against a live controller

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{rig, rig_with_hotspot, Rig};
use futures_util::{SinkExt, StreamExt};
use picam_control::settings::PowerState;
use picam_control::web::router;
use picam_control::{Command, CommandSource};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

fn app(rig: &Rig) -> Router {
    router(rig.app_state())
}

async fn call(rig: &Rig, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app(rig).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn call_json(rig: &Rig, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call(rig, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn health_and_status_respond() {
    let rig = rig();
    let (status, body) = call_json(&rig, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call_json(&rig, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    assert_eq!(body["hotspot"], "off");
    assert_eq!(body["capture_in_flight"], false);
}

#[tokio::test]
async fn command_returns_outcome_and_fresh_settings() {
    let rig = rig();
    let (status, body) = call_json(
        &rig,
        Method::POST,
        "/api/command",
        Some(json!({ "command": "set_iso", "value": 400 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["outcome"], "settings");
    assert_eq!(body["settings"]["settings"]["iso"], "400");
    assert_eq!(body["settings"]["version"], 2);

    let (_, current) = call_json(&rig, Method::GET, "/api/settings", None).await;
    assert_eq!(current["settings"]["iso"], "400");
}

#[tokio::test]
async fn stale_write_is_rejected_with_current_settings() {
    let rig = rig();
    call(
        &rig,
        Method::POST,
        "/api/command",
        Some(json!({ "command": "set_iso", "value": 800 })),
    )
    .await;

    let (status, body) = call_json(
        &rig,
        Method::POST,
        "/api/command",
        Some(json!({ "command": "set_iso", "value": 100, "expected_version": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "stale_write");
    assert_eq!(body["current_version"], 2);
    assert_eq!(body["settings"]["settings"]["iso"], "800");
    assert_eq!(rig.settings.read().settings.iso.to_string(), "800");
}

#[tokio::test]
async fn malformed_command_is_bad_request() {
    let rig = rig();
    let (status, body) = call_json(
        &rig,
        Method::POST,
        "/api/command",
        Some(json!({ "command": "set_iso", "value": 123 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_value");
    assert_eq!(rig.settings.version(), 1);
}

#[tokio::test]
async fn captured_photo_can_be_listed_downloaded_and_deleted() {
    let rig = rig();
    let (status, body) = call_json(
        &rig,
        Method::POST,
        "/api/command",
        Some(json!({ "command": "capture" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["outcome"], "captured");
    let name = body["outcome"]["name"].as_str().unwrap().to_string();

    let (_, listing) = call_json(&rig, Method::GET, "/api/photos", None).await;
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["items"][0]["name"], name.as_str());

    let request = Request::get(format!("/photos/{}", name)).body(Body::empty()).unwrap();
    let response = app(&rig).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], common::JPEG);

    let (status, _) = call(&rig, Method::DELETE, &format!("/api/photos/{}", name), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(rig.gallery.is_empty());
    assert!(!rig.dir.path().join(&name).exists());

    let (status, _) = call(&rig, Method::GET, &format!("/photos/{}", name), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&rig, Method::GET, "/photos/bogus.jpg", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn form_delete_redirects_to_gallery() {
    let rig = rig();
    rig.bus
        .submit(CommandSource::Gpio, Command::Capture)
        .await
        .unwrap();
    let name = rig.gallery.list(&Default::default()).items[0].name.clone();

    let request = Request::post(format!("/delete/{}", name)).body(Body::empty()).unwrap();
    let response = app(&rig).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/");
    assert!(rig.gallery.is_empty());

    let (status, page) = call(&rig, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!String::from_utf8_lossy(&page).contains(&name));
}

#[tokio::test]
async fn preview_still_serves_latest_frame() {
    let rig = rig();
    timeout(WAIT, rig.wait_for_frame_after(0)).await.unwrap();

    let (status, bytes) = call(&rig, Method::GET, "/preview.jpg", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.starts_with(b"\xFF\xD8"));
}

#[tokio::test]
async fn mjpeg_viewer_session_ends_with_connection() {
    let rig = rig();
    let request = Request::get("/stream.mjpg").body(Body::empty()).unwrap();
    let response = app(&rig).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("multipart/x-mixed-replace"));

    let mut body = response.into_body().into_data_stream();
    let chunk = timeout(WAIT, body.next()).await.unwrap().unwrap().unwrap();
    assert!(chunk.starts_with(b"--FRAME\r\n"));
    assert_eq!(rig.sessions.active_sessions(), 1);
    assert_eq!(rig.frames.subscriber_count(), 1);

    drop(body);
    assert_eq!(rig.sessions.active_sessions(), 0);
    assert_eq!(rig.frames.subscriber_count(), 0);
}

async fn next_text_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    }
}

async fn set_power(rig: &Rig, target: PowerState) {
    rig.bus
        .submit(CommandSource::IdleTimer, Command::SetPower(target))
        .await
        .unwrap();
    assert_eq!(rig.settings.read().settings.power, target);
}

#[tokio::test]
async fn status_reports_display_reading() {
    let rig = rig();
    let (_, body) = call_json(&rig, Method::GET, "/api/status", None).await;
    assert!(body["display"].is_null());

    set_power(&rig, PowerState::MonitorOff).await;
    assert_eq!(rig.display.latest().map(|d| d.dark), Some(true));

    // health checks do not count as activity
    let (status, _) = call(&rig, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rig.settings.read().settings.power, PowerState::MonitorOff);

    let (_, body) = call_json(&rig, Method::GET, "/api/status", None).await;
    assert_eq!(body["settings"]["power"], "active");
    assert_eq!(body["display"]["dark"], false);
    assert_eq!(body["display"]["brightness"], 255);
}

#[tokio::test]
async fn versioned_command_on_dark_display_is_not_stale() {
    let rig = rig();
    set_power(&rig, PowerState::MonitorOff).await;
    let version = rig.settings.version();

    let (status, body) = call_json(
        &rig,
        Method::POST,
        "/api/command",
        Some(json!({ "command": "set_iso", "value": 200, "expected_version": version })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"]["settings"]["power"], "active");
    assert_eq!(body["settings"]["settings"]["iso"], "200");
    assert_eq!(rig.system.count("monitor-on"), 1);
}

#[tokio::test]
async fn stream_request_wakes_display_from_monitor_off() {
    let rig = rig();
    set_power(&rig, PowerState::MonitorOff).await;

    let request = Request::get("/stream.mjpg").body(Body::empty()).unwrap();
    let response = app(&rig).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(rig.settings.read().settings.power, PowerState::Active);
    assert_eq!(rig.system.count("monitor-on"), 1);

    let mut body = response.into_body().into_data_stream();
    for _ in 0..2 {
        let chunk = timeout(WAIT, body.next()).await.unwrap().unwrap().unwrap();
        assert!(chunk.starts_with(b"--FRAME\r\n"));
    }
    assert!(rig.activity.idle_for() < Duration::from_secs(1));
}

#[tokio::test]
async fn stream_request_wakes_display_from_standby() {
    let rig = rig();
    timeout(WAIT, rig.wait_for_frame_after(0)).await.unwrap();
    set_power(&rig, PowerState::Standby).await;
    let stale = rig.frames.latest().map(|f| f.sequence).unwrap_or(0);

    let request = Request::get("/stream.mjpg").body(Body::empty()).unwrap();
    let response = app(&rig).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(rig.settings.read().settings.power, PowerState::Active);
    assert_eq!(rig.system.count("standby-leave"), 1);

    // preview is running again: the viewer gets more than the stale frame
    let mut body = response.into_body().into_data_stream();
    for _ in 0..3 {
        let chunk = timeout(WAIT, body.next()).await.unwrap().unwrap().unwrap();
        assert!(chunk.starts_with(b"--FRAME\r\n"));
    }
    assert!(rig.frames.latest().map(|f| f.sequence).unwrap_or(0) > stale);
}

#[tokio::test]
async fn websocket_pushes_settings_and_answers_commands() {
    let rig = rig();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(&rig);
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let next_json = |msg: Message| -> Value {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    };

    let first = next_json(timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap());
    assert_eq!(first["type"], "settings");
    assert_eq!(first["version"], 1);

    ws.send(Message::Text(
        json!({ "id": 1, "command": "set_iso", "value": 800 }).to_string(),
    ))
    .await
    .unwrap();

    let (mut result, mut pushed) = (None, None);
    while result.is_none() || pushed.is_none() {
        let msg = next_json(timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap());
        match msg["type"].as_str() {
            Some("result") => result = Some(msg),
            Some("settings") => pushed = Some(msg),
            other => panic!("unexpected message type {:?}", other),
        }
    }
    let result = result.unwrap();
    assert_eq!(result["id"], 1);
    assert_eq!(result["outcome"]["outcome"], "settings");
    let pushed = pushed.unwrap();
    assert_eq!(pushed["settings"]["iso"], "800");
    assert_eq!(pushed["version"], 2);

    ws.send(Message::Text(json!({ "id": "x", "command": "warp" }).to_string()))
        .await
        .unwrap();
    let error = next_json(timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap());
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "x");
    assert_eq!(error["error"], "invalid_value");

    ws.close(None).await.unwrap();
    server.abort();
}

#[tokio::test]
async fn websocket_pushes_hotspot_timeout() {
    // the connection never comes up; the toggle gives up after 300ms
    let rig = rig_with_hotspot(u32::MAX, 300);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(&rig);
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    assert_eq!(next_text_json(&mut ws).await["type"], "settings");

    ws.send(Message::Text(
        json!({ "id": 7, "command": "toggle_hotspot" }).to_string(),
    ))
    .await
    .unwrap();

    let mut states = Vec::new();
    let failed = loop {
        let msg = next_text_json(&mut ws).await;
        if msg["type"] != "hotspot" {
            continue;
        }
        states.push(msg["state"].as_str().unwrap().to_string());
        if msg["state"] == "starting" {
            assert!(msg["error"].is_null());
        } else {
            break msg;
        }
    };
    assert_eq!(states, vec!["starting", "off"]);
    assert!(!failed["error"].as_str().unwrap().is_empty());
    assert_eq!(rig.hotspot.last_error(), failed["error"].as_str().map(String::from));

    ws.close(None).await.unwrap();
    server.abort();
}
