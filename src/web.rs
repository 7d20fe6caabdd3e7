//! Remote control surface: HTTP, MJPEG live stream and WebSocket control
//!
//! Every mutating request is turned into a [`Command`] and submitted to the
//! same queue the local surfaces use. Handlers only read the settings
//! store, the gallery index and the frame broadcaster.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandBus, CommandOutcome, CommandSource};
use crate::error::ControlError;
use crate::gallery::{validate_name, Gallery, ListQuery, SortOrder};
use crate::power::battery::{BatteryMonitor, BatteryStatus};
use crate::power::hotspot::{HotspotManager, HotspotState};
use crate::power::{ActivityTracker, DisplayReading, DisplayStatus};
use crate::settings::{CameraSettings, PowerState, SettingsSnapshot, SettingsStore};
use crate::streaming::{BroadcastStats, FrameBroadcaster, SessionInfo, SessionKind, SessionRegistry};

const BOUNDARY: &str = "FRAME";

/// Shared handles for every request handler
#[derive(Clone)]
pub struct AppState {
    pub bus: CommandBus,
    pub settings: SettingsStore,
    pub gallery: Arc<Gallery>,
    pub frames: Arc<FrameBroadcaster>,
    pub sessions: SessionRegistry,
    pub hotspot: HotspotManager,
    pub battery: BatteryMonitor,
    pub activity: ActivityTracker,
    pub display: DisplayStatus,
    pub web_dir: PathBuf,
    pub stream_fps_limit: u32,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::Busy | ControlError::StaleWrite { .. } => StatusCode::CONFLICT,
            ControlError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ControlError::HardwareFault(_)
            | ControlError::ExternalCommandFault { .. }
            | ControlError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::IoFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.to_body())).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(gallery_page))
        .route("/live", get(live_page))
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/settings", get(settings))
        .route("/api/photos", get(list_photos))
        .route("/api/photos/:name", delete(delete_photo))
        .route("/api/command", post(submit_command))
        .route("/photos/:name", get(download_photo))
        .route("/delete/:name", post(delete_photo_form))
        .route("/stream.mjpg", get(mjpeg_stream))
        .route("/preview.jpg", get(preview_still))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), track_activity))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Remote requests count as user activity and wake a dark display before
/// the handler runs. Health checks are not activity.
///
/// Submitted commands are woken by the controller after their version
/// check, so waking here would make their `expected_version` stale.
async fn track_activity(
    State(state): State<AppState>,
    info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let (is_activity, woken_by_controller) = {
        let path = request.uri().path();
        (path != "/health", path == "/api/command")
    };
    if is_activity {
        state.activity.touch();
        if !woken_by_controller && state.settings.read().settings.power != PowerState::Active {
            let session = state.sessions.open(SessionKind::Control, peer(info));
            match state
                .bus
                .submit(session.source(), Command::SetPower(PowerState::Active))
                .await
            {
                Ok(_) => debug!(session_id = session.id(), "Woke on remote request"),
                Err(e) => warn!(error = %e, "Remote wake failed"),
            }
        }
    }
    next.run(request).await
}

/// Serve until `shutdown` resolves
pub async fn run_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Web server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn peer(info: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    info.map(|ConnectInfo(addr)| addr.to_string())
}

/// Split the optional `expected_version` off a JSON command object
pub fn parse_command(mut value: Value) -> Result<(Command, Option<u64>), ControlError> {
    let expected = match value.as_object_mut().and_then(|o| o.remove("expected_version")) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            ControlError::InvalidValue("expected_version must be an unsigned integer".into())
        })?),
    };
    let command = serde_json::from_value(value)
        .map_err(|e| ControlError::InvalidValue(format!("bad command: {}", e)))?;
    Ok((command, expected))
}

#[derive(Serialize)]
struct CommandReply {
    outcome: CommandOutcome,
    settings: SettingsSnapshot,
}

async fn submit_command(
    State(state): State<AppState>,
    info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<Value>,
) -> Response {
    let session = state.sessions.open(SessionKind::Control, peer(info));
    let (command, expected) = match parse_command(body) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    let result = match state.bus.enqueue(session.source(), command, expected).await {
        Ok(pending) => pending.outcome().await,
        Err(e) => Err(e),
    };
    let snapshot = state.settings.read();
    session.observe_version(snapshot.version);

    match result {
        Ok(outcome) => Json(CommandReply {
            outcome,
            settings: snapshot,
        })
        .into_response(),
        // hand back what the client should re-base on
        Err(e @ ControlError::StaleWrite { .. }) => {
            let mut body = json!(e.to_body());
            body["settings"] = json!(snapshot);
            (StatusCode::CONFLICT, Json(body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusBody {
    settings: CameraSettings,
    version: u64,
    hotspot: HotspotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    hotspot_error: Option<String>,
    battery: Option<BatteryStatus>,
    display: Option<DisplayReading>,
    capture_in_flight: bool,
    photos: usize,
    sessions: Vec<SessionInfo>,
    stream: BroadcastStats,
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let snapshot = state.settings.read();
    Json(StatusBody {
        settings: snapshot.settings,
        version: snapshot.version,
        hotspot: state.hotspot.state(),
        hotspot_error: state.hotspot.last_error(),
        battery: state.battery.latest(),
        display: state.display.latest(),
        capture_in_flight: state.bus.capture_in_flight(),
        photos: state.gallery.len(),
        sessions: state.sessions.sessions(),
        stream: state.frames.stats(),
    })
}

async fn settings(State(state): State<AppState>) -> Json<SettingsSnapshot> {
    Json(state.settings.read())
}

async fn list_photos(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.gallery.list(&query))
}

async fn download_photo(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ControlError> {
    validate_name(&name)?;
    let asset = state
        .gallery
        .get(&name)
        .ok_or_else(|| ControlError::NotFound(name.clone()))?;
    let data = tokio::fs::read(&asset.path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", asset.name),
            ),
        ],
        data,
    )
        .into_response())
}

async fn remote_delete(
    state: &AppState,
    info: Option<ConnectInfo<SocketAddr>>,
    name: String,
) -> Result<CommandOutcome, ControlError> {
    let session = state.sessions.open(SessionKind::Control, peer(info));
    state
        .bus
        .submit(session.source(), Command::DeleteAsset(name))
        .await
}

async fn delete_photo(
    State(state): State<AppState>,
    info: Option<ConnectInfo<SocketAddr>>,
    Path(name): Path<String>,
) -> Result<Json<CommandOutcome>, ControlError> {
    remote_delete(&state, info, name).await.map(Json)
}

async fn delete_photo_form(
    State(state): State<AppState>,
    info: Option<ConnectInfo<SocketAddr>>,
    Path(name): Path<String>,
) -> Result<Redirect, ControlError> {
    remote_delete(&state, info, name).await?;
    Ok(Redirect::to("/"))
}

async fn preview_still(State(state): State<AppState>) -> Result<Response, ControlError> {
    let frame = state.frames.latest().ok_or(ControlError::Unavailable)?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        frame.data,
    )
        .into_response())
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Continuous `multipart/x-mixed-replace` stream. Each viewer has its own
/// session and subscription; a slow viewer only skips frames.
async fn mjpeg_stream(
    State(state): State<AppState>,
    info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let mut session = state.sessions.open(SessionKind::Stream, peer(info));
    session.attach_frames(&state.frames);
    let min_interval = Duration::from_secs(1) / state.stream_fps_limit.max(1);
    let activity = state.activity.clone();

    // a viewer watching the stream keeps the display from idling off
    let frames = stream::unfold((session, None::<Instant>), move |(mut session, last)| {
        let activity = activity.clone();
        async move {
            if let Some(last) = last {
                tokio::time::sleep_until(last + min_interval).await;
            }
            let frame = session.next_frame().await?;
            activity.touch();
            let part = multipart_part(&frame.data);
            Some((Ok::<_, Infallible>(part), (session, Some(Instant::now()))))
        }
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache, private".to_string()),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let peer = peer(info);
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

fn error_message(id: &Option<Value>, error: &ControlError) -> String {
    let mut msg = json!(error.to_body());
    msg["type"] = json!("error");
    msg["id"] = json!(id);
    msg.to_string()
}

/// Pushes every settings snapshot and hotspot state change, and accepts
/// commands in the same JSON shape as `POST /api/command`, plus an optional
/// `id` echoed in the reply
async fn handle_socket(socket: WebSocket, state: AppState, peer: Option<String>) {
    let session = state.sessions.open(SessionKind::Control, peer);
    let session_id = session.id();
    let source = session.source();
    let (mut sender, mut receiver) = socket.split();
    let mut updates = state.settings.subscribe();
    // new clients start from the current snapshot
    updates.mark_changed();
    let mut hotspot = state.hotspot.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    info!(session_id, "Control client connected");

    loop {
        let outgoing = tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *updates.borrow_and_update();
                session.observe_version(snapshot.version);
                json!({
                    "type": "settings",
                    "settings": snapshot.settings,
                    "version": snapshot.version,
                })
                .to_string()
            }
            changed = hotspot.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *hotspot.borrow_and_update();
                // a stale error from an earlier toggle is not shown mid-transition
                let error = if current.is_transitional() {
                    None
                } else {
                    state.hotspot.last_error()
                };
                json!({ "type": "hotspot", "state": current, "error": error }).to_string()
            }
            Some(reply) = reply_rx.recv() => reply,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match accept_ws_command(&state.bus, source, &text, &reply_tx).await {
                        Some(immediate) => immediate,
                        None => continue,
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(session_id, error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => continue,
            },
        };

        if sender.send(Message::Text(outgoing)).await.is_err() {
            break;
        }
    }

    info!(session_id, "Control client disconnected");
}

/// Queue one WebSocket command. Enqueueing happens inline so a client's
/// commands keep their order; the result is delivered through `replies`.
/// Returns a message to send right away when the command never queued.
async fn accept_ws_command(
    bus: &CommandBus,
    source: CommandSource,
    text: &str,
    replies: &mpsc::UnboundedSender<String>,
) -> Option<String> {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return Some(error_message(
                &None,
                &ControlError::InvalidValue(format!("malformed JSON: {}", e)),
            ))
        }
    };
    let id = value.as_object_mut().and_then(|o| o.remove("id"));

    let (command, expected) = match parse_command(value) {
        Ok(parsed) => parsed,
        Err(e) => return Some(error_message(&id, &e)),
    };
    debug!(%source, ?command, "WebSocket command");

    match bus.enqueue(source, command, expected).await {
        Ok(pending) => {
            let replies = replies.clone();
            tokio::spawn(async move {
                let msg = match pending.outcome().await {
                    Ok(outcome) => json!({ "type": "result", "id": id, "outcome": outcome }).to_string(),
                    Err(e) => error_message(&id, &e),
                };
                let _ = replies.send(msg);
            });
            None
        }
        Err(e) => Some(error_message(&id, &e)),
    }
}

async fn gallery_page(State(state): State<AppState>) -> Html<String> {
    let page = state.gallery.list(&ListQuery {
        page: Some(1),
        per_page: Some(200),
        order: SortOrder::Newest,
    });

    let mut items = String::new();
    for asset in &page.items {
        items.push_str(&format!(
            r#"<div class="photo"><a href="/photos/{name}"><img src="/photos/{name}" loading="lazy"></a><span>{stamp}</span><form method="post" action="/delete/{name}"><button>Delete</button></form></div>"#,
            name = asset.name,
            stamp = asset.timestamp.format("%Y-%m-%d %H:%M:%S"),
        ));
        items.push('\n');
    }
    if page.items.is_empty() {
        items.push_str("<p>No photos yet.</p>");
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Camera Gallery</title>
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background: #111; color: #eee; }}
        .grid {{ display: flex; flex-wrap: wrap; gap: 12px; }}
        .photo {{ width: 240px; }}
        .photo img {{ width: 100%; }}
        a {{ color: #8cf; }}
    </style>
</head>
<body>
    <h1>Gallery ({total})</h1>
    <p><a href="/live">Live view</a></p>
    <div class="grid">
{items}
    </div>
</body>
</html>"#,
        total = page.total,
        items = items,
    ))
}

/// `live.html` from the web directory, or a bare page when it is missing
async fn live_page(State(state): State<AppState>) -> Html<String> {
    let path = state.web_dir.join("live.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Html(html),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Live page template missing, using fallback");
            Html(LIVE_FALLBACK.to_string())
        }
    }
}

const LIVE_FALLBACK: &str = r#"<!DOCTYPE html>
<html>
<head><title>Live View</title></head>
<body>
    <h1>Live View</h1>
    <img src="/stream.mjpg" style="max-width: 100%">
    <button onclick="fetch('/api/command', {method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify({command: 'capture'})})">Capture</button>
    <p><a href="/">Gallery</a></p>
</body>
</html>"#;
