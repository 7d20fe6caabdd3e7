use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::frame_broadcaster::{Frame, FrameBroadcaster, FrameSubscription};
use crate::command::CommandSource;

/// What a remote client connected for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// MJPEG live stream
    Stream,
    /// WebSocket control channel
    Control,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u32,
    pub kind: SessionKind,
    pub peer: Option<String>,
    pub connected_secs: u64,
    pub last_seen_version: Option<u64>,
}

struct SessionEntry {
    kind: SessionKind,
    peer: Option<String>,
    started_at: Instant,
    last_seen_version: Option<u64>,
}

/// Tracks connected remote clients
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<u32, SessionEntry>>>,
    session_counter: Arc<AtomicU32>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client; it is removed again when the returned
    /// session is dropped
    pub fn open(&self, kind: SessionKind, peer: Option<String>) -> RemoteSession {
        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let active = {
            let mut sessions = self.sessions.lock();
            sessions.insert(
                id,
                SessionEntry {
                    kind,
                    peer: peer.clone(),
                    started_at: Instant::now(),
                    last_seen_version: None,
                },
            );
            sessions.len()
        };

        info!(session_id = id, ?kind, peer = ?peer, active, "Remote session started");

        RemoteSession {
            id,
            registry: self.clone(),
            frames: None,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock();
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                kind: entry.kind,
                peer: entry.peer.clone(),
                connected_secs: entry.started_at.elapsed().as_secs(),
                last_seen_version: entry.last_seen_version,
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    fn close(&self, id: u32) {
        let removed = self.sessions.lock().remove(&id);
        if let Some(entry) = removed {
            info!(
                session_id = id,
                kind = ?entry.kind,
                duration_secs = entry.started_at.elapsed().as_secs(),
                "Remote session ended"
            );
        }
    }
}

/// One connected remote client.
///
/// Holds the client's own frame subscription. Dropping the session (the
/// connection closed) releases the subscription and nothing else.
pub struct RemoteSession {
    id: u32,
    registry: SessionRegistry,
    frames: Option<FrameSubscription>,
}

impl RemoteSession {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Command source identity for everything this client submits
    pub fn source(&self) -> CommandSource {
        CommandSource::Remote { session: self.id }
    }

    pub fn observe_version(&self, version: u64) {
        if let Some(entry) = self.registry.sessions.lock().get_mut(&self.id) {
            entry.last_seen_version = Some(version);
        }
    }

    pub fn last_seen_version(&self) -> Option<u64> {
        self.registry
            .sessions
            .lock()
            .get(&self.id)
            .and_then(|e| e.last_seen_version)
    }

    pub fn attach_frames(&mut self, broadcaster: &FrameBroadcaster) {
        if self.frames.is_none() {
            self.frames = Some(broadcaster.subscribe(format!("session-{}", self.id)));
        }
    }

    /// Next frame from this session's subscription, `None` if none is
    /// attached or the broadcaster has stopped
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.as_mut()?.next_frame().await
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Some(mut frames) = self.frames.take() {
            frames.unsubscribe();
        }
        debug!(session_id = self.id, "Dropping remote session");
        self.registry.close(self.id);
    }
}
