//! Latest-frame-wins distribution of preview frames
//!
//! The broadcaster keeps exactly one frame: the most recent. Publishing
//! overwrites that slot and wakes every waiting subscriber; it never
//! buffers history and never waits for a consumer. A subscriber that is
//! slower than the camera simply skips the frames it did not get to.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info};

/// One encoded preview image
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub data: Bytes,
}

/// Statistics for monitoring frame distribution
#[derive(Debug, Clone, serde::Serialize)]
pub struct BroadcastStats {
    pub frames_published: u64,
    pub latest_sequence: Option<u64>,
    pub subscribers: usize,
}

pub struct FrameBroadcaster {
    tx: watch::Sender<Option<Frame>>,
    next_sequence: AtomicU64,
    frames_published: AtomicU64,
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            next_sequence: AtomicU64::new(1),
            frames_published: AtomicU64::new(0),
        }
    }

    /// Overwrite the current frame and wake subscribers.
    ///
    /// Returns the sequence number assigned to the frame. Never blocks,
    /// whether or not anyone is subscribed.
    pub fn publish(&self, data: Bytes) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            sequence,
            data,
        };

        // with several producers a late writer must not roll the slot back
        self.tx.send_if_modified(|slot| match slot {
            Some(current) if current.sequence > sequence => false,
            _ => {
                *slot = Some(frame);
                true
            }
        });
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Start receiving frames. The first frame delivered is the one
    /// current at subscription time (if any) or a newer one.
    pub fn subscribe(&self, client_id: impl Into<String>) -> FrameSubscription {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        let client_id = client_id.into();
        info!(
            client = %client_id,
            subscribers = self.subscriber_count(),
            "Frame subscriber added"
        );
        FrameSubscription {
            rx: Some(rx),
            client_id,
            last_sequence: None,
            frames_received: 0,
            frames_skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            latest_sequence: self.tx.borrow().as_ref().map(|f| f.sequence),
            subscribers: self.subscriber_count(),
        }
    }

    /// Log statistics (call periodically for monitoring)
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            published = stats.frames_published,
            latest = ?stats.latest_sequence,
            subscribers = stats.subscribers,
            "Frame broadcast stats"
        );
    }
}

/// One consumer's view of the broadcast
pub struct FrameSubscription {
    rx: Option<watch::Receiver<Option<Frame>>>,
    client_id: String,
    last_sequence: Option<u64>,
    frames_received: u64,
    frames_skipped: u64,
}

#[derive(Debug, Clone)]
pub struct SubscriptionStats {
    pub client_id: String,
    pub frames_received: u64,
    pub frames_skipped: u64,
    pub last_sequence: Option<u64>,
}

impl FrameSubscription {
    /// Wait for a frame newer than the last one returned.
    ///
    /// Returns `None` once unsubscribed or when the broadcaster is gone.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let rx = self.rx.as_mut()?;
            if rx.changed().await.is_err() {
                debug!(client = %self.client_id, "Frame broadcaster closed");
                self.rx = None;
                return None;
            }
            let frame = rx.borrow_and_update().clone();

            let Some(frame) = frame else { continue };
            if let Some(last) = self.last_sequence {
                if frame.sequence <= last {
                    continue;
                }
                self.frames_skipped += frame.sequence - last - 1;
            }
            self.last_sequence = Some(frame.sequence);
            self.frames_received += 1;
            return Some(frame);
        }
    }

    /// Stop receiving. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            info!(
                client = %self.client_id,
                received = self.frames_received,
                skipped = self.frames_skipped,
                "Frame subscriber removed"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            client_id: self.client_id.clone(),
            frames_received: self.frames_received,
            frames_skipped: self.frames_skipped,
            last_sequence: self.last_sequence,
        }
    }

    /// Lazy frame stream; dropping it unsubscribes
    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let frame = sub.next_frame().await?;
            Some((frame, sub))
        })
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
