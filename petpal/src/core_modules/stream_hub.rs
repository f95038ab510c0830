// THEORY:
// The `StreamHub` is the fan-out half of the single-producer design. The frame
// pump publishes each encoded frame once; every connected viewer holds a
// `ViewerSubscription` that reads from a bounded broadcast ring.
//
// - A slow viewer only ever falls behind its own cursor. When the ring
//   overflows the oldest frames are skipped for that viewer alone; the
//   producer and the other viewers are never blocked.
// - Dropping a subscription deregisters the viewer and frees its cursor. The
//   camera is untouched; it belongs to the `CaptureBroker`.
// - Closing the hub ends every subscription once buffered frames drain.

use bytes::Bytes;
use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// An encoded JPEG frame ready for delivery.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub seq: u64,
    pub captured_at: NaiveDateTime,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

struct HubInner {
    frames_tx: Mutex<Option<broadcast::Sender<FramePacket>>>,
    viewers: Mutex<BTreeSet<u64>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

impl StreamHub {
    /// `capacity` is the per-viewer backlog before the oldest frames are
    /// dropped.
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                frames_tx: Mutex::new(Some(frames_tx)),
                viewers: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Delivers `packet` to every current viewer. Returns how many received it.
    pub fn publish(&self, packet: FramePacket) -> usize {
        let frames_tx = self
            .inner
            .frames_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match frames_tx.as_ref() {
            // An error only means nobody is watching right now.
            Some(tx) => tx.send(packet).unwrap_or(0),
            None => 0,
        }
    }

    /// Registers a new viewer, or `None` once the hub is closed.
    pub fn subscribe(&self) -> Option<ViewerSubscription> {
        let receiver = {
            let frames_tx = self
                .inner
                .frames_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            frames_tx.as_ref()?.subscribe()
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        tracing::debug!(viewer = id, "viewer subscribed");

        Some(ViewerSubscription {
            id,
            receiver,
            hub: Arc::clone(&self.inner),
            dropped: 0,
        })
    }

    pub fn viewer_count(&self) -> usize {
        self.inner
            .viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn viewer_ids(&self) -> Vec<u64> {
        self.inner
            .viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Ends every subscription after its buffered frames.
    pub fn close(&self) {
        let closed = self
            .inner
            .frames_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if closed {
            tracing::info!("stream hub closed");
        }
    }
}

pub struct ViewerSubscription {
    id: u64,
    receiver: broadcast::Receiver<FramePacket>,
    hub: Arc<HubInner>,
    dropped: u64,
}

impl ViewerSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Frames this viewer skipped because it fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Waits for the next frame. `None` means the hub closed.
    pub async fn next_frame(&mut self) -> Option<FramePacket> {
        loop {
            match self.receiver.recv().await {
                Ok(packet) => return Some(packet),
                Err(RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    tracing::debug!(viewer = self.id, skipped, "viewer lagging, oldest frames dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ViewerSubscription {
    fn drop(&mut self) {
        self.hub
            .viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        tracing::debug!(viewer = self.id, dropped = self.dropped, "viewer unsubscribed");
    }
}
