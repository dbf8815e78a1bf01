//! Latest-frame buffer
//!
//! Single-slot, latest-only: every decoded frame overwrites the previous
//! one. Readers get an `Arc` to the frame, so the decoder loop never waits
//! on a JPEG encode and the raw bytes are shared, not copied.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// One decoded frame in planar YUV 4:2:0
#[derive(Debug)]
pub struct LatestFrame {
    pub width: u32,
    pub height: u32,
    /// Y plane followed by U and V, `width * height * 3 / 2` bytes
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
    /// Monotonically increasing per store
    pub seq: u64,
}

/// Expected byte length of one planar 4:2:0 frame
pub fn yuv420_frame_len(width: u32, height: u32) -> usize {
    (width as usize * height as usize * 3) / 2
}

/// Watch-backed single slot holding the newest decoded frame
pub struct FrameStore {
    tx: watch::Sender<Option<Arc<LatestFrame>>>,
    /// Never resets, so seq comparisons survive decoder restarts
    next_seq: std::sync::atomic::AtomicU64,
}

impl FrameStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            next_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Overwrite the slot with a new frame
    pub fn publish(&self, width: u32, height: u32, data: Bytes) {
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let frame = Arc::new(LatestFrame {
            width,
            height,
            data,
            captured_at: Utc::now(),
            seq,
        });
        let _ = self.tx.send(Some(frame));
    }

    /// The newest frame, if any
    pub fn latest(&self) -> Option<Arc<LatestFrame>> {
        self.tx.borrow().clone()
    }

    /// Subscribe for change notifications
    pub fn watch(&self) -> watch::Receiver<Option<Arc<LatestFrame>>> {
        self.tx.subscribe()
    }

    /// Clear the slot (decoder restart)
    pub fn clear(&self) {
        let _ = self.tx.send(None);
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
