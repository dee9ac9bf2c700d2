//! Frame containers and the capture hand-off.
//!
//! - `RawFrame`: Immutable pixel buffer (height x width x channels) with capture metadata.
//! - `CaptureBuffer`: Single-slot, latest-wins cell shared by one capture thread and
//!   the pipeline thread.
//!
//! Frames are published as `Arc<RawFrame>`. The pipeline never sees a frame that the
//! capture thread can still mutate, and the lock is held only for the `Arc` swap.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// One captured image. Pixels are row-major, channel-interleaved `u8`.
#[derive(Clone, Debug)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1 (grayscale) or 3 (RGB).
    pub channels: u8,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Identifier of the source that produced this frame.
    pub source: String,
    /// Per-source sequence number, starting at 1.
    pub sequence: u64,
}

impl RawFrame {
    /// Create a frame, validating the buffer length against the dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
        source: impl Into<String>,
        sequence: u64,
    ) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(anyhow!("unsupported channel count {}", channels));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(channels as usize))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} bytes for {}x{}x{}, got {}",
                expected,
                width,
                height,
                channels,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            captured_at: Instant::now(),
            source: source.into(),
            sequence,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

// ----------------------------------------------------------------------------
// CaptureBuffer
// ----------------------------------------------------------------------------

/// Single-slot frame hand-off.
///
/// Each `publish` replaces whatever was in the slot; there is never more than one
/// frame held per source. `latest` returns `None` until the first publish and never
/// blocks on anything but the swap lock.
pub struct CaptureBuffer {
    source: String,
    slot: Mutex<Option<Arc<RawFrame>>>,
    published: AtomicU64,
}

impl CaptureBuffer {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            slot: Mutex::new(None),
            published: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Publish a frame, discarding any unread predecessor.
    pub fn publish(&self, frame: RawFrame) {
        let frame = Arc::new(frame);
        // The previous frame is dropped after the lock is released.
        let _previous = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.replace(frame)
        };
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Newest published frame, or `None` if nothing has been published yet.
    pub fn latest(&self) -> Option<Arc<RawFrame>> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    /// Total number of frames ever published into this slot.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
