//! Frames and the pull-based source boundary.
//!
//! - `Frame`: immutable pixel buffer shared by every backend worker for one tick.
//! - `FrameSource`: what the orchestrator pulls from. Ingestion (cameras, mobile
//!   clients, files) lives outside this crate and adapts to this trait.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One captured frame.
///
/// Pixel data is reference counted so fanning a frame out to N backend
/// workers never copies it.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Source-assigned sequence number, strictly increasing per source.
    pub seq: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp: f64, seq: u64) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            timestamp,
            seq,
        }
    }

    /// Frame with no pixel payload. Useful for backends that ignore pixels.
    pub fn blank(width: u32, height: u32, timestamp: f64, seq: u64) -> Self {
        Self::new(Vec::new(), width, height, timestamp, seq)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Content fingerprint of the pixel buffer.
    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(&self.data[..]).into()
    }
}

/// Outcome of a single poll of a frame source.
#[derive(Debug)]
pub enum FramePoll {
    Frame(Frame),
    /// Nothing arrived within the timeout; the source is still alive.
    NotReady,
    /// The source is gone. Reconnecting is the ingestion layer's job.
    Disconnected,
}

/// Pull-based frame source.
///
/// Implementations must not assume they are called at any particular rate.
pub trait FrameSource: Send {
    /// Wait at most `timeout` for the next frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Wall clock in fractional epoch seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
