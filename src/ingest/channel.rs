//! Push-to-pull adapter for external ingestion.
//!
//! An ingestion layer (camera reader, mobile upload handler) holds a
//! `FrameFeeder` and pushes frames; the orchestrator pulls from the paired
//! `ChannelSource`. The queue is bounded and keeps the newest frames.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FramePoll, FrameSource};

struct Shared {
    state: Mutex<ChannelState>,
    ready: Condvar,
}

struct ChannelState {
    frames: VecDeque<Frame>,
    capacity: usize,
    feeders: usize,
    dropped: u64,
}

/// Create a bounded feeder/source pair.
pub fn frame_channel(capacity: usize) -> (FrameFeeder, ChannelSource) {
    let shared = Arc::new(Shared {
        state: Mutex::new(ChannelState {
            frames: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            feeders: 1,
            dropped: 0,
        }),
        ready: Condvar::new(),
    });
    (
        FrameFeeder {
            shared: shared.clone(),
        },
        ChannelSource { shared },
    )
}

/// Producer half. Cloneable; the source disconnects when every feeder is dropped.
pub struct FrameFeeder {
    shared: Arc<Shared>,
}

impl FrameFeeder {
    /// Queue a frame. When full the oldest pending frame is discarded.
    pub fn push(&self, frame: Frame) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow!("frame channel lock poisoned"))?;
        if state.frames.len() >= state.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            log::debug!("frame channel full, dropped oldest (total {})", state.dropped);
        }
        state.frames.push_back(frame);
        drop(state);
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Clone for FrameFeeder {
    fn clone(&self) -> Self {
        if let Ok(mut state) = self.shared.state.lock() {
            state.feeders += 1;
        }
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for FrameFeeder {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.feeders = state.feeders.saturating_sub(1);
        }
        self.shared.ready.notify_all();
    }
}

/// Consumer half handed to the pipeline.
pub struct ChannelSource {
    shared: Arc<Shared>,
}

impl ChannelSource {
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow!("frame channel lock poisoned"))?;
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(FramePoll::Frame(frame));
            }
            if state.feeders == 0 {
                return Ok(FramePoll::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(FramePoll::NotReady);
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| anyhow!("frame channel lock poisoned"))?;
            state = guard;
        }
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}
