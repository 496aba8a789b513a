//! Synthetic `stub://` source.
//!
//! Paces frames at the configured rate and changes the scene every 50 frames
//! so fingerprint-based backends see motion.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::frame::{now_secs, Frame, FramePoll, FrameSource};

use super::SourceConfig;

pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    scene_state: u8,
    next_due: Instant,
    interval: Duration,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        let fps = config.target_fps.max(1);
        log::info!("SyntheticSource: {} at {} fps (synthetic)", config.url, fps);
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            next_due: Instant::now(),
            interval: Duration::from_secs_f64(1.0 / fps as f64),
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.scene_state as u64 * 31) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<FramePoll> {
        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(FramePoll::NotReady);
            }
            std::thread::sleep(wait);
        }
        self.next_due = Instant::now() + self.interval;
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(FramePoll::Frame(Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            now_secs(),
            self.frame_count,
        )))
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }
}
