//! Scripted backend for tests and replay.
//!
//! Answers each frame from a per-sequence script, falling back to a default
//! reply. Can simulate outages and slow inference. The probe lets a test see
//! how often it ran and whether it was released.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::backend::{BackendCapabilities, BackendKind, DetectParams, DetectorBackend};
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

#[derive(Clone, Debug)]
enum Reply {
    Detections(Vec<Detection>),
    Unavailable,
    Stall(Duration, Vec<Detection>),
    Panic,
}

/// Observation handle shared with a `ScriptedBackend`.
#[derive(Clone, Debug, Default)]
pub struct ScriptProbe {
    calls: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
    released: Arc<AtomicBool>,
}

impl ScriptProbe {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that returned early because cancellation was requested.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBackend {
    kind: BackendKind,
    script: HashMap<u64, Reply>,
    fallback: Reply,
    probe: ScriptProbe,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            script: HashMap::new(),
            fallback: Reply::Detections(Vec::new()),
            probe: ScriptProbe::default(),
        }
    }

    /// Reply used for frames without a scripted entry.
    pub fn always(mut self, detections: Vec<Detection>) -> Self {
        self.fallback = Reply::Detections(detections);
        self
    }

    pub fn at(mut self, seq: u64, detections: Vec<Detection>) -> Self {
        self.script.insert(seq, Reply::Detections(detections));
        self
    }

    pub fn unavailable_at(mut self, seq: u64) -> Self {
        self.script.insert(seq, Reply::Unavailable);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.fallback = Reply::Unavailable;
        self
    }

    /// Take `delay` before answering `seq` with `detections`.
    pub fn stall_at(mut self, seq: u64, delay: Duration, detections: Vec<Detection>) -> Self {
        self.script.insert(seq, Reply::Stall(delay, detections));
        self
    }

    /// Panic inside `detect` for `seq`.
    pub fn panic_at(mut self, seq: u64) -> Self {
        self.script.insert(seq, Reply::Panic);
        self
    }

    pub fn stall(mut self, delay: Duration) -> Self {
        self.fallback = Reply::Stall(delay, Vec::new());
        self
    }

    pub fn probe(&self) -> ScriptProbe {
        self.probe.clone()
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.kind.capabilities()
    }

    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.script.get(&frame.seq).unwrap_or(&self.fallback).clone();
        match reply {
            Reply::Detections(detections) => Ok(detections),
            Reply::Unavailable => Err(PipelineError::BackendUnavailable {
                backend: self.kind.as_str().to_string(),
                reason: "scripted outage".to_string(),
            }
            .into()),
            Reply::Panic => panic!("scripted panic on frame {}", frame.seq),
            Reply::Stall(delay, detections) => {
                let until = Instant::now() + delay;
                while Instant::now() < until {
                    if params.cancel.is_cancelled() {
                        self.probe.cancelled.fetch_add(1, Ordering::SeqCst);
                        return Ok(Vec::new());
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(detections)
            }
        }
    }

    fn release(&mut self) {
        self.probe.released.store(true, Ordering::SeqCst);
    }
}
