use anyhow::Result;

use crate::detect::backend::{BackendCapabilities, BackendKind, DetectParams, DetectorBackend};
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::geometry::BBox;

const WALKER_W: f32 = 60.0;
const WALKER_H: f32 = 120.0;
const WALKER_STEP: f32 = 8.0;

/// Deterministic backend for demos and smoke tests.
///
/// Emits a single "person" walking left to right across the lower half of the
/// frame. Confidence rises on frames whose content changed since the last call.
pub struct StubBackend {
    last_fingerprint: Option<[u8; 32]>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            last_fingerprint: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendKind::Stub.capabilities()
    }

    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>> {
        let fingerprint = frame.fingerprint();
        let motion = self
            .last_fingerprint
            .map(|prev| prev != fingerprint)
            .unwrap_or(false);
        self.last_fingerprint = Some(fingerprint);

        let width = frame.width as f32;
        let height = frame.height as f32;
        if width <= WALKER_W || height <= WALKER_H {
            return Ok(Vec::new());
        }
        let lane = width - WALKER_W;
        let x1 = (frame.seq as f32 * WALKER_STEP) % lane;
        let y2 = height * 0.8;
        let confidence = if motion { 0.85 } else { 0.6 };
        if confidence < params.confidence_threshold {
            return Ok(Vec::new());
        }
        Ok(vec![Detection::new(
            0,
            "person",
            confidence,
            BBox::new(x1, y2 - WALKER_H, x1 + WALKER_W, y2),
        )])
    }
}
