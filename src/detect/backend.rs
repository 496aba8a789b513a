use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Fixed set of backend variants. Resolved from a string once, at add time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Yolo,
    #[serde(rename = "deeplabcut")]
    DeepLabCut,
    Sleap,
    Stub,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Yolo,
        BackendKind::DeepLabCut,
        BackendKind::Sleap,
        BackendKind::Stub,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Yolo => "yolo",
            BackendKind::DeepLabCut => "deeplabcut",
            BackendKind::Sleap => "sleap",
            BackendKind::Stub => "stub",
        }
    }

    /// Reliability weight used by the weighted strategy when none is configured.
    pub fn default_weight(&self) -> f32 {
        match self {
            BackendKind::Yolo => 1.0,
            BackendKind::DeepLabCut => 1.2,
            BackendKind::Sleap => 1.1,
            BackendKind::Stub => 1.0,
        }
    }

    /// Static capabilities of the variant.
    pub fn capabilities(&self) -> BackendCapabilities {
        use TargetKind::*;
        match self {
            BackendKind::Yolo => BackendCapabilities {
                supports_pose: true,
                supports_tracking_hint: false,
                max_fps: 30,
                targets: vec![Human, Quadruped, Bird],
                requires_gpu: false,
            },
            BackendKind::DeepLabCut => BackendCapabilities {
                supports_pose: true,
                supports_tracking_hint: true,
                max_fps: 15,
                targets: vec![Quadruped, Bird, Rodent],
                requires_gpu: true,
            },
            BackendKind::Sleap => BackendCapabilities {
                supports_pose: true,
                supports_tracking_hint: true,
                max_fps: 20,
                targets: vec![Rodent, Quadruped, Custom],
                requires_gpu: false,
            },
            BackendKind::Stub => BackendCapabilities {
                supports_pose: false,
                supports_tracking_hint: false,
                max_fps: 60,
                targets: vec![Custom],
                requires_gpu: false,
            },
        }
    }
}

impl FromStr for BackendKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolo" => Ok(BackendKind::Yolo),
            "deeplabcut" | "dlc" => Ok(BackendKind::DeepLabCut),
            "sleap" => Ok(BackendKind::Sleap),
            "stub" => Ok(BackendKind::Stub),
            _ => Err(PipelineError::UnknownBackendType(s.to_string())),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Human,
    Quadruped,
    Bird,
    Rodent,
    Custom,
}

/// What a backend can do, reported once and never per frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_pose: bool,
    pub supports_tracking_hint: bool,
    pub max_fps: u32,
    pub targets: Vec<TargetKind>,
    pub requires_gpu: bool,
}

/// Cooperative cancellation flag shared between the orchestrator and workers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call thresholds.
#[derive(Clone, Debug)]
pub struct DetectParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Long-running backends should poll this and bail out early.
    pub cancel: CancelToken,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            cancel: CancelToken::new(),
        }
    }
}

/// Detector backend contract.
///
/// A backend is a black box: frame in, detections out. Failures should be
/// reported as `PipelineError::BackendUnavailable` so the orchestrator can
/// treat them as "no detections this frame".
pub trait DetectorBackend: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Run detection on a frame. The pixel buffer is shared and read-only.
    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release model handles. Called exactly once, on the worker thread, before it exits.
    fn release(&mut self) {}
}
