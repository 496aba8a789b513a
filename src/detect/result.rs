use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// Named 2D pose point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(name: impl Into<String>, x: f32, y: f32, confidence: f32) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            confidence,
        }
    }
}

/// One object found in one frame by one backend.
///
/// Box coordinates are in frame pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keypoints: Vec<Keypoint>,
    /// Id of the backend that produced this detection. Stamped by the worker.
    #[serde(default)]
    pub backend_id: String,
}

impl Detection {
    pub fn new(class_id: u32, class_name: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
            keypoints: Vec::new(),
            backend_id: String::new(),
        }
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Keypoint>) -> Self {
        self.keypoints = keypoints;
        self
    }

    /// Same class, for matching purposes.
    pub fn same_class(&self, other: &Detection) -> bool {
        self.class_id == other.class_id
    }
}

/// Greedy class-aware NMS: highest confidence first, drop anything that
/// overlaps an already kept box of the same class above `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept
            .iter()
            .all(|k| !k.same_class(&det) || k.bbox.iou(&det.bbox) <= iou_threshold)
        {
            kept.push(det);
        }
    }
    kept
}
