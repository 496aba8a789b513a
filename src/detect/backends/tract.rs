#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{BackendCapabilities, BackendKind, DetectParams, DetectorBackend};
use crate::detect::result::{non_max_suppression, Detection, Keypoint};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::geometry::BBox;

const CXCYWH: usize = 4;
const KPT_STEP: usize = 3;

/// ONNX detector for YOLO-style heads (`[1, 4 + classes + 3*keypoints, anchors]`).
///
/// Frames are nearest-neighbour resampled to the model input and boxes are
/// scaled back to frame pixels. The model is loaded from a local path only.
pub struct TractBackend {
    kind: BackendKind,
    model: Option<SimplePlan<TypedFact, Box<dyn TypedOp>>>,
    input_width: u32,
    input_height: u32,
    class_names: Vec<String>,
    keypoint_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        kind: BackendKind,
        model_path: P,
        input_width: u32,
        input_height: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            kind,
            model: Some(model),
            input_width,
            input_height,
            class_names: vec!["person".to_string()],
            keypoint_names: Vec::new(),
        })
    }

    pub fn with_classes(mut self, names: Vec<String>) -> Self {
        self.class_names = names;
        self
    }

    /// Declare a pose head with the given keypoint names.
    pub fn with_keypoints(mut self, names: Vec<String>) -> Self {
        self.keypoint_names = names;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let expected = rgb_len(frame)?;
        let pixels = frame.pixels();
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }
        let (fw, fh) = (frame.width as usize, frame.height as usize);
        let (iw, ih) = (self.input_width as usize, self.input_height as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, ih, iw), |(_, c, y, x)| {
            let sx = (x * fw / iw).min(fw - 1);
            let sy = (y * fh / ih).min(fh - 1);
            pixels[(sy * fw + sx) * 3 + c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        frame: &Frame,
        params: &DetectParams,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 {
            return Err(anyhow!("unexpected output rank {}", shape.len()));
        }
        let channels = shape[1];
        let anchors = shape[2];
        let nk = self.keypoint_names.len();
        let nc = channels
            .checked_sub(CXCYWH + nk * KPT_STEP)
            .filter(|nc| *nc > 0)
            .ok_or_else(|| anyhow!("output has {} channels, too few for head", channels))?;

        let sx = frame.width as f32 / self.input_width as f32;
        let sy = frame.height as f32 / self.input_height as f32;
        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (class_id, confidence) = (0..nc)
                .map(|c| (c, view[[0, CXCYWH + c, a]]))
                .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
            if confidence < params.confidence_threshold {
                continue;
            }
            let bbox = BBox::from_cxcywh(
                view[[0, 0, a]] * sx,
                view[[0, 1, a]] * sy,
                view[[0, 2, a]] * sx,
                view[[0, 3, a]] * sy,
            );
            let keypoints = self
                .keypoint_names
                .iter()
                .enumerate()
                .map(|(k, name)| {
                    let base = CXCYWH + nc + k * KPT_STEP;
                    Keypoint::new(
                        name.clone(),
                        view[[0, base, a]] * sx,
                        view[[0, base + 1, a]] * sy,
                        view[[0, base + 2, a]],
                    )
                })
                .collect();
            let name = self
                .class_names
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", class_id));
            candidates.push(
                Detection::new(class_id as u32, name, confidence, bbox).with_keypoints(keypoints),
            );
        }
        Ok(non_max_suppression(candidates, params.iou_threshold))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn capabilities(&self) -> BackendCapabilities {
        let mut caps = self.kind.capabilities();
        caps.supports_pose = !self.keypoint_names.is_empty();
        caps
    }

    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Result<Vec<Detection>> {
        let model = self.model.as_ref().ok_or_else(|| PipelineError::BackendUnavailable {
            backend: self.kind.as_str().to_string(),
            reason: "model released".to_string(),
        })?;
        let input = self.build_input(frame)?;
        let outputs = model
            .run(tvec!(input.into()))
            .map_err(|e| PipelineError::BackendUnavailable {
                backend: self.kind.as_str().to_string(),
                reason: format!("ONNX inference failed: {}", e),
            })?;
        self.decode(outputs, frame, params)
    }

    fn release(&mut self) {
        self.model = None;
    }
}

/// Byte length of an RGB buffer for `frame`. Empty frames are rejected.
fn rgb_len(frame: &Frame) -> Result<usize> {
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!(
            "frame {} has no pixels ({}x{})",
            frame.seq,
            frame.width,
            frame.height
        ));
    }
    (frame.width as usize)
        .checked_mul(frame.height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_frames_are_rejected_before_sampling() {
        assert!(rgb_len(&Frame::blank(0, 480, 0.0, 1)).is_err());
        assert!(rgb_len(&Frame::blank(640, 0, 0.0, 2)).is_err());
        assert_eq!(rgb_len(&Frame::blank(4, 2, 0.0, 3)).unwrap(), 24);
    }
}
