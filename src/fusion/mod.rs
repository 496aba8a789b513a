//! Multi-backend fusion.
//!
//! Turns the per-backend detection lists for one frame into a single list of
//! fused detections. All IoU matching breaks ties by confidence (descending)
//! and then backend registration order, so identical inputs always fuse to
//! identical outputs.

mod strategies;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::detect::{BackendKind, Detection, Keypoint};
use crate::error::PipelineError;
use crate::geometry::BBox;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    #[default]
    Parallel,
    Consensus,
    Cascade,
    Weighted,
    FirstWins,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionStrategy::Parallel => "parallel",
            FusionStrategy::Consensus => "consensus",
            FusionStrategy::Cascade => "cascade",
            FusionStrategy::Weighted => "weighted",
            FusionStrategy::FirstWins => "first_wins",
        }
    }
}

impl FromStr for FusionStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(FusionStrategy::Parallel),
            "consensus" => Ok(FusionStrategy::Consensus),
            "cascade" => Ok(FusionStrategy::Cascade),
            "weighted" => Ok(FusionStrategy::Weighted),
            "first_wins" | "first-wins" => Ok(FusionStrategy::FirstWins),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown fusion strategy '{}'",
                other
            ))),
        }
    }
}

/// How matched confidences collapse into one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceAggregation {
    #[default]
    Max,
    Mean,
    Min,
}

impl ConfidenceAggregation {
    pub fn apply(&self, values: &[f32]) -> f32 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            ConfidenceAggregation::Max => values.iter().copied().fold(f32::MIN, f32::max),
            ConfidenceAggregation::Min => values.iter().copied().fold(f32::MAX, f32::min),
            ConfidenceAggregation::Mean => values.iter().sum::<f32>() / values.len() as f32,
        }
    }
}

impl FromStr for ConfidenceAggregation {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(ConfidenceAggregation::Max),
            "mean" | "avg" => Ok(ConfidenceAggregation::Mean),
            "min" => Ok(ConfidenceAggregation::Min),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown confidence aggregation '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub strategy: FusionStrategy,
    pub min_backends_agree: usize,
    pub iou_threshold: f32,
    pub confidence_aggregation: ConfidenceAggregation,
    /// Backend id or kind name whose keypoints win when several backends report pose.
    pub prefer_pose_from: Option<String>,
    /// Cascade coarse detector (backend id). Defaults to the first yolo backend.
    pub primary_backend: Option<String>,
    /// Cascade refiner (backend id). Defaults to the first pose-capable backend.
    pub secondary_backend: Option<String>,
    /// Reliability weights keyed by backend id or kind name.
    pub backend_weights: HashMap<String, f32>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Parallel,
            min_backends_agree: 1,
            iou_threshold: 0.5,
            confidence_aggregation: ConfidenceAggregation::Max,
            prefer_pose_from: None,
            primary_backend: None,
            secondary_backend: None,
            backend_weights: HashMap::new(),
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(PipelineError::InvalidConfig(
                "fusion iou_threshold must be within [0, 1]".to_string(),
            )
            .into());
        }
        for (key, weight) in &self.backend_weights {
            if !(weight.is_finite() && *weight > 0.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "fusion weight for '{}' must be > 0",
                    key
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Everything fusion needs to know about one backend's answer for a frame.
#[derive(Clone, Debug)]
pub struct BackendOutput {
    pub backend_id: String,
    pub kind: BackendKind,
    pub order: u64,
    pub weight: f32,
    pub supports_pose: bool,
    /// False when the backend failed or timed out this frame.
    pub responded: bool,
    pub detections: Vec<Detection>,
}

impl BackendOutput {
    fn matches(&self, key: &str) -> bool {
        self.backend_id == key || self.kind.as_str() == key
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedDetection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keypoints: Vec<Keypoint>,
    /// Backend ids that contributed, in registration order.
    pub contributors: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FusionResult {
    pub detections: Vec<FusedDetection>,
    pub strategy: &'static str,
    /// Backends that produced an answer this frame.
    pub backends_used: Vec<String>,
}

/// Stateful wrapper that remembers which misconfigurations it already warned about.
pub struct FusionEngine {
    config: FusionConfig,
    warned: Option<String>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            warned: None,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Swap configuration. Takes effect from the next `fuse` call.
    pub fn set_config(&mut self, config: FusionConfig) {
        if config != self.config {
            log::info!("fusion strategy set to {}", config.strategy.as_str());
            self.config = config;
            self.warned = None;
        }
    }

    /// Fuse one frame. `outputs` holds every enabled backend, responding or not.
    pub fn fuse(&mut self, outputs: &[BackendOutput]) -> FusionResult {
        let mut outputs: Vec<BackendOutput> = outputs.to_vec();
        outputs.sort_by_key(|o| o.order);
        for output in &mut outputs {
            output.weight = self.resolve_weight(output);
        }
        let backends_used = outputs
            .iter()
            .filter(|o| o.responded)
            .map(|o| o.backend_id.clone())
            .collect();
        if let Some(problem) = self.misconfiguration(&outputs) {
            if self.warned.as_deref() != Some(problem.as_str()) {
                log::warn!("{}", PipelineError::FusionStrategyMisconfigured(problem.clone()));
                self.warned = Some(problem);
            }
        }
        let detections = if outputs.is_empty() {
            Vec::new()
        } else {
            match self.config.strategy {
                FusionStrategy::Parallel => strategies::parallel(&outputs, &self.config),
                FusionStrategy::Consensus => strategies::consensus(&outputs, &self.config),
                FusionStrategy::Cascade => strategies::cascade(&outputs, &self.config),
                FusionStrategy::Weighted => strategies::weighted(&outputs, &self.config),
                FusionStrategy::FirstWins => strategies::first_wins(&outputs),
            }
        };
        FusionResult {
            detections,
            strategy: self.config.strategy.as_str(),
            backends_used,
        }
    }

    fn resolve_weight(&self, output: &BackendOutput) -> f32 {
        self.config
            .backend_weights
            .get(&output.backend_id)
            .or_else(|| self.config.backend_weights.get(output.kind.as_str()))
            .copied()
            .unwrap_or(output.weight)
    }

    fn misconfiguration(&self, outputs: &[BackendOutput]) -> Option<String> {
        match self.config.strategy {
            FusionStrategy::Consensus if self.config.min_backends_agree == 0 => {
                Some("min_backends_agree=0 treated as 1".to_string())
            }
            FusionStrategy::Consensus
                if !outputs.is_empty() && self.config.min_backends_agree > outputs.len() =>
            {
                Some(format!(
                    "min_backends_agree={} exceeds {} enabled backends; consensus is unsatisfiable",
                    self.config.min_backends_agree,
                    outputs.len()
                ))
            }
            FusionStrategy::Cascade if outputs.len() < 2 => Some(
                "cascade needs a primary and a secondary backend; primary output is passed through"
                    .to_string(),
            ),
            _ => None,
        }
    }
}
