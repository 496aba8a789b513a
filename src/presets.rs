//! Named backend + fusion bundles for common deployments.

use serde::Serialize;

use crate::detect::BackendKind;
use crate::error::PipelineError;
use crate::fusion::{ConfidenceAggregation, FusionConfig, FusionStrategy};

#[derive(Clone, Debug, Serialize)]
pub struct PresetBackend {
    pub kind: BackendKind,
    pub model: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct Preset {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub backends: Vec<PresetBackend>,
    pub fusion: FusionConfig,
}

fn backend(kind: BackendKind, model: &'static str) -> PresetBackend {
    PresetBackend { kind, model }
}

fn fusion(strategy: FusionStrategy) -> FusionConfig {
    FusionConfig {
        strategy,
        ..FusionConfig::default()
    }
}

pub const PRESET_IDS: [&str; 7] = [
    "home_security",
    "pet_monitor",
    "high_precision",
    "lab_research",
    "wildlife",
    "industrial",
    "custom",
];

pub fn all() -> Vec<Preset> {
    PRESET_IDS.iter().filter_map(|id| build(id)).collect()
}

/// Look up a preset. Unknown ids are a configuration error.
pub fn find(id: &str) -> anyhow::Result<Preset> {
    build(id).ok_or_else(|| {
        PipelineError::InvalidConfig(format!(
            "unknown preset '{}' (expected one of {})",
            id,
            PRESET_IDS.join(", ")
        ))
        .into()
    })
}

fn build(id: &str) -> Option<Preset> {
    use BackendKind::*;
    let preset = match id {
        "home_security" => Preset {
            id: "home_security",
            name: "Home Security",
            description: "People and pets, intrusion alerts",
            backends: vec![backend(Yolo, "yolo11n.onnx")],
            fusion: fusion(FusionStrategy::FirstWins),
        },
        "pet_monitor" => Preset {
            id: "pet_monitor",
            name: "Pet Monitor",
            description: "Pet tracking with skeleton overlay",
            backends: vec![
                backend(Yolo, "yolo11n.onnx"),
                backend(DeepLabCut, "superanimal_quadruped.onnx"),
            ],
            fusion: FusionConfig {
                prefer_pose_from: Some("deeplabcut".to_string()),
                ..fusion(FusionStrategy::Cascade)
            },
        },
        "high_precision" => Preset {
            id: "high_precision",
            name: "High Precision",
            description: "Two backends must agree",
            backends: vec![
                backend(Yolo, "yolo11m.onnx"),
                backend(DeepLabCut, "superanimal_quadruped.onnx"),
            ],
            fusion: FusionConfig {
                min_backends_agree: 2,
                confidence_aggregation: ConfidenceAggregation::Mean,
                ..fusion(FusionStrategy::Consensus)
            },
        },
        "lab_research" => Preset {
            id: "lab_research",
            name: "Lab Research",
            description: "High-speed multi-animal tracking",
            backends: vec![backend(Sleap, "custom_trained.onnx")],
            fusion: fusion(FusionStrategy::FirstWins),
        },
        "wildlife" => Preset {
            id: "wildlife",
            name: "Wildlife",
            description: "Wild animal detection with pose",
            backends: vec![
                backend(Yolo, "yolo11n.onnx"),
                backend(DeepLabCut, "superanimal_quadruped.onnx"),
            ],
            fusion: FusionConfig {
                prefer_pose_from: Some("deeplabcut".to_string()),
                ..fusion(FusionStrategy::Parallel)
            },
        },
        "industrial" => Preset {
            id: "industrial",
            name: "Industrial",
            description: "Object detection and workplace safety zones",
            backends: vec![backend(Yolo, "yolo11m.onnx")],
            fusion: fusion(FusionStrategy::FirstWins),
        },
        "custom" => Preset {
            id: "custom",
            name: "Custom",
            description: "Backends configured by hand",
            backends: Vec::new(),
            fusion: fusion(FusionStrategy::Parallel),
        },
        _ => return None,
    };
    Some(preset)
}
