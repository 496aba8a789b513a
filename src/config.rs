use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::alerts::AlertConfig;
use crate::detect::BackendKind;
use crate::error::PipelineError;
use crate::fusion::{FusionConfig, FusionStrategy};
use crate::ingest::SourceConfig;
use crate::pipeline::{ControlPlane, PipelineConfig};
use crate::presets;
use crate::tracker::TrackerConfig;
use crate::zones::{Zone, ZoneStore};

const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_MIN_FRAMES_INSIDE: u32 = 3;
const DEFAULT_MQTT_TOPIC: &str = "argos/alerts";

#[derive(Debug, Deserialize, Default)]
struct ArgosConfigFile {
    source: Option<SourceConfigFile>,
    backends: Option<Vec<BackendConfigFile>>,
    preset: Option<String>,
    fusion: Option<FusionConfig>,
    tracker: Option<TrackerConfig>,
    zones: Option<ZonesConfigFile>,
    alerts: Option<AlertsConfigFile>,
    pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BackendConfigFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    model: String,
    enabled: Option<bool>,
    weight: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ZonesConfigFile {
    min_frames_inside: Option<u32>,
    pool_defaults: Option<bool>,
    items: Option<Vec<Zone>>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    #[serde(flatten)]
    rules: AlertConfig,
    mqtt_broker: Option<String>,
    mqtt_topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub kind: String,
    pub model: String,
    pub enabled: bool,
    pub weight: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub broker: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct ArgosConfig {
    pub source: SourceConfig,
    pub preset: Option<String>,
    pub backends: Vec<BackendSpec>,
    pub fusion: FusionConfig,
    pub tracker: TrackerConfig,
    pub min_frames_inside: u32,
    pub zones: Vec<Zone>,
    pub alerts: AlertConfig,
    pub mqtt: Option<MqttSettings>,
    pub pipeline: PipelineConfig,
}

impl ArgosConfig {
    /// Defaults, then the file named by `ARGOS_CONFIG`, then `ARGOS_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ARGOS_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ArgosConfigFile) -> Result<Self> {
        let source_file = file.source.unwrap_or_default();
        let source = SourceConfig {
            url: source_file
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source_file.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source_file.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source_file.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
        };
        let mut pipeline = file.pipeline.unwrap_or_default();
        if let Some(timeout) = source_file.frame_timeout_ms {
            pipeline.frame_timeout_ms = timeout;
        }
        // With neither a preset nor explicit backends, run the stub so the
        // daemon has something to show.
        let backends = match file.backends {
            Some(list) => list
                .into_iter()
                .map(|b| BackendSpec {
                    kind: b.kind,
                    model: b.model,
                    enabled: b.enabled.unwrap_or(true),
                    weight: b.weight,
                })
                .collect(),
            None if file.preset.is_none() => vec![BackendSpec {
                kind: BackendKind::Stub.as_str().to_string(),
                model: String::new(),
                enabled: true,
                weight: None,
            }],
            None => Vec::new(),
        };
        let zones_file = file.zones.unwrap_or_default();
        let mut zones = Vec::new();
        if zones_file.pool_defaults.unwrap_or(false) {
            zones.extend(Zone::pool_defaults());
        }
        zones.extend(zones_file.items.unwrap_or_default());
        let alerts_file = file.alerts.unwrap_or_default();
        let mqtt = alerts_file.mqtt_broker.map(|broker| MqttSettings {
            broker,
            topic: alerts_file
                .mqtt_topic
                .clone()
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
        });
        Ok(Self {
            source,
            preset: file.preset,
            backends,
            fusion: file.fusion.unwrap_or_default(),
            tracker: file.tracker.unwrap_or_default(),
            min_frames_inside: zones_file
                .min_frames_inside
                .unwrap_or(DEFAULT_MIN_FRAMES_INSIDE),
            zones,
            alerts: alerts_file.rules,
            mqtt,
            pipeline,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("ARGOS_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(fps) = std::env::var("ARGOS_TARGET_FPS") {
            self.source.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("ARGOS_TARGET_FPS must be an integer"))?;
        }
        if let Ok(preset) = std::env::var("ARGOS_PRESET") {
            if !preset.trim().is_empty() {
                self.preset = Some(preset.trim().to_string());
            }
        }
        if let Ok(strategy) = std::env::var("ARGOS_FUSION_STRATEGY") {
            if !strategy.trim().is_empty() {
                self.fusion.strategy = strategy.parse::<FusionStrategy>()?;
            }
        }
        if let Ok(timeout) = std::env::var("ARGOS_BACKEND_TIMEOUT_MS") {
            self.pipeline.backend_timeout_ms = timeout
                .parse()
                .map_err(|_| anyhow!("ARGOS_BACKEND_TIMEOUT_MS must be an integer number of milliseconds"))?;
        }
        if let Ok(classes) = std::env::var("ARGOS_ALERT_CLASSES") {
            self.alerts.alert_classes = split_csv(&classes);
        }
        if let Ok(cooldown) = std::env::var("ARGOS_ALERT_COOLDOWN_SECS") {
            self.alerts.cooldown_seconds = cooldown
                .parse()
                .map_err(|_| anyhow!("ARGOS_ALERT_COOLDOWN_SECS must be a number of seconds"))?;
        }
        if let Ok(broker) = std::env::var("ARGOS_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                let topic = self
                    .mqtt
                    .as_ref()
                    .map(|m| m.topic.clone())
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string());
                self.mqtt = Some(MqttSettings { broker, topic });
            }
        }
        if let Ok(topic) = std::env::var("ARGOS_MQTT_TOPIC") {
            if let (Some(mqtt), false) = (self.mqtt.as_mut(), topic.trim().is_empty()) {
                mqtt.topic = topic;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { PipelineError::InvalidConfig(msg).into() };
        if self.source.target_fps == 0 {
            return Err(invalid("source.target_fps must be greater than zero".into()));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(invalid("source width and height must be greater than zero".into()));
        }
        if let Some(preset) = &self.preset {
            presets::find(preset)?;
        }
        for backend in &self.backends {
            backend.kind.parse::<BackendKind>()?;
            if let Some(weight) = backend.weight {
                if !(weight.is_finite() && weight > 0.0) {
                    return Err(invalid(format!("weight for {} backend must be > 0", backend.kind)));
                }
            }
        }
        self.fusion.validate()?;
        if !(0.0..=1.0).contains(&self.tracker.match_iou_threshold) {
            return Err(invalid("tracker.match_iou_threshold must be within [0, 1]".into()));
        }
        if self.min_frames_inside == 0 {
            return Err(invalid("zones.min_frames_inside must be greater than zero".into()));
        }
        // Validates every polygon, assigns missing ids and rejects duplicates.
        let mut store = ZoneStore::new();
        for zone in self.zones.drain(..) {
            store.create(zone)?;
        }
        self.zones = store.list().to_vec();
        self.alerts.validate()?;
        self.pipeline.validate()?;
        if let Some(mqtt) = &self.mqtt {
            crate::alerts::MqttEndpoint::parse(&mqtt.broker)?;
            if mqtt.topic.trim().is_empty() {
                return Err(invalid("alerts.mqtt_topic must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Build the shared control plane: preset first, then explicit
    /// backends, then zones.
    pub fn control_plane(&self) -> Result<ControlPlane> {
        let control = ControlPlane::new(
            self.fusion.clone(),
            self.tracker.clone(),
            self.alerts.clone(),
            self.min_frames_inside,
        );
        if let Some(preset) = &self.preset {
            control.apply_preset(preset)?;
        }
        for spec in &self.backends {
            let id = control.add_backend(&spec.kind, &spec.model)?;
            if let Some(weight) = spec.weight {
                control.set_backend_weight(&id, weight)?;
            }
            if !spec.enabled {
                control.set_backend_enabled(&id, false)?;
            }
        }
        for zone in &self.zones {
            control.create_zone(zone.clone())?;
        }
        Ok(control)
    }
}

fn read_config_file(path: &Path) -> Result<ArgosConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
