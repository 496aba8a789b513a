use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::detect::backend::{BackendCapabilities, BackendKind, DetectorBackend, TargetKind};
use crate::detect::backends::{StubBackend, UnloadedBackend};
use crate::detect::worker::BackendWorker;
use crate::error::PipelineError;

/// Builds a backend for a kind and model identifier.
pub type BackendFactory =
    Box<dyn Fn(BackendKind, &str) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Ok,
    Unavailable,
    TimedOut,
}

/// Externally visible view of one registered backend.
#[derive(Clone, Debug, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub kind: BackendKind,
    pub model: String,
    pub enabled: bool,
    pub weight: f32,
    pub capabilities: BackendCapabilities,
    pub health: BackendHealth,
    pub consecutive_failures: u32,
}

/// Union of what the enabled backends can do.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CombinedCapabilities {
    pub supports_pose: bool,
    pub supports_tracking_hint: bool,
    /// Slowest enabled backend bounds the pipeline.
    pub max_fps: Option<u32>,
    pub targets: Vec<TargetKind>,
    pub backends_count: usize,
}

/// Per-frame view of an enabled backend.
#[derive(Clone)]
pub struct ActiveBackend {
    pub id: String,
    pub kind: BackendKind,
    /// Registration index, used for deterministic tie-breaks.
    pub order: u64,
    pub weight: f32,
    pub supports_pose: bool,
    pub worker: Arc<BackendWorker>,
}

struct BackendEntry {
    id: String,
    kind: BackendKind,
    model: String,
    enabled: bool,
    weight: Option<f32>,
    order: u64,
    capabilities: BackendCapabilities,
    health: BackendHealth,
    consecutive_failures: u32,
    worker: Arc<BackendWorker>,
}

impl BackendEntry {
    fn weight(&self) -> f32 {
        self.weight.unwrap_or_else(|| self.kind.default_weight())
    }
}

/// Runtime registry of detector backends, in registration order.
///
/// Each backend runs on its own worker thread from the moment it is added
/// until it is removed. Kind strings are resolved once, here.
pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
    factories: HashMap<BackendKind, BackendFactory>,
    counter: u64,
}

impl BackendRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
            factories: HashMap::new(),
            counter: 0,
        };
        registry.register_factory(BackendKind::Stub, Box::new(|_, _| Ok(Box::new(StubBackend::new()))));
        for kind in [BackendKind::Yolo, BackendKind::DeepLabCut, BackendKind::Sleap] {
            registry.register_factory(kind, Box::new(model_backend));
        }
        registry
    }

    /// Replace the constructor used for a kind.
    pub fn register_factory(&mut self, kind: BackendKind, factory: BackendFactory) {
        self.factories.insert(kind, factory);
    }

    /// Add a backend by type name and model identifier. Returns the new id.
    ///
    /// A model that fails to load still registers, as an unavailable backend.
    pub fn add(&mut self, kind: &str, model: &str) -> Result<String> {
        let kind: BackendKind = kind.parse()?;
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| PipelineError::UnknownBackendType(kind.to_string()))?;
        let (backend, health) = match factory(kind, model) {
            Ok(backend) => (backend, BackendHealth::Ok),
            Err(e) => {
                log::warn!("backend {} model '{}' not loaded: {}", kind, model, e);
                let unloaded: Box<dyn DetectorBackend> =
                    Box::new(UnloadedBackend::new(kind, e.to_string()));
                (unloaded, BackendHealth::Unavailable)
            }
        };
        self.install(kind, model, backend, health)
    }

    /// Add an already constructed backend under a type name.
    pub fn add_prepared(
        &mut self,
        kind: &str,
        model: &str,
        backend: Box<dyn DetectorBackend>,
    ) -> Result<String> {
        let kind: BackendKind = kind.parse()?;
        self.install(kind, model, backend, BackendHealth::Ok)
    }

    fn install(
        &mut self,
        kind: BackendKind,
        model: &str,
        backend: Box<dyn DetectorBackend>,
        health: BackendHealth,
    ) -> Result<String> {
        let id = format!("{}_{}", kind, self.counter + 1);
        let capabilities = backend.capabilities();
        let worker = BackendWorker::spawn(id.clone(), backend)?;
        self.counter += 1;
        self.entries.push(BackendEntry {
            id: id.clone(),
            kind,
            model: model.to_string(),
            enabled: true,
            weight: None,
            order: self.counter,
            capabilities,
            health,
            consecutive_failures: 0,
            worker: Arc::new(worker),
        });
        log::info!("backend {} added (model '{}')", id, model);
        Ok(id)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.enabled != enabled {
            entry.enabled = enabled;
            log::info!(
                "backend {} {}",
                id,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(())
    }

    pub fn set_weight(&mut self, id: &str, weight: f32) -> Result<()> {
        if !(weight.is_finite() && weight > 0.0) {
            return Err(
                PipelineError::InvalidConfig(format!("weight for {} must be > 0", id)).into(),
            );
        }
        self.entry_mut(id)?.weight = Some(weight);
        Ok(())
    }

    /// Detach a backend. Dropping the returned worker stops its thread and
    /// releases the model, so callers should drop it outside any lock.
    pub fn remove(&mut self, id: &str) -> Result<Arc<BackendWorker>> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| PipelineError::BackendNotFound(id.to_string()))?;
        let entry = self.entries.remove(pos);
        log::info!("backend {} removed", id);
        Ok(entry.worker)
    }

    /// Detach every backend.
    pub fn clear(&mut self) -> Vec<Arc<BackendWorker>> {
        self.entries.drain(..).map(|e| e.worker).collect()
    }

    pub fn capabilities(&self, id: &str) -> Result<BackendCapabilities> {
        Ok(self.entry(id)?.capabilities.clone())
    }

    pub fn status(&self, id: &str) -> Result<BackendStatus> {
        Ok(status_of(self.entry(id)?))
    }

    pub fn list(&self) -> Vec<BackendStatus> {
        self.entries.iter().map(status_of).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.iter().filter(|e| e.enabled).count()
    }

    pub fn combined_capabilities(&self) -> CombinedCapabilities {
        let enabled: Vec<&BackendEntry> = self.entries.iter().filter(|e| e.enabled).collect();
        let targets: BTreeSet<TargetKind> = enabled
            .iter()
            .flat_map(|e| e.capabilities.targets.iter().copied())
            .collect();
        CombinedCapabilities {
            supports_pose: enabled.iter().any(|e| e.capabilities.supports_pose),
            supports_tracking_hint: enabled.iter().any(|e| e.capabilities.supports_tracking_hint),
            max_fps: enabled.iter().map(|e| e.capabilities.max_fps).min(),
            targets: targets.into_iter().collect(),
            backends_count: enabled.len(),
        }
    }

    /// Enabled backends in registration order.
    pub fn active(&self) -> Vec<ActiveBackend> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| ActiveBackend {
                id: e.id.clone(),
                kind: e.kind,
                order: e.order,
                weight: e.weight(),
                supports_pose: e.capabilities.supports_pose,
                worker: e.worker.clone(),
            })
            .collect()
    }

    /// Record how a backend fared on the last frame. Unknown ids are ignored,
    /// since the backend may have been removed mid-frame.
    pub fn record_outcome(&mut self, id: &str, health: BackendHealth) {
        if let Ok(entry) = self.entry_mut(id) {
            if health == BackendHealth::Ok {
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
            }
            entry.health = health;
        }
    }

    fn entry(&self, id: &str) -> Result<&BackendEntry> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| PipelineError::BackendNotFound(id.to_string()).into())
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut BackendEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| PipelineError::BackendNotFound(id.to_string()).into())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn status_of(e: &BackendEntry) -> BackendStatus {
    BackendStatus {
        id: e.id.clone(),
        kind: e.kind,
        model: e.model.clone(),
        enabled: e.enabled,
        weight: e.weight(),
        capabilities: e.capabilities.clone(),
        health: e.health,
        consecutive_failures: e.consecutive_failures,
    }
}

#[cfg(feature = "backend-tract")]
fn model_backend(kind: BackendKind, model: &str) -> Result<Box<dyn DetectorBackend>> {
    let backend = crate::detect::backends::TractBackend::new(kind, model, 640, 640)?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn model_backend(kind: BackendKind, model: &str) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!(
        "{} model '{}' needs the backend-tract feature",
        kind,
        model
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedBackend;

    fn scripted(kind: BackendKind) -> Box<dyn DetectorBackend> {
        Box::new(ScriptedBackend::new(kind))
    }

    #[test]
    fn ids_follow_kind_and_counter() {
        let mut reg = BackendRegistry::new();
        let a = reg.add("stub", "synthetic").unwrap();
        let b = reg.add_prepared("yolo", "yolov8n", scripted(BackendKind::Yolo)).unwrap();
        assert_eq!(a, "stub_1");
        assert_eq!(b, "yolo_2");
        reg.remove(&a).unwrap();
        let c = reg.add("stub", "synthetic").unwrap();
        assert_eq!(c, "stub_3");
        let ids: Vec<String> = reg.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["yolo_2", "stub_3"]);
    }

    #[test]
    fn unknown_type_leaves_registry_unchanged() {
        let mut reg = BackendRegistry::new();
        reg.add("stub", "synthetic").unwrap();
        let err = reg.add("openpose", "body25").unwrap_err();
        assert_eq!(PipelineError::of(&err).unwrap().code(), "UNKNOWN_BACKEND_TYPE");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.add("stub", "x").unwrap(), "stub_2");
    }

    #[test]
    fn failed_model_load_registers_unavailable_backend() {
        let mut reg = BackendRegistry::new();
        reg.register_factory(
            BackendKind::Sleap,
            Box::new(|_, model| Err(anyhow!("missing weights {}", model))),
        );
        let id = reg.add("sleap", "mice.slp").unwrap();
        let status = reg.status(&id).unwrap();
        assert_eq!(status.health, BackendHealth::Unavailable);
        assert!(status.capabilities.supports_tracking_hint);
    }

    #[test]
    fn disable_hides_from_active_set_but_keeps_entry() {
        let mut reg = BackendRegistry::new();
        let a = reg.add_prepared("yolo", "m", scripted(BackendKind::Yolo)).unwrap();
        let b = reg.add_prepared("deeplabcut", "m", scripted(BackendKind::DeepLabCut)).unwrap();
        reg.set_enabled(&a, false).unwrap();
        let active: Vec<String> = reg.active().into_iter().map(|a| a.id).collect();
        assert_eq!(active, vec![b.clone()]);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.active()[0].weight, 1.2);
        assert!(reg.set_enabled("nope_9", true).is_err());
    }

    #[test]
    fn combined_capabilities_merge_enabled_backends() {
        let mut reg = BackendRegistry::new();
        assert_eq!(reg.combined_capabilities().backends_count, 0);
        assert_eq!(reg.combined_capabilities().max_fps, None);
        reg.add_prepared("yolo", "m", scripted(BackendKind::Yolo)).unwrap();
        let dlc = reg.add_prepared("deeplabcut", "m", scripted(BackendKind::DeepLabCut)).unwrap();
        let caps = reg.combined_capabilities();
        assert!(caps.supports_pose);
        assert!(caps.supports_tracking_hint);
        assert_eq!(caps.max_fps, Some(15));
        assert!(caps.targets.contains(&TargetKind::Human));
        assert!(caps.targets.contains(&TargetKind::Rodent));
        assert_eq!(caps.backends_count, 2);
        reg.set_enabled(&dlc, false).unwrap();
        let caps = reg.combined_capabilities();
        assert!(!caps.supports_tracking_hint);
        assert_eq!(caps.max_fps, Some(30));
    }

    #[test]
    fn health_tracks_consecutive_failures() {
        let mut reg = BackendRegistry::new();
        let id = reg.add("stub", "synthetic").unwrap();
        reg.record_outcome(&id, BackendHealth::TimedOut);
        reg.record_outcome(&id, BackendHealth::Unavailable);
        assert_eq!(reg.status(&id).unwrap().consecutive_failures, 2);
        reg.record_outcome(&id, BackendHealth::Ok);
        let status = reg.status(&id).unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.health, BackendHealth::Ok);
        reg.record_outcome("gone_1", BackendHealth::Ok);
    }

    #[test]
    fn rejects_non_positive_weight() {
        let mut reg = BackendRegistry::new();
        let id = reg.add("stub", "synthetic").unwrap();
        assert!(reg.set_weight(&id, 0.0).is_err());
        reg.set_weight(&id, 2.5).unwrap();
        assert_eq!(reg.status(&id).unwrap().weight, 2.5);
    }
}
