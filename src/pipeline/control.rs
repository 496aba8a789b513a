//! Shared control plane.
//!
//! External callers (API handlers, the daemon, tests) mutate configuration
//! here at any time. The frame loop takes one [`FrameConfig`] snapshot per
//! frame, so a change is either fully visible to a frame or not at all.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alerts::AlertConfig;
use crate::detect::{
    ActiveBackend, BackendCapabilities, BackendFactory, BackendHealth, BackendKind,
    BackendRegistry, BackendStatus, BackendWorker, CombinedCapabilities, DetectorBackend,
};
use crate::fusion::FusionConfig;
use crate::presets;
use crate::tracker::TrackerConfig;
use crate::zones::{Zone, ZoneChange, ZoneStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    ResetTracker,
}

/// What one frame runs with.
pub struct FrameConfig {
    pub backends: Vec<ActiveBackend>,
    pub fusion: FusionConfig,
    pub tracker: TrackerConfig,
    pub alerts: AlertConfig,
    pub min_frames_inside: u32,
    pub zones: Vec<Zone>,
    pub zones_revision: u64,
    pub zone_changes: Vec<ZoneChange>,
    pub commands: Vec<Command>,
}

struct ControlState {
    registry: BackendRegistry,
    zones: ZoneStore,
    fusion: FusionConfig,
    tracker: TrackerConfig,
    alerts: AlertConfig,
    min_frames_inside: u32,
    active_preset: Option<String>,
    commands: Vec<Command>,
}

#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<Mutex<ControlState>>,
}

impl ControlPlane {
    pub fn new(
        fusion: FusionConfig,
        tracker: TrackerConfig,
        alerts: AlertConfig,
        min_frames_inside: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControlState {
                registry: BackendRegistry::new(),
                zones: ZoneStore::new(),
                fusion,
                tracker,
                alerts,
                min_frames_inside: min_frames_inside.max(1),
                active_preset: None,
                commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ControlState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("control plane lock poisoned"))
    }

    // Backends

    pub fn register_factory(&self, kind: BackendKind, factory: BackendFactory) -> Result<()> {
        self.lock()?.registry.register_factory(kind, factory);
        Ok(())
    }

    /// Add a backend by type name and model identifier.
    pub fn add_backend(&self, kind: &str, model: &str) -> Result<String> {
        self.lock()?.registry.add(kind, model)
    }

    pub fn add_prepared_backend(
        &self,
        kind: &str,
        model: &str,
        backend: Box<dyn DetectorBackend>,
    ) -> Result<String> {
        self.lock()?.registry.add_prepared(kind, model, backend)
    }

    /// Takes effect at the next frame boundary. A frame already in flight
    /// still collects this backend's answer.
    pub fn set_backend_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.lock()?.registry.set_enabled(id, enabled)
    }

    pub fn set_backend_weight(&self, id: &str, weight: f32) -> Result<()> {
        self.lock()?.registry.set_weight(id, weight)
    }

    pub fn remove_backend(&self, id: &str) -> Result<()> {
        let worker = self.lock()?.registry.remove(id)?;
        release(vec![worker]);
        Ok(())
    }

    pub fn backend_capabilities(&self, id: &str) -> Result<BackendCapabilities> {
        self.lock()?.registry.capabilities(id)
    }

    pub fn backend_status(&self, id: &str) -> Result<BackendStatus> {
        self.lock()?.registry.status(id)
    }

    pub fn backends(&self) -> Result<Vec<BackendStatus>> {
        Ok(self.lock()?.registry.list())
    }

    pub fn combined_capabilities(&self) -> Result<CombinedCapabilities> {
        Ok(self.lock()?.registry.combined_capabilities())
    }

    pub fn enabled_backends(&self) -> Result<usize> {
        Ok(self.lock()?.registry.enabled_count())
    }

    /// Replace every backend and the fusion config with a named preset.
    pub fn apply_preset(&self, preset_id: &str) -> Result<()> {
        let preset = presets::find(preset_id)?;
        let old = {
            let mut state = self.lock()?;
            let old = state.registry.clear();
            state.fusion = preset.fusion.clone();
            for backend in &preset.backends {
                state.registry.add(backend.kind.as_str(), backend.model)?;
            }
            state.active_preset = Some(preset.id.to_string());
            old
        };
        release(old);
        log::info!(
            "preset {} applied with {} backends",
            preset.id,
            preset.backends.len()
        );
        Ok(())
    }

    pub fn active_preset(&self) -> Result<Option<String>> {
        Ok(self.lock()?.active_preset.clone())
    }

    /// Detach every backend and wait for their workers to release.
    pub fn release_backends(&self) -> Result<usize> {
        let old = self.lock()?.registry.clear();
        let count = old.len();
        release(old);
        Ok(count)
    }

    // Fusion, tracker, alerts

    pub fn set_fusion(&self, config: FusionConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.lock()?;
        if state.registry.is_empty() {
            log::debug!("fusion config set with no backends registered");
        }
        state.fusion = config;
        Ok(())
    }

    pub fn fusion(&self) -> Result<FusionConfig> {
        Ok(self.lock()?.fusion.clone())
    }

    pub fn set_tracker(&self, config: TrackerConfig) -> Result<()> {
        self.lock()?.tracker = config;
        Ok(())
    }

    pub fn tracker(&self) -> Result<TrackerConfig> {
        Ok(self.lock()?.tracker.clone())
    }

    pub fn set_alerts(&self, config: AlertConfig) -> Result<()> {
        config.validate()?;
        self.lock()?.alerts = config;
        Ok(())
    }

    pub fn alerts(&self) -> Result<AlertConfig> {
        Ok(self.lock()?.alerts.clone())
    }

    pub fn min_frames_inside(&self) -> Result<u32> {
        Ok(self.lock()?.min_frames_inside)
    }

    pub fn set_min_frames_inside(&self, frames: u32) -> Result<()> {
        self.lock()?.min_frames_inside = frames.max(1);
        Ok(())
    }

    // Zones

    pub fn create_zone(&self, zone: Zone) -> Result<Zone> {
        self.lock()?.zones.create(zone)
    }

    pub fn update_zone(&self, zone: Zone) -> Result<Zone> {
        self.lock()?.zones.update(zone)
    }

    pub fn delete_zone(&self, id: &str) -> Result<Zone> {
        self.lock()?.zones.delete(id)
    }

    pub fn toggle_zone(&self, id: &str, enabled: bool) -> Result<Zone> {
        self.lock()?.zones.toggle(id, enabled)
    }

    pub fn clear_zones(&self) -> Result<usize> {
        Ok(self.lock()?.zones.clear().len())
    }

    pub fn zones(&self) -> Result<Vec<Zone>> {
        Ok(self.lock()?.zones.list().to_vec())
    }

    pub fn zone(&self, id: &str) -> Result<Option<Zone>> {
        Ok(self.lock()?.zones.get(id).cloned())
    }

    // Commands

    /// Drop every track at the next frame boundary.
    pub fn reset_tracker(&self) -> Result<()> {
        self.lock()?.commands.push(Command::ResetTracker);
        Ok(())
    }

    /// Take the configuration for one frame and drain queued changes.
    pub(crate) fn frame_config(&self) -> Result<FrameConfig> {
        let mut state = self.lock()?;
        Ok(FrameConfig {
            backends: state.registry.active(),
            fusion: state.fusion.clone(),
            tracker: state.tracker.clone(),
            alerts: state.alerts.clone(),
            min_frames_inside: state.min_frames_inside,
            zones: state.zones.list().to_vec(),
            zones_revision: state.zones.revision(),
            zone_changes: state.zones.take_changes(),
            commands: std::mem::take(&mut state.commands),
        })
    }

    pub(crate) fn record_outcomes(&self, outcomes: &[(String, BackendHealth)]) -> Result<()> {
        let mut state = self.lock()?;
        for (id, health) in outcomes {
            state.registry.record_outcome(id, *health);
        }
        Ok(())
    }
}

/// Stop workers outside the lock. Each shutdown cancels the in-flight call
/// and joins the thread, so the model is released before this returns.
fn release(workers: Vec<Arc<BackendWorker>>) {
    for worker in workers {
        worker.shutdown();
        log::debug!("backend {} released", worker.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedBackend;
    use crate::error::PipelineError;
    use crate::geometry::Point;
    use crate::zones::ZoneKind;

    fn plane() -> ControlPlane {
        ControlPlane::new(
            FusionConfig::default(),
            TrackerConfig::default(),
            AlertConfig::default(),
            3,
        )
    }

    fn triangle(id: &str) -> Zone {
        Zone::new(
            id,
            "",
            ZoneKind::Warning,
            vec![
                Point::new(0.1, 0.1),
                Point::new(0.9, 0.1),
                Point::new(0.5, 0.9),
            ],
        )
    }

    #[test]
    fn unknown_backend_type_leaves_registry_unchanged() {
        let plane = plane();
        plane.add_backend("stub", "").unwrap();
        let err = plane.add_backend("mask-rcnn", "x").unwrap_err();
        assert_eq!(
            PipelineError::of(&err).unwrap().code(),
            "UNKNOWN_BACKEND_TYPE"
        );
        assert_eq!(plane.backends().unwrap().len(), 1);
    }

    #[test]
    fn frame_config_sees_changes_once() {
        let plane = plane();
        plane.create_zone(triangle("gate")).unwrap();
        plane.reset_tracker().unwrap();
        let first = plane.frame_config().unwrap();
        assert_eq!(first.zones.len(), 1);
        assert_eq!(first.zone_changes.len(), 1);
        assert_eq!(first.commands, vec![Command::ResetTracker]);
        let second = plane.frame_config().unwrap();
        assert!(second.zone_changes.is_empty());
        assert!(second.commands.is_empty());
        assert_eq!(second.zones_revision, first.zones_revision);
    }

    #[test]
    fn disabled_backends_are_skipped_at_next_frame() {
        let plane = plane();
        let id = plane
            .add_prepared_backend("yolo", "scripted", Box::new(ScriptedBackend::new(BackendKind::Yolo)))
            .unwrap();
        assert_eq!(plane.frame_config().unwrap().backends.len(), 1);
        plane.set_backend_enabled(&id, false).unwrap();
        assert!(plane.frame_config().unwrap().backends.is_empty());
        assert_eq!(plane.backends().unwrap().len(), 1);
    }

    #[test]
    fn preset_replaces_backends_and_fusion() {
        let plane = plane();
        let scripted = ScriptedBackend::new(BackendKind::Stub);
        let probe = scripted.probe();
        plane
            .add_prepared_backend("stub", "", Box::new(scripted))
            .unwrap();
        plane.apply_preset("high_precision").unwrap();
        assert!(probe.released());
        let backends = plane.backends().unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(plane.fusion().unwrap().min_backends_agree, 2);
        assert_eq!(plane.active_preset().unwrap().as_deref(), Some("high_precision"));
        assert!(plane.apply_preset("nope").is_err());
    }

    #[test]
    fn invalid_fusion_config_is_rejected() {
        let plane = plane();
        let err = plane
            .set_fusion(FusionConfig {
                iou_threshold: 1.5,
                ..FusionConfig::default()
            })
            .unwrap_err();
        assert_eq!(PipelineError::of(&err).unwrap().code(), "INVALID_CONFIG");
    }

    #[test]
    fn remove_releases_backend() {
        let plane = plane();
        let scripted = ScriptedBackend::new(BackendKind::Sleap);
        let probe = scripted.probe();
        let id = plane
            .add_prepared_backend("sleap", "m", Box::new(scripted))
            .unwrap();
        plane.remove_backend(&id).unwrap();
        assert!(probe.released());
        let err = plane.remove_backend(&id).unwrap_err();
        assert_eq!(PipelineError::of(&err).unwrap().code(), "BACKEND_NOT_FOUND");
    }
}
