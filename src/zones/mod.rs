//! Zones: user-drawn polygons in normalised frame coordinates.
//!
//! `ZoneStore` is the configuration-side CRUD surface. Every mutation is
//! validated up front so the per-frame evaluator never sees a bad polygon,
//! and is queued as a `ZoneChange` for subscribers.

mod evaluator;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::PipelineError;
use crate::geometry::{polygon_area, Point};

pub use evaluator::{Containment, MembershipView, ZoneEvaluator, ZoneEvent, ZoneEventKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Warning,
    Danger,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Warning => "warning",
            ZoneKind::Danger => "danger",
        }
    }

    pub fn default_color(&self) -> &'static str {
        match self {
            ZoneKind::Warning => "#f59e0b",
            ZoneKind::Danger => "#ef4444",
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Empty on create means "assign one".
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ZoneKind,
    pub polygon: Vec<Point>,
    #[serde(default)]
    pub color: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Zone {
    pub fn new(id: &str, name: &str, kind: ZoneKind, polygon: Vec<Point>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            polygon,
            color: kind.default_color().to_string(),
            enabled: true,
        }
    }

    /// The classic pool layout: a warning strip along the edge and the water itself.
    pub fn pool_defaults() -> Vec<Zone> {
        vec![
            Zone::new(
                "pool-edge",
                "Pool Edge",
                ZoneKind::Warning,
                vec![
                    Point::new(0.1, 0.35),
                    Point::new(0.9, 0.35),
                    Point::new(0.9, 0.45),
                    Point::new(0.1, 0.45),
                ],
            ),
            Zone::new(
                "pool-water",
                "Pool Water",
                ZoneKind::Danger,
                vec![
                    Point::new(0.1, 0.45),
                    Point::new(0.9, 0.45),
                    Point::new(0.9, 0.85),
                    Point::new(0.1, 0.85),
                ],
            ),
        ]
    }

    /// Check invariants and fill in defaults. Called on every create/update.
    pub fn validate(&mut self) -> Result<()> {
        validate_zone_id(&self.id)?;
        self.id = self.id.to_lowercase();
        let invalid = |reason: &str| PipelineError::InvalidPolygon {
            zone: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.polygon.len() < 3 {
            return Err(invalid(&format!(
                "needs at least 3 vertices, got {}",
                self.polygon.len()
            ))
            .into());
        }
        if self
            .polygon
            .iter()
            .any(|p| !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y))
        {
            return Err(invalid("vertices must be normalised to [0, 1]").into());
        }
        if polygon_area(&self.polygon) <= f32::EPSILON {
            return Err(invalid("polygon has no area").into());
        }
        if self.name.trim().is_empty() {
            self.name = self.id.clone();
        }
        if self.color.trim().is_empty() {
            self.color = self.kind.default_color().to_string();
        }
        Ok(())
    }
}

/// Zone ids are local labels: 1-64 chars of `[a-z0-9_-]`, starting alphanumeric.
pub fn validate_zone_id(zone_id: &str) -> Result<()> {
    static ZONE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("zone id pattern"));
    if !re.is_match(&zone_id.to_lowercase()) {
        return Err(PipelineError::InvalidConfig(format!(
            "zone id '{}' must match ^[a-z0-9][a-z0-9_-]{{0,63}}$",
            zone_id
        ))
        .into());
    }
    Ok(())
}

/// A zone mutation, as published to stream subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneChange {
    ZoneAdded { zone: Zone },
    ZoneUpdated { zone: Zone },
    ZoneRemoved { zone_id: String },
    ZonesCleared,
}

#[derive(Default)]
pub struct ZoneStore {
    zones: Vec<Zone>,
    generated: u64,
    revision: u64,
    changes: Vec<ZoneChange>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a zone. An empty id is replaced with `zone-<n>`.
    pub fn create(&mut self, mut zone: Zone) -> Result<Zone> {
        if zone.id.trim().is_empty() {
            zone.id = self.generate_id();
        }
        zone.validate()?;
        if self.zones.iter().any(|z| z.id == zone.id) {
            return Err(
                PipelineError::InvalidConfig(format!("zone '{}' already exists", zone.id)).into(),
            );
        }
        self.zones.push(zone.clone());
        log::info!("zone {} added ({})", zone.id, zone.kind.as_str());
        self.bump(ZoneChange::ZoneAdded { zone: zone.clone() });
        Ok(zone)
    }

    /// Replace an existing zone's definition.
    pub fn update(&mut self, mut zone: Zone) -> Result<Zone> {
        zone.id = zone.id.to_lowercase();
        let pos = self.position(&zone.id)?;
        zone.validate()?;
        self.zones[pos] = zone.clone();
        log::info!("zone {} updated", zone.id);
        self.bump(ZoneChange::ZoneUpdated { zone: zone.clone() });
        Ok(zone)
    }

    pub fn delete(&mut self, id: &str) -> Result<Zone> {
        let pos = self.position(id)?;
        let zone = self.zones.remove(pos);
        log::info!("zone {} removed", zone.id);
        self.bump(ZoneChange::ZoneRemoved {
            zone_id: zone.id.clone(),
        });
        Ok(zone)
    }

    pub fn toggle(&mut self, id: &str, enabled: bool) -> Result<Zone> {
        let pos = self.position(id)?;
        self.zones[pos].enabled = enabled;
        let zone = self.zones[pos].clone();
        log::info!("zone {} {}", zone.id, if enabled { "enabled" } else { "disabled" });
        self.bump(ZoneChange::ZoneUpdated { zone: zone.clone() });
        Ok(zone)
    }

    pub fn clear(&mut self) -> Vec<Zone> {
        let removed: Vec<Zone> = self.zones.drain(..).collect();
        log::info!("zones cleared ({} removed)", removed.len());
        self.bump(ZoneChange::ZonesCleared);
        removed
    }

    pub fn list(&self) -> &[Zone] {
        &self.zones
    }

    pub fn get(&self, id: &str) -> Option<&Zone> {
        let id = id.to_lowercase();
        self.zones.iter().find(|z| z.id == id)
    }

    /// Monotonic counter bumped by every successful mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Changes since the last call, oldest first.
    pub fn take_changes(&mut self) -> Vec<ZoneChange> {
        std::mem::take(&mut self.changes)
    }

    fn bump(&mut self, change: ZoneChange) {
        self.revision += 1;
        self.changes.push(change);
    }

    fn generate_id(&mut self) -> String {
        loop {
            self.generated += 1;
            let id = format!("zone-{}", self.generated);
            if !self.zones.iter().any(|z| z.id == id) {
                return id;
            }
        }
    }

    fn position(&self, id: &str) -> Result<usize> {
        let id = id.to_lowercase();
        self.zones
            .iter()
            .position(|z| z.id == id)
            .ok_or_else(|| PipelineError::ZoneNotFound(id).into())
    }
}
