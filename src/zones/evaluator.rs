//! Per (track, zone) containment with hysteresis.
//!
//! outside -> entering -> inside -> exiting -> outside
//!
//! `enter` fires once the reference point has been inside for
//! `min_frames_inside` consecutive frames, `inside` fires on every confirmed
//! frame, `exit` fires on the first frame outside. Removing a track or zone
//! with an open dwell emits a synthetic `exit` first.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::geometry::{point_in_polygon, Point};
use crate::tracker::Track;

use super::{Zone, ZoneKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Containment {
    Outside,
    Entering,
    Inside,
    Exiting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneEventKind {
    Enter,
    Inside,
    Exit,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneEvent {
    pub track_id: u64,
    pub class_name: String,
    pub confidence: f32,
    pub zone_id: String,
    pub zone_name: String,
    pub zone_kind: ZoneKind,
    pub event: ZoneEventKind,
    /// Consecutive frames inside at the time of the event.
    pub frames_inside: u32,
    pub timestamp: f64,
    /// Emitted because the track or zone went away, not because of motion.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

#[derive(Clone, Debug)]
struct Membership {
    status: Containment,
    frames_inside: u32,
    last_event: Option<f64>,
    class_name: String,
    confidence: f32,
}

/// Read-only view of one membership, for diagnostics and tests.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipView {
    pub status: Containment,
    pub frames_inside: u32,
    pub last_event: Option<f64>,
}

pub struct ZoneEvaluator {
    min_frames_inside: u32,
    zones: Vec<Zone>,
    memberships: BTreeMap<(u64, String), Membership>,
}

impl ZoneEvaluator {
    pub fn new(min_frames_inside: u32) -> Self {
        Self {
            min_frames_inside: min_frames_inside.max(1),
            zones: Vec::new(),
            memberships: BTreeMap::new(),
        }
    }

    pub fn set_min_frames_inside(&mut self, frames: u32) {
        self.min_frames_inside = frames.max(1);
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Install a new zone snapshot. Zones that disappeared or were disabled
    /// close their open dwells and lose their membership state.
    pub fn set_zones(&mut self, zones: Vec<Zone>, timestamp: f64) -> Vec<ZoneEvent> {
        let active: HashSet<&str> = zones
            .iter()
            .filter(|z| z.enabled)
            .map(|z| z.id.as_str())
            .collect();
        let gone: Vec<(u64, String)> = self
            .memberships
            .keys()
            .filter(|(_, zone_id)| !active.contains(zone_id.as_str()))
            .cloned()
            .collect();
        let mut events = Vec::new();
        for key in gone {
            if let Some(m) = self.memberships.remove(&key) {
                let zone = self.zones.iter().find(|z| z.id == key.1);
                if let (Containment::Inside, Some(zone)) = (m.status, zone) {
                    events.push(event(key.0, zone, &m, ZoneEventKind::Exit, timestamp, true));
                }
            }
        }
        self.zones = zones;
        events
    }

    /// Evaluate tracks observed this frame. `scale` divides box coordinates
    /// into the zones' normalised space (frame width/height for pixel boxes).
    pub fn evaluate(&mut self, tracks: &[&Track], scale: (f32, f32), timestamp: f64) -> Vec<ZoneEvent> {
        let (sx, sy) = (scale.0.max(f32::EPSILON), scale.1.max(f32::EPSILON));
        let mut events = Vec::new();
        for track in tracks {
            let feet = track.reference_point();
            let point = Point::new(feet.x / sx, feet.y / sy);
            for zone in self.zones.iter().filter(|z| z.enabled) {
                let inside = point_in_polygon(point, &zone.polygon);
                let key = (track.id, zone.id.clone());
                if !inside && !self.memberships.contains_key(&key) {
                    continue;
                }
                let m = self.memberships.entry(key).or_insert_with(|| Membership {
                    status: Containment::Outside,
                    frames_inside: 0,
                    last_event: None,
                    class_name: track.class_name.clone(),
                    confidence: track.confidence,
                });
                m.class_name = track.class_name.clone();
                m.confidence = track.confidence;
                for kind in step(m, inside, self.min_frames_inside) {
                    m.last_event = Some(timestamp);
                    events.push(event(track.id, zone, m, kind, timestamp, false));
                }
            }
        }
        events
    }

    /// Forget deleted tracks, closing any open dwell with a synthetic exit.
    pub fn remove_tracks(&mut self, track_ids: &[u64], timestamp: f64) -> Vec<ZoneEvent> {
        let ids: HashSet<u64> = track_ids.iter().copied().collect();
        let gone: Vec<(u64, String)> = self
            .memberships
            .keys()
            .filter(|(track, _)| ids.contains(track))
            .cloned()
            .collect();
        let mut events = Vec::new();
        for key in gone {
            if let Some(m) = self.memberships.remove(&key) {
                let zone = self.zones.iter().find(|z| z.id == key.1);
                if let (Containment::Inside, Some(zone)) = (m.status, zone) {
                    events.push(event(key.0, zone, &m, ZoneEventKind::Exit, timestamp, true));
                }
            }
        }
        events
    }

    pub fn membership(&self, track_id: u64, zone_id: &str) -> Option<MembershipView> {
        self.memberships
            .get(&(track_id, zone_id.to_string()))
            .map(|m| MembershipView {
                status: m.status,
                frames_inside: m.frames_inside,
                last_event: m.last_event,
            })
    }

    pub fn membership_count(&self) -> usize {
        self.memberships.len()
    }
}

/// Advance one membership by one observation; returns the events to emit.
fn step(m: &mut Membership, inside: bool, min_frames: u32) -> Vec<ZoneEventKind> {
    use Containment::*;
    match (m.status, inside) {
        (Outside | Exiting | Entering, true) => {
            m.frames_inside = if m.status == Entering {
                m.frames_inside + 1
            } else {
                1
            };
            if m.frames_inside >= min_frames {
                m.status = Inside;
                vec![ZoneEventKind::Enter, ZoneEventKind::Inside]
            } else {
                m.status = Entering;
                Vec::new()
            }
        }
        (Inside, true) => {
            m.frames_inside += 1;
            vec![ZoneEventKind::Inside]
        }
        (Inside, false) => {
            m.status = Exiting;
            m.frames_inside = 0;
            vec![ZoneEventKind::Exit]
        }
        (Entering | Exiting | Outside, false) => {
            m.status = Outside;
            m.frames_inside = 0;
            Vec::new()
        }
    }
}

fn event(
    track_id: u64,
    zone: &Zone,
    m: &Membership,
    kind: ZoneEventKind,
    timestamp: f64,
    synthetic: bool,
) -> ZoneEvent {
    ZoneEvent {
        track_id,
        class_name: m.class_name.clone(),
        confidence: m.confidence,
        zone_id: zone.id.clone(),
        zone_name: zone.name.clone(),
        zone_kind: zone.kind,
        event: kind,
        frames_inside: m.frames_inside,
        timestamp,
        synthetic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusedDetection;
    use crate::geometry::BBox;
    use crate::tracker::{Tracker, TrackerConfig};

    fn unit_square() -> Zone {
        Zone::new(
            "square",
            "Square",
            ZoneKind::Danger,
            vec![
                Point::new(0.0, 0.0),
                Point::new(1.0, 0.0),
                Point::new(1.0, 1.0),
                Point::new(0.0, 1.0),
            ],
        )
    }

    /// A track whose feet sit at `(x, y)` in normalised space.
    fn track_at(id: u64, x: f32, y: f32) -> Track {
        let mut tracker = Tracker::new(TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        });
        tracker.update(
            &[FusedDetection {
                class_id: 0,
                class_name: "person".into(),
                confidence: 0.9,
                bbox: BBox::new(x - 0.05, y - 0.2, x + 0.05, y),
                keypoints: Vec::new(),
                contributors: Vec::new(),
            }],
            0.0,
        );
        let mut track = tracker.tracks()[0].clone();
        track.id = id;
        track
    }

    fn kinds(events: &[ZoneEvent]) -> Vec<ZoneEventKind> {
        events.iter().map(|e| e.event).collect()
    }

    #[test]
    fn debounced_enter_on_third_frame_then_inside_each_frame() {
        let mut ev = ZoneEvaluator::new(3);
        ev.set_zones(vec![unit_square()], 0.0);
        let t = track_at(1, 0.5, 0.5);
        let mut per_frame = Vec::new();
        for f in 1..=5 {
            per_frame.push(kinds(&ev.evaluate(&[&t], (1.0, 1.0), f as f64)));
        }
        use ZoneEventKind::*;
        assert_eq!(
            per_frame,
            vec![vec![], vec![], vec![Enter, Inside], vec![Inside], vec![Inside]]
        );
    }

    #[test]
    fn jitter_below_threshold_emits_nothing() {
        let mut ev = ZoneEvaluator::new(3);
        ev.set_zones(vec![unit_square()], 0.0);
        let inside = track_at(1, 0.5, 0.5);
        let outside = track_at(1, 1.5, 0.5);
        for f in 0..10 {
            let t = if f % 2 == 0 { &inside } else { &outside };
            assert!(ev.evaluate(&[t], (1.0, 1.0), f as f64).is_empty());
        }
    }

    #[test]
    fn exit_fires_immediately_and_once() {
        let mut ev = ZoneEvaluator::new(2);
        ev.set_zones(vec![unit_square()], 0.0);
        let inside = track_at(1, 0.5, 0.5);
        let outside = track_at(1, 2.0, 0.5);
        ev.evaluate(&[&inside], (1.0, 1.0), 1.0);
        ev.evaluate(&[&inside], (1.0, 1.0), 2.0);
        let exit = ev.evaluate(&[&outside], (1.0, 1.0), 3.0);
        assert_eq!(kinds(&exit), vec![ZoneEventKind::Exit]);
        assert!(!exit[0].synthetic);
        assert!(ev.evaluate(&[&outside], (1.0, 1.0), 4.0).is_empty());
        assert_eq!(ev.membership(1, "square").unwrap().status, Containment::Outside);
    }

    #[test]
    fn enter_and_exit_alternate_across_dwells() {
        let mut ev = ZoneEvaluator::new(1);
        ev.set_zones(vec![unit_square()], 0.0);
        let inside = track_at(1, 0.5, 0.5);
        let outside = track_at(1, 2.0, 0.5);
        let mut sequence = Vec::new();
        for f in 0..12 {
            let t = if (f / 3) % 2 == 0 { &inside } else { &outside };
            sequence.extend(
                ev.evaluate(&[t], (1.0, 1.0), f as f64)
                    .into_iter()
                    .map(|e| e.event)
                    .filter(|k| *k != ZoneEventKind::Inside),
            );
        }
        use ZoneEventKind::*;
        assert_eq!(sequence, vec![Enter, Exit, Enter, Exit]);
    }

    #[test]
    fn pixel_boxes_are_normalised_by_frame_size() {
        let mut ev = ZoneEvaluator::new(1);
        ev.set_zones(Zone::pool_defaults(), 0.0);
        // Feet at (320, 300) on a 640x480 frame -> (0.5, 0.625): pool water.
        let t = track_at(7, 320.0, 300.0);
        let events = ev.evaluate(&[&t], (640.0, 480.0), 1.0);
        assert_eq!(events[0].zone_id, "pool-water");
        assert_eq!(events[0].event, ZoneEventKind::Enter);
    }

    #[test]
    fn deleting_track_inside_emits_synthetic_exit() {
        let mut ev = ZoneEvaluator::new(1);
        ev.set_zones(vec![unit_square()], 0.0);
        let t = track_at(4, 0.5, 0.5);
        ev.evaluate(&[&t], (1.0, 1.0), 1.0);
        let events = ev.remove_tracks(&[4], 2.0);
        assert_eq!(kinds(&events), vec![ZoneEventKind::Exit]);
        assert!(events[0].synthetic);
        assert_eq!(ev.membership_count(), 0);
        assert!(ev.remove_tracks(&[4], 3.0).is_empty());
    }

    #[test]
    fn deleting_track_while_entering_is_silent() {
        let mut ev = ZoneEvaluator::new(3);
        ev.set_zones(vec![unit_square()], 0.0);
        let t = track_at(4, 0.5, 0.5);
        ev.evaluate(&[&t], (1.0, 1.0), 1.0);
        assert!(ev.remove_tracks(&[4], 2.0).is_empty());
        assert_eq!(ev.membership_count(), 0);
    }

    #[test]
    fn removing_or_disabling_zone_closes_dwell() {
        let mut ev = ZoneEvaluator::new(1);
        ev.set_zones(vec![unit_square()], 0.0);
        let t = track_at(1, 0.5, 0.5);
        ev.evaluate(&[&t], (1.0, 1.0), 1.0);
        let mut disabled = unit_square();
        disabled.enabled = false;
        let events = ev.set_zones(vec![disabled], 2.0);
        assert_eq!(kinds(&events), vec![ZoneEventKind::Exit]);
        assert!(events[0].synthetic);
        assert!(ev.evaluate(&[&t], (1.0, 1.0), 3.0).is_empty());

        ev.set_zones(vec![unit_square()], 4.0);
        ev.evaluate(&[&t], (1.0, 1.0), 5.0);
        let events = ev.set_zones(Vec::new(), 6.0);
        assert_eq!(events.len(), 1);
        assert_eq!(ev.membership_count(), 0);
    }

    #[test]
    fn outside_points_do_not_allocate_state() {
        let mut ev = ZoneEvaluator::new(1);
        ev.set_zones(vec![unit_square()], 0.0);
        let t = track_at(1, 3.0, 3.0);
        ev.evaluate(&[&t], (1.0, 1.0), 1.0);
        assert_eq!(ev.membership_count(), 0);
    }
}
