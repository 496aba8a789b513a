//! Result stream: one writer, many readers.
//!
//! Every subscriber owns a bounded queue. A new detection snapshot replaces
//! any snapshot the subscriber has not read yet; other messages are kept in
//! order and the oldest is dropped once the queue is full. Zone events and
//! alerts of a discarded snapshot are prepended to the next snapshot that
//! subscriber receives. Publishing never blocks on a reader.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::alerts::Alert;
use crate::fusion::FusedDetection;
use crate::geometry::{BBox, Point};
use crate::tracker::{Track, TrackState};
use crate::zones::{Zone, ZoneChange, ZoneEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Idle,
    Stalled,
    Stopped,
}

/// Track as published: the stored track plus its derived reference points.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackView {
    pub id: u64,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub center: Point,
    pub feet: Point,
    pub state: TrackState,
    pub age: u32,
    pub velocity: (f32, f32),
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keypoints: Vec<crate::detect::Keypoint>,
    pub contributors: Vec<String>,
}

impl From<&Track> for TrackView {
    fn from(track: &Track) -> Self {
        Self {
            id: track.id,
            class_name: track.class_name.clone(),
            confidence: track.confidence,
            bbox: track.bbox,
            center: track.bbox.center(),
            feet: track.reference_point(),
            state: track.state,
            age: track.age,
            velocity: track.velocity,
            keypoints: track.keypoints.clone(),
            contributors: track.contributors.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackendTiming {
    pub backend_id: String,
    pub elapsed_ms: f64,
    /// "ok", "unavailable" or "timed_out".
    pub outcome: &'static str,
    pub detections: usize,
}

/// Everything the pipeline produced for one frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub seq: u64,
    pub timestamp: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub detections: Vec<FusedDetection>,
    pub tracks: Vec<TrackView>,
    pub zone_events: Vec<ZoneEvent>,
    pub alerts: Vec<Alert>,
    pub timing: Vec<BackendTiming>,
    pub inference_ms: f64,
    pub processing_ms: f64,
    pub class_counts: BTreeMap<String, usize>,
    pub active_track_ids: Vec<u64>,
    pub fusion_strategy: &'static str,
    pub backends_used: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Detection(Snapshot),
    Status {
        level: StatusLevel,
        state: PipelineState,
        message: String,
        timestamp: f64,
    },
    ZoneAdded {
        zone: Zone,
    },
    ZoneUpdated {
        zone: Zone,
    },
    ZoneRemoved {
        zone_id: String,
    },
    ZonesCleared,
    TrackerReset {
        dropped_tracks: Vec<u64>,
    },
}

impl Message {
    pub fn status(level: StatusLevel, state: PipelineState, message: impl Into<String>) -> Self {
        Message::Status {
            level,
            state,
            message: message.into(),
            timestamp: crate::frame::now_secs(),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Message::Detection(_))
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ZoneChange> for Message {
    fn from(change: ZoneChange) -> Self {
        match change {
            ZoneChange::ZoneAdded { zone } => Message::ZoneAdded { zone },
            ZoneChange::ZoneUpdated { zone } => Message::ZoneUpdated { zone },
            ZoneChange::ZoneRemoved { zone_id } => Message::ZoneRemoved { zone_id },
            ZoneChange::ZonesCleared => Message::ZonesCleared,
        }
    }
}

pub(crate) fn class_counts(detections: &[FusedDetection]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for det in detections {
        *counts.entry(det.class_name.clone()).or_insert(0) += 1;
    }
    counts
}

#[derive(Default)]
struct SlotState {
    pending: VecDeque<Arc<Message>>,
    dropped: u64,
    closed: bool,
    /// Zone events and alerts from discarded snapshots, owed to the next one.
    carried_events: Vec<ZoneEvent>,
    carried_alerts: Vec<Alert>,
}

impl SlotState {
    fn discard(&mut self, message: &Message) {
        if let Message::Detection(snapshot) = message {
            self.carried_events.extend(snapshot.zone_events.iter().cloned());
            self.carried_alerts.extend(snapshot.alerts.iter().cloned());
        }
        self.dropped += 1;
    }

    /// Prefix whatever discarded snapshots still owe onto `message`.
    fn settle(&mut self, message: &Arc<Message>) -> Arc<Message> {
        match message.as_ref() {
            Message::Detection(latest)
                if !self.carried_events.is_empty() || !self.carried_alerts.is_empty() =>
            {
                let mut merged = latest.clone();
                let mut events = std::mem::take(&mut self.carried_events);
                events.append(&mut merged.zone_events);
                merged.zone_events = events;
                let mut alerts = std::mem::take(&mut self.carried_alerts);
                alerts.append(&mut merged.alerts);
                merged.alerts = alerts;
                Arc::new(Message::Detection(merged))
            }
            _ => message.clone(),
        }
    }
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

pub struct Publisher {
    slots: Mutex<Vec<Weak<Slot>>>,
    capacity: usize,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
        });
        if let Ok(mut slots) = self.slots.lock() {
            slots.push(Arc::downgrade(&slot));
        } else {
            // Publisher is unusable; hand back a closed subscription.
            if let Ok(mut state) = slot.state.lock() {
                state.closed = true;
            }
        }
        Subscription { slot }
    }

    /// Deliver to every live subscriber. Returns how many received it.
    pub fn publish(&self, message: Message) -> usize {
        let message = Arc::new(message);
        let Ok(mut slots) = self.slots.lock() else {
            return 0;
        };
        slots.retain(|weak| weak.strong_count() > 0);
        let mut delivered = 0;
        for slot in slots.iter().filter_map(Weak::upgrade) {
            let Ok(mut state) = slot.state.lock() else {
                continue;
            };
            if message.is_snapshot() {
                let (stale, kept): (VecDeque<_>, VecDeque<_>) =
                    state.pending.drain(..).partition(|m| m.is_snapshot());
                state.pending = kept;
                for old in &stale {
                    state.discard(old);
                }
            }
            while state.pending.len() >= self.capacity {
                if let Some(old) = state.pending.pop_front() {
                    state.discard(&old);
                }
            }
            let outgoing = state.settle(&message);
            state.pending.push_back(outgoing);
            delivered += 1;
            drop(state);
            slot.ready.notify_one();
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Wake every reader; they drain what is queued and then see the end.
    pub fn close(&self) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        for slot in slots.drain(..).filter_map(|w| w.upgrade()) {
            if let Ok(mut state) = slot.state.lock() {
                state.closed = true;
            }
            slot.ready.notify_all();
        }
    }
}

/// One reader's end of the stream. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    /// Next message, or `None` on timeout or once the stream ended and the
    /// queue is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<Message>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock().ok()?;
        loop {
            if let Some(message) = state.pending.pop_front() {
                return Some(message);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.slot.ready.wait_timeout(state, deadline - now).ok()?.0;
        }
    }

    pub fn try_recv(&self) -> Option<Arc<Message>> {
        self.slot.state.lock().ok()?.pending.pop_front()
    }

    pub fn drain(&self) -> Vec<Arc<Message>> {
        self.slot
            .state
            .lock()
            .map(|mut s| s.pending.drain(..).collect())
            .unwrap_or_default()
    }

    /// Messages discarded because this reader fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.state.lock().map(|s| s.dropped).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.slot.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

/// Tally queued messages by their `type` tag.
pub fn summarize(messages: &[Arc<Message>]) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for m in messages {
        let key = match m.as_ref() {
            Message::Detection(_) => "detection",
            Message::Status { .. } => "status",
            Message::ZoneAdded { .. } => "zone_added",
            Message::ZoneUpdated { .. } => "zone_updated",
            Message::ZoneRemoved { .. } => "zone_removed",
            Message::ZonesCleared => "zones_cleared",
            Message::TrackerReset { .. } => "tracker_reset",
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::{ZoneEventKind, ZoneKind};

    fn snapshot(seq: u64) -> Message {
        Message::Detection(Snapshot {
            seq,
            timestamp: seq as f64,
            frame_width: 640,
            frame_height: 480,
            detections: Vec::new(),
            tracks: Vec::new(),
            zone_events: Vec::new(),
            alerts: Vec::new(),
            timing: Vec::new(),
            inference_ms: 0.0,
            processing_ms: 0.0,
            class_counts: BTreeMap::new(),
            active_track_ids: Vec::new(),
            fusion_strategy: "parallel",
            backends_used: Vec::new(),
        })
    }

    fn seq_of(m: &Message) -> Option<u64> {
        match m {
            Message::Detection(s) => Some(s.seq),
            _ => None,
        }
    }

    #[test]
    fn slow_reader_only_sees_latest_snapshot() {
        let publisher = Publisher::new(8);
        let sub = publisher.subscribe();
        for seq in 1..=5 {
            publisher.publish(snapshot(seq));
        }
        let pending = sub.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(seq_of(&pending[0]), Some(5));
        assert_eq!(sub.dropped(), 4);
    }

    #[test]
    fn replaced_snapshots_hand_their_events_and_alerts_forward() {
        let publisher = Publisher::new(8);
        let sub = publisher.subscribe();
        let event = ZoneEvent {
            track_id: 1,
            class_name: "person".into(),
            confidence: 0.9,
            zone_id: "pool".into(),
            zone_name: "Pool".into(),
            zone_kind: ZoneKind::Danger,
            event: ZoneEventKind::Enter,
            frames_inside: 3,
            timestamp: 1.0,
            synthetic: false,
        };
        let alert = Alert::from_event(&event);
        let mut first = match snapshot(1) {
            Message::Detection(s) => s,
            _ => unreachable!(),
        };
        first.zone_events.push(event.clone());
        first.alerts.push(alert.clone());
        publisher.publish(Message::Detection(first));
        publisher.publish(snapshot(2));
        publisher.publish(snapshot(3));

        let pending = sub.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(sub.dropped(), 2);
        match pending[0].as_ref() {
            Message::Detection(latest) => {
                assert_eq!(latest.seq, 3);
                assert_eq!(latest.zone_events, vec![event]);
                assert_eq!(latest.alerts, vec![alert]);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        // Owed facts are paid once.
        publisher.publish(snapshot(4));
        match sub.drain()[0].as_ref() {
            Message::Detection(latest) => assert!(latest.zone_events.is_empty()),
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn snapshot_evicted_by_full_queue_still_delivers_events() {
        let publisher = Publisher::new(2);
        let sub = publisher.subscribe();
        let mut first = match snapshot(1) {
            Message::Detection(s) => s,
            _ => unreachable!(),
        };
        first.zone_events.push(ZoneEvent {
            track_id: 4,
            class_name: "dog".into(),
            confidence: 0.8,
            zone_id: "edge".into(),
            zone_name: "Edge".into(),
            zone_kind: ZoneKind::Warning,
            event: ZoneEventKind::Exit,
            frames_inside: 0,
            timestamp: 1.0,
            synthetic: true,
        });
        publisher.publish(Message::Detection(first));
        publisher.publish(Message::ZonesCleared);
        publisher.publish(Message::ZonesCleared);
        publisher.publish(snapshot(2));

        let pending = sub.drain();
        let latest = pending.iter().find_map(|m| match m.as_ref() {
            Message::Detection(s) => Some(s.clone()),
            _ => None,
        });
        let latest = latest.expect("snapshot");
        assert_eq!(latest.seq, 2);
        assert_eq!(latest.zone_events.len(), 1);
        assert_eq!(latest.zone_events[0].event, ZoneEventKind::Exit);
    }

    #[test]
    fn control_messages_survive_snapshot_replacement() {
        let publisher = Publisher::new(8);
        let sub = publisher.subscribe();
        publisher.publish(snapshot(1));
        publisher.publish(Message::ZonesCleared);
        publisher.publish(snapshot(2));
        let kinds = summarize(&sub.drain());
        assert_eq!(kinds.get("zones_cleared"), Some(&1));
        assert_eq!(kinds.get("detection"), Some(&1));
    }

    #[test]
    fn full_queue_drops_oldest() {
        let publisher = Publisher::new(2);
        let sub = publisher.subscribe();
        for i in 0..4 {
            publisher.publish(Message::ZoneRemoved {
                zone_id: format!("z{}", i),
            });
        }
        let pending = sub.drain();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            *pending[0],
            Message::ZoneRemoved {
                zone_id: "z2".into()
            }
        );
        assert_eq!(sub.dropped(), 2);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let publisher = Publisher::new(4);
        let a = publisher.subscribe();
        let b = publisher.subscribe();
        assert_eq!(publisher.publish(snapshot(1)), 2);
        drop(b);
        assert_eq!(publisher.publish(snapshot(2)), 1);
        assert_eq!(publisher.subscriber_count(), 1);
        drop(a);
    }

    #[test]
    fn close_ends_stream_after_drain() {
        let publisher = Publisher::new(4);
        let sub = publisher.subscribe();
        publisher.publish(Message::status(
            StatusLevel::Info,
            PipelineState::Stopped,
            "stopped",
        ));
        publisher.close();
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_some());
        assert!(sub.recv_timeout(Duration::from_secs(5)).is_none());
        assert!(sub.is_closed());
    }

    #[test]
    fn messages_are_tagged_by_type() {
        let json = Message::status(StatusLevel::Warning, PipelineState::Stalled, "source gone")
            .to_json()
            .unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"state\":\"stalled\""));
        let json = snapshot(3).to_json().unwrap();
        assert!(json.contains("\"type\":\"detection\""));
        assert!(json.contains("\"seq\":3"));
    }
}
