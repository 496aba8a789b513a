//! Zone events to rate-limited alerts.
//!
//! The dispatcher owns two maps keyed by (track id, zone id): the dwell
//! counter used for eligibility and the time of the last dispatched alert.
//! Both are cleaned up explicitly when a dwell ends, a track is deleted or a
//! zone goes away.

mod mqtt;
mod sink;

pub use mqtt::{MqttEndpoint, MqttSink};
pub use sink::{AlertSink, LogSink, MemorySink, SinkWorker};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::PipelineError;
use crate::zones::{ZoneEvent, ZoneEventKind, ZoneKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl AlertPriority {
    pub fn for_zone(kind: ZoneKind) -> Self {
        match kind {
            ZoneKind::Danger => AlertPriority::Urgent,
            ZoneKind::Warning => AlertPriority::High,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub message: String,
    pub priority: AlertPriority,
    pub zone_id: String,
    pub zone_name: String,
    pub zone_kind: ZoneKind,
    pub track_id: u64,
    pub class_name: String,
    pub confidence: f32,
    pub timestamp: f64,
    /// Whether the alert made it into the sink queue.
    pub sent: bool,
}

impl Alert {
    pub(crate) fn from_event(event: &ZoneEvent) -> Self {
        let title = match event.zone_kind {
            ZoneKind::Danger => "Danger zone alert",
            ZoneKind::Warning => "Zone warning",
        };
        Self {
            id: format!(
                "{}-{}-{}",
                event.track_id, event.zone_id, event.timestamp as i64
            ),
            title: title.to_string(),
            message: format!(
                "{} detected in {}",
                capitalize(&event.class_name),
                event.zone_name
            ),
            priority: AlertPriority::for_zone(event.zone_kind),
            zone_id: event.zone_id.clone(),
            zone_name: event.zone_name.clone(),
            zone_kind: event.zone_kind,
            track_id: event.track_id,
            class_name: event.class_name.clone(),
            confidence: event.confidence,
            timestamp: event.timestamp,
            sent: false,
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub min_confidence: f32,
    /// Consecutive frames inside before an event may alert.
    pub min_frames_in_zone: u32,
    pub cooldown_seconds: f64,
    /// Empty means every class alerts.
    pub alert_classes: Vec<String>,
    pub history_limit: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.7,
            min_frames_in_zone: 3,
            cooldown_seconds: 30.0,
            alert_classes: vec![
                "person".to_string(),
                "dog".to_string(),
                "cat".to_string(),
                "child".to_string(),
            ],
            history_limit: 20,
        }
    }
}

impl AlertConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(PipelineError::InvalidConfig(
                "alerts.min_confidence must be within [0, 1]".to_string(),
            )
            .into());
        }
        if !(self.cooldown_seconds.is_finite() && self.cooldown_seconds >= 0.0) {
            return Err(PipelineError::InvalidConfig(
                "alerts.cooldown_seconds must be >= 0".to_string(),
            )
            .into());
        }
        if self.history_limit == 0 {
            return Err(PipelineError::InvalidConfig(
                "alerts.history_limit must be > 0".to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn allows_class(&self, class_name: &str) -> bool {
        self.alert_classes.is_empty()
            || self
                .alert_classes
                .iter()
                .any(|c| c.eq_ignore_ascii_case(class_name))
    }
}

type PairKey = (u64, String);

pub struct AlertDispatcher {
    config: AlertConfig,
    dwell: HashMap<PairKey, u32>,
    last_alert: HashMap<PairKey, f64>,
    history: VecDeque<Alert>,
    sink: Option<SinkWorker>,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            dwell: HashMap::new(),
            last_alert: HashMap::new(),
            history: VecDeque::new(),
            sink: None,
        }
    }

    /// Forward dispatched alerts to `sink` without blocking the caller.
    pub fn with_sink(mut self, sink: SinkWorker) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: AlertConfig) {
        self.config = config;
        self.trim_history();
    }

    /// Turn this frame's zone events into alerts.
    pub fn process(&mut self, events: &[ZoneEvent]) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for event in events {
            let key = (event.track_id, event.zone_id.clone());
            match event.event {
                ZoneEventKind::Exit => {
                    self.dwell.remove(&key);
                    continue;
                }
                ZoneEventKind::Enter | ZoneEventKind::Inside => {
                    self.dwell.insert(key.clone(), event.frames_inside);
                }
            }
            if !self.config.enabled
                || event.confidence < self.config.min_confidence
                || !self.config.allows_class(&event.class_name)
            {
                continue;
            }
            let dwell = self.dwell.get(&key).copied().unwrap_or(0);
            if dwell < self.config.min_frames_in_zone {
                continue;
            }
            if let Some(last) = self.last_alert.get(&key) {
                if event.timestamp - last < self.config.cooldown_seconds {
                    continue;
                }
            }
            let mut alert = Alert::from_event(event);
            alert.sent = match &self.sink {
                Some(sink) => sink.submit(alert.clone()),
                None => false,
            };
            log::info!(
                "alert {} ({:?}): {}",
                alert.id,
                alert.priority,
                alert.message
            );
            self.last_alert.insert(key, event.timestamp);
            self.history.push_back(alert.clone());
            self.trim_history();
            alerts.push(alert);
        }
        alerts
    }

    /// Drop dwell state for deleted tracks.
    pub fn forget_tracks(&mut self, track_ids: &[u64]) {
        self.dwell.retain(|(track, _), _| !track_ids.contains(track));
        self.last_alert.retain(|(track, _), _| !track_ids.contains(track));
    }

    /// Drop dwell and cooldown state for a zone that was removed or disabled.
    pub fn forget_zone(&mut self, zone_id: &str) {
        self.dwell.retain(|(_, zone), _| zone != zone_id);
        self.last_alert.retain(|(_, zone), _| zone != zone_id);
    }

    /// Most recent alerts first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Number of (track, zone) pairs with live state.
    pub fn tracked_pairs(&self) -> usize {
        self.dwell.len().max(self.last_alert.len())
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.config.history_limit.max(1) {
            self.history.pop_front();
        }
    }
}
