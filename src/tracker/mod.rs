//! Identity tracking across frames.
//!
//! Each frame: predict every live track forward, match predictions to fused
//! detections by IoU with an optimal assignment, then update, spawn, or age
//! tracks. Track ids come from a session counter that never rewinds, not even
//! on `reset`.

pub mod assignment;

use serde::{Deserialize, Serialize};

use crate::detect::Keypoint;
use crate::fusion::FusedDetection;
use crate::geometry::{BBox, Point};

use assignment::FORBIDDEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Unconfirmed,
    Confirmed,
    Lost,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU between a predicted box and a detection to match.
    pub match_iou_threshold: f32,
    /// Consecutive matches before a track is confirmed.
    pub min_hits: u32,
    /// Misses tolerated; one more deletes the track.
    pub max_missed_frames: u32,
    /// Match across class boundaries.
    pub class_agnostic: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_iou_threshold: 0.3,
            min_hits: 3,
            max_missed_frames: 30,
            class_agnostic: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Track {
    pub id: u64,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keypoints: Vec<Keypoint>,
    pub contributors: Vec<String>,
    pub state: TrackState,
    /// Frames alive, counting the creation frame.
    pub age: u32,
    /// Consecutive matched frames.
    pub hits: u32,
    /// Consecutive frames without a match.
    pub missed: u32,
    /// Centre displacement per frame.
    pub velocity: (f32, f32),
    pub first_seen: f64,
    pub last_seen: f64,
    #[serde(skip)]
    ever_confirmed: bool,
}

impl Track {
    /// Where the track is expected to be on the coming frame.
    pub fn predicted_bbox(&self) -> BBox {
        let steps = (self.missed + 1) as f32;
        self.bbox
            .translate(self.velocity.0 * steps, self.velocity.1 * steps)
    }

    pub fn reference_point(&self) -> Point {
        self.bbox.bottom_center()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    fn apply(&mut self, det: &FusedDetection, timestamp: f64, min_hits: u32) {
        let prev = self.bbox.center();
        let next = det.bbox.center();
        let steps = (self.missed + 1) as f32;
        self.velocity = ((next.x - prev.x) / steps, (next.y - prev.y) / steps);
        self.bbox = det.bbox;
        self.class_id = det.class_id;
        self.class_name = det.class_name.clone();
        self.confidence = det.confidence;
        self.keypoints = det.keypoints.clone();
        self.contributors = det.contributors.clone();
        self.hits += 1;
        self.missed = 0;
        self.last_seen = timestamp;
        if self.ever_confirmed || self.hits >= min_hits {
            self.ever_confirmed = true;
            self.state = TrackState::Confirmed;
        } else {
            self.state = TrackState::Unconfirmed;
        }
    }
}

/// What changed in one `update` call.
#[derive(Clone, Debug, Default)]
pub struct TrackerUpdate {
    /// Ids matched or created this frame, ascending.
    pub observed: Vec<u64>,
    /// Ids created this frame.
    pub created: Vec<u64>,
    /// Tracks that crossed the miss threshold, in their final (deleted) state.
    pub deleted: Vec<Track>,
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Thresholds apply from the next update; live tracks are kept.
    pub fn set_config(&mut self, config: TrackerConfig) {
        self.config = config;
    }

    /// Live tracks ordered by id.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Drop every track. Ids keep counting from where they were.
    pub fn reset(&mut self) -> Vec<Track> {
        let mut dropped: Vec<Track> = self.tracks.drain(..).collect();
        for track in &mut dropped {
            track.state = TrackState::Deleted;
        }
        log::info!("tracker reset, {} tracks dropped", dropped.len());
        dropped
    }

    fn compatible(&self, track: &Track, det: &FusedDetection) -> bool {
        self.config.class_agnostic || track.class_id == det.class_id
    }

    pub fn update(&mut self, detections: &[FusedDetection], timestamp: f64) -> TrackerUpdate {
        let predicted: Vec<BBox> = self.tracks.iter().map(Track::predicted_bbox).collect();
        let threshold = self.config.match_iou_threshold;
        let cost: Vec<Vec<f64>> = self
            .tracks
            .iter()
            .zip(&predicted)
            .map(|(track, pred)| {
                detections
                    .iter()
                    .map(|det| {
                        if !self.compatible(track, det) {
                            return FORBIDDEN;
                        }
                        let iou = pred.iou(&det.bbox);
                        if iou < threshold || iou <= 0.0 {
                            FORBIDDEN
                        } else {
                            1.0 - iou as f64
                        }
                    })
                    .collect()
            })
            .collect();
        let assignment = assignment::solve(&cost);

        let mut update = TrackerUpdate::default();
        let mut det_taken = vec![false; detections.len()];
        let min_hits = self.config.min_hits;
        let max_missed = self.config.max_missed_frames;

        for (track, assigned) in self.tracks.iter_mut().zip(&assignment) {
            track.age += 1;
            match assigned {
                Some(d) => {
                    det_taken[*d] = true;
                    track.apply(&detections[*d], timestamp, min_hits);
                    update.observed.push(track.id);
                }
                None => {
                    track.missed += 1;
                    track.hits = 0;
                    track.state = if track.missed > max_missed {
                        TrackState::Deleted
                    } else {
                        TrackState::Lost
                    };
                }
            }
        }

        let (deleted, live): (Vec<Track>, Vec<Track>) = self
            .tracks
            .drain(..)
            .partition(|t| t.state == TrackState::Deleted);
        self.tracks = live;
        for track in &deleted {
            log::debug!("track {} deleted after {} missed frames", track.id, track.missed);
        }
        update.deleted = deleted;

        for (det, taken) in detections.iter().zip(det_taken) {
            if taken {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let confirmed = min_hits <= 1;
            self.tracks.push(Track {
                id,
                class_id: det.class_id,
                class_name: det.class_name.clone(),
                confidence: det.confidence,
                bbox: det.bbox,
                keypoints: det.keypoints.clone(),
                contributors: det.contributors.clone(),
                state: if confirmed {
                    TrackState::Confirmed
                } else {
                    TrackState::Unconfirmed
                },
                age: 1,
                hits: 1,
                missed: 0,
                velocity: (0.0, 0.0),
                first_seen: timestamp,
                last_seen: timestamp,
                ever_confirmed: confirmed,
            });
            log::debug!("track {} created ({})", id, det.class_name);
            update.observed.push(id);
            update.created.push(id);
        }
        update.observed.sort_unstable();
        update
    }
}
