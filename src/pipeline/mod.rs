//! Per-source frame loop.
//!
//! frame -> backends (in parallel, bounded wait) -> fusion -> tracker ->
//! zones -> alerts -> one published snapshot. Frames are processed strictly
//! one at a time in arrival order; tracker and zone state live on the loop
//! thread only.

mod control;
mod publish;

pub use control::{Command, ControlPlane, FrameConfig};
pub use publish::{
    summarize, BackendTiming, Message, PipelineState, Publisher, Snapshot, StatusLevel,
    Subscription, TrackView,
};

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alerts::{AlertDispatcher, SinkWorker};
use crate::detect::{BackendHealth, DetectParams, Detection};
use crate::error::PipelineError;
use crate::frame::{now_secs, Frame, FramePoll, FrameSource};
use crate::fusion::{BackendOutput, FusionEngine};
use crate::tracker::{Track, Tracker};
use crate::zones::{ZoneEvaluator, ZoneEvent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-frame budget for every backend call.
    pub backend_timeout_ms: u64,
    /// How long to wait for a frame before publishing an idle heartbeat.
    pub frame_timeout_ms: u64,
    pub subscriber_queue: usize,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend_timeout_ms: 500,
            frame_timeout_ms: 1000,
            subscriber_queue: 8,
            confidence_threshold: 0.25,
            nms_iou_threshold: 0.45,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> anyhow::Error {
            PipelineError::InvalidConfig(format!("pipeline.{}", msg)).into()
        };
        if self.backend_timeout_ms == 0 {
            return Err(invalid("backend_timeout_ms must be > 0"));
        }
        if self.frame_timeout_ms == 0 {
            return Err(invalid("frame_timeout_ms must be > 0"));
        }
        if self.subscriber_queue == 0 {
            return Err(invalid("subscriber_queue must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid("confidence_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.nms_iou_threshold) {
            return Err(invalid("nms_iou_threshold must be within [0, 1]"));
        }
        Ok(())
    }

    fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStats {
    pub session_id: String,
    pub state: PipelineState,
    pub frames_processed: u64,
    pub frames_failed: u64,
    /// Frames whose seq was not newer than the last processed one.
    pub frames_skipped: u64,
    pub idle_polls: u64,
    pub last_seq: Option<u64>,
    pub active_tracks: usize,
    pub alerts_dispatched: u64,
    pub backend_failures: u64,
    pub subscribers: usize,
}

impl PipelineStats {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            state: PipelineState::Idle,
            frames_processed: 0,
            frames_failed: 0,
            frames_skipped: 0,
            idle_polls: 0,
            last_seq: None,
            active_tracks: 0,
            alerts_dispatched: 0,
            backend_failures: 0,
            subscribers: 0,
        }
    }
}

/// The per-frame state machine. Drive it with [`Pipeline::process_frame`]
/// directly, or hand it to [`PipelineHandle::start`] to run on its own thread.
pub struct Pipeline {
    control: ControlPlane,
    publisher: Arc<Publisher>,
    config: PipelineConfig,
    fusion: FusionEngine,
    tracker: Tracker,
    evaluator: ZoneEvaluator,
    dispatcher: AlertDispatcher,
    zones_revision: Option<u64>,
    last_seq: Option<u64>,
    stats: Arc<Mutex<PipelineStats>>,
}

impl Pipeline {
    pub fn new(control: ControlPlane, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let publisher = Arc::new(Publisher::new(config.subscriber_queue));
        Ok(Self {
            fusion: FusionEngine::new(control.fusion()?),
            tracker: Tracker::new(control.tracker()?),
            evaluator: ZoneEvaluator::new(control.min_frames_inside()?),
            dispatcher: AlertDispatcher::new(control.alerts()?),
            control,
            publisher,
            config,
            zones_revision: None,
            last_seq: None,
            stats: Arc::new(Mutex::new(PipelineStats::new(session_id()))),
        })
    }

    /// Forward alerts to a sink running on its own thread.
    pub fn with_alert_sink(mut self, sink: SinkWorker) -> Self {
        let config = self.dispatcher.config().clone();
        self.dispatcher = AlertDispatcher::new(config).with_sink(sink);
        self
    }

    pub fn control(&self) -> ControlPlane {
        self.control.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        read_stats(&self.stats)
    }

    pub fn tracks(&self) -> &[Track] {
        self.tracker.tracks()
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<crate::alerts::Alert> {
        self.dispatcher.recent(limit)
    }

    /// True when `seq` is not newer than the last processed frame.
    pub fn is_stale(&self, seq: u64) -> bool {
        self.last_seq.map_or(false, |last| seq <= last)
    }

    /// Run one frame through every stage and publish its snapshot.
    ///
    /// Frames must arrive with increasing `seq`; a repeated or older frame
    /// is rejected without touching tracker or zone state.
    pub fn process_frame(&mut self, frame: Frame) -> Result<Snapshot> {
        if let Some(last) = self.last_seq.filter(|last| frame.seq <= *last) {
            return Err(anyhow!(
                "frame {} is not newer than frame {}",
                frame.seq,
                last
            ));
        }
        self.last_seq = Some(frame.seq);
        let started = Instant::now();
        let frame_config = self.control.frame_config()?;
        let mut zone_events = self.apply_frame_config(&frame_config, frame.timestamp);

        let inference_started = Instant::now();
        let (outputs, timing) = self.run_backends(&frame_config, &frame);
        let inference_ms = inference_started.elapsed().as_secs_f64() * 1000.0;

        let fused = self.fusion.fuse(&outputs);
        let update = self.tracker.update(&fused.detections, frame.timestamp);

        let observed: Vec<&Track> = update
            .observed
            .iter()
            .filter_map(|id| self.tracker.get(*id))
            .collect();
        let scale = (frame.width.max(1) as f32, frame.height.max(1) as f32);
        zone_events.extend(self.evaluator.evaluate(&observed, scale, frame.timestamp));
        let deleted: Vec<u64> = update.deleted.iter().map(|t| t.id).collect();
        zone_events.extend(self.evaluator.remove_tracks(&deleted, frame.timestamp));

        let alerts = self.dispatcher.process(&zone_events);
        self.dispatcher.forget_tracks(&deleted);

        let tracks: Vec<TrackView> = self.tracker.tracks().iter().map(TrackView::from).collect();
        let snapshot = Snapshot {
            seq: frame.seq,
            timestamp: frame.timestamp,
            frame_width: frame.width,
            frame_height: frame.height,
            class_counts: publish::class_counts(&fused.detections),
            detections: fused.detections,
            active_track_ids: tracks.iter().map(|t| t.id).collect(),
            tracks,
            zone_events,
            alerts,
            timing,
            inference_ms,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
            fusion_strategy: fused.strategy,
            backends_used: fused.backends_used,
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.state = PipelineState::Running;
            stats.frames_processed += 1;
            stats.last_seq = Some(frame.seq);
            stats.active_tracks = snapshot.tracks.len();
            stats.alerts_dispatched += snapshot.alerts.len() as u64;
            stats.backend_failures +=
                snapshot.timing.iter().filter(|t| t.outcome != "ok").count() as u64;
            stats.subscribers = self.publisher.subscriber_count();
        }
        self.publisher.publish(Message::Detection(snapshot.clone()));
        Ok(snapshot)
    }

    /// Bring stage configuration in line with this frame's snapshot.
    /// Returns synthetic zone events caused by zone or tracker changes.
    fn apply_frame_config(&mut self, cfg: &FrameConfig, timestamp: f64) -> Vec<ZoneEvent> {
        self.fusion.set_config(cfg.fusion.clone());
        self.tracker.set_config(cfg.tracker.clone());
        if self.dispatcher.config() != &cfg.alerts {
            self.dispatcher.set_config(cfg.alerts.clone());
        }
        self.evaluator.set_min_frames_inside(cfg.min_frames_inside);

        let mut events = Vec::new();
        if self.zones_revision != Some(cfg.zones_revision) {
            let before: HashSet<String> = active_zone_ids(self.evaluator.zones());
            events.extend(self.evaluator.set_zones(cfg.zones.clone(), timestamp));
            let after = active_zone_ids(&cfg.zones);
            for gone in before.difference(&after) {
                self.dispatcher.forget_zone(gone);
            }
            self.zones_revision = Some(cfg.zones_revision);
        }
        for change in &cfg.zone_changes {
            self.publisher.publish(Message::from(change.clone()));
        }

        for command in &cfg.commands {
            match command {
                Command::ResetTracker => {
                    let dropped: Vec<u64> = self.tracker.reset().iter().map(|t| t.id).collect();
                    events.extend(self.evaluator.remove_tracks(&dropped, timestamp));
                    self.dispatcher.forget_tracks(&dropped);
                    self.publisher.publish(Message::TrackerReset {
                        dropped_tracks: dropped,
                    });
                }
            }
        }
        events
    }

    /// Hand the frame to every enabled backend and collect answers until the
    /// budget runs out. Late backends count as having found nothing.
    fn run_backends(
        &mut self,
        cfg: &FrameConfig,
        frame: &Frame,
    ) -> (Vec<BackendOutput>, Vec<BackendTiming>) {
        let params = DetectParams {
            confidence_threshold: self.config.confidence_threshold,
            iou_threshold: self.config.nms_iou_threshold,
            ..DetectParams::default()
        };
        let started = Instant::now();
        let deadline = started + self.config.backend_timeout();
        let (tx, rx) = mpsc::channel();
        let mut results: HashMap<String, (BackendHealth, Vec<Detection>, Duration)> =
            HashMap::new();
        let mut waiting = 0usize;
        for backend in &cfg.backends {
            match backend.worker.dispatch(frame.clone(), &params, tx.clone()) {
                Ok(()) => waiting += 1,
                Err(e) => {
                    log::warn!("backend {} not dispatched: {}", backend.id, e);
                    results.insert(
                        backend.id.clone(),
                        (BackendHealth::Unavailable, Vec::new(), Duration::ZERO),
                    );
                }
            }
        }
        drop(tx);

        while waiting > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(reply) => {
                    if reply.seq != frame.seq {
                        continue;
                    }
                    waiting -= 1;
                    let entry = match reply.outcome {
                        Ok(dets) => (BackendHealth::Ok, dets, reply.elapsed),
                        Err(e) => {
                            log::warn!("backend {} failed on frame {}: {}", reply.backend_id, frame.seq, e);
                            let health = match PipelineError::of(&e) {
                                Some(PipelineError::InferenceTimeout { .. }) => BackendHealth::TimedOut,
                                _ => BackendHealth::Unavailable,
                            };
                            (health, Vec::new(), reply.elapsed)
                        }
                    };
                    results.insert(reply.backend_id, entry);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let budget_ms = self.config.backend_timeout_ms;
        let mut outputs = Vec::with_capacity(cfg.backends.len());
        let mut timing = Vec::with_capacity(cfg.backends.len());
        let mut outcomes = Vec::with_capacity(cfg.backends.len());
        for backend in &cfg.backends {
            let (health, detections, elapsed) = results.remove(&backend.id).unwrap_or_else(|| {
                log::warn!(
                    "{}",
                    PipelineError::InferenceTimeout {
                        backend: backend.id.clone(),
                        budget_ms,
                    }
                );
                (BackendHealth::TimedOut, Vec::new(), started.elapsed())
            });
            timing.push(BackendTiming {
                backend_id: backend.id.clone(),
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                outcome: match health {
                    BackendHealth::Ok => "ok",
                    BackendHealth::Unavailable => "unavailable",
                    BackendHealth::TimedOut => "timed_out",
                },
                detections: detections.len(),
            });
            outcomes.push((backend.id.clone(), health));
            outputs.push(BackendOutput {
                backend_id: backend.id.clone(),
                kind: backend.kind,
                order: backend.order,
                weight: backend.weight,
                supports_pose: backend.supports_pose,
                responded: health == BackendHealth::Ok,
                detections,
            });
        }
        if let Err(e) = self.control.record_outcomes(&outcomes) {
            log::warn!("backend health not recorded: {}", e);
        }
        (outputs, timing)
    }

    fn publish_status(&self, level: StatusLevel, state: PipelineState, message: String) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.state = state;
            stats.subscribers = self.publisher.subscriber_count();
        }
        self.publisher.publish(Message::status(level, state, message));
    }
}

fn active_zone_ids(zones: &[crate::zones::Zone]) -> HashSet<String> {
    zones
        .iter()
        .filter(|z| z.enabled)
        .map(|z| z.id.clone())
        .collect()
}

fn read_stats(stats: &Arc<Mutex<PipelineStats>>) -> PipelineStats {
    match stats.lock() {
        Ok(s) => s.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Running pipeline session.
pub struct PipelineHandle {
    control: ControlPlane,
    publisher: Arc<Publisher>,
    stats: Arc<Mutex<PipelineStats>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Start the frame loop on its own thread.
    pub fn start(pipeline: Pipeline, source: Box<dyn FrameSource>) -> Result<Self> {
        let control = pipeline.control();
        let publisher = pipeline.publisher();
        let stats = pipeline.stats.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("argos-pipeline".to_string())
            .spawn(move || run_loop(pipeline, source, thread_stop))
            .map_err(|e| anyhow!("failed to spawn pipeline thread: {}", e))?;
        Ok(Self {
            control,
            publisher,
            stats,
            stop,
            join: Some(join),
        })
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    pub fn control(&self) -> ControlPlane {
        self.control.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        read_stats(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().map(|j| !j.is_finished()).unwrap_or(false)
    }

    /// Cancel in-flight inference, stop the loop, release every backend and
    /// publish the final `stopped` status.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::SeqCst);
        let released = self.control.release_backends()?;
        if join.join().is_err() {
            log::error!("pipeline thread panicked");
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.state = PipelineState::Stopped;
        }
        self.publisher.publish(Message::status(
            StatusLevel::Info,
            PipelineState::Stopped,
            format!("pipeline stopped, {} backends released", released),
        ));
        self.publisher.close();
        log::info!("pipeline stopped");
        Ok(())
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("pipeline shutdown: {}", e);
        }
    }
}

fn run_loop(mut pipeline: Pipeline, mut source: Box<dyn FrameSource>, stop: Arc<AtomicBool>) {
    let description = source.describe();
    log::info!("pipeline started on {}", description);
    pipeline.publish_status(
        StatusLevel::Info,
        PipelineState::Running,
        format!("pipeline started on {}", description),
    );
    let frame_timeout = pipeline.config.frame_timeout();
    let mut stalled = false;
    while !stop.load(Ordering::SeqCst) {
        match source.next_frame(frame_timeout) {
            Ok(FramePoll::Frame(frame)) => {
                if stalled {
                    log::info!("frame source {} resumed", description);
                    stalled = false;
                }
                let seq = frame.seq;
                if pipeline.is_stale(seq) {
                    log::warn!(
                        "frame {} from {} is out of order, skipped",
                        seq,
                        description
                    );
                    if let Ok(mut stats) = pipeline.stats.lock() {
                        stats.frames_skipped += 1;
                    }
                    continue;
                }
                if let Err(e) = pipeline.process_frame(frame) {
                    log::error!("frame {} failed: {:#}", seq, e);
                    if let Ok(mut stats) = pipeline.stats.lock() {
                        stats.frames_failed += 1;
                    }
                    pipeline.publish_status(
                        StatusLevel::Error,
                        PipelineState::Running,
                        format!("frame {} failed: {}", seq, e),
                    );
                }
            }
            Ok(FramePoll::NotReady) => {
                if let Ok(mut stats) = pipeline.stats.lock() {
                    stats.idle_polls += 1;
                }
                pipeline.publish_status(
                    StatusLevel::Info,
                    PipelineState::Idle,
                    format!("no frame within {}ms", frame_timeout.as_millis()),
                );
            }
            Ok(FramePoll::Disconnected) => {
                if !stalled {
                    log::warn!("frame source {} disconnected", description);
                    stalled = true;
                }
                pipeline.publish_status(
                    StatusLevel::Warning,
                    PipelineState::Stalled,
                    format!("frame source {} disconnected", description),
                );
                std::thread::sleep(frame_timeout);
            }
            Err(e) => {
                log::error!("frame source {} error: {:#}", description, e);
                pipeline.publish_status(
                    StatusLevel::Error,
                    PipelineState::Stalled,
                    format!("frame source error: {}", e),
                );
                std::thread::sleep(frame_timeout);
            }
        }
    }
    log::debug!("pipeline loop exited at {:.3}", now_secs());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertConfig;
    use crate::detect::{BackendKind, ScriptedBackend};
    use crate::fusion::{FusionConfig, FusionStrategy};
    use crate::geometry::{BBox, Point};
    use crate::tracker::TrackerConfig;
    use crate::zones::{Zone, ZoneEventKind, ZoneKind};

    fn person(b: [f32; 4], conf: f32) -> Detection {
        Detection::new(0, "person", conf, BBox::new(b[0], b[1], b[2], b[3]))
    }

    fn plane(strategy: FusionStrategy) -> ControlPlane {
        ControlPlane::new(
            FusionConfig {
                strategy,
                ..FusionConfig::default()
            },
            TrackerConfig {
                min_hits: 1,
                ..TrackerConfig::default()
            },
            AlertConfig {
                min_frames_in_zone: 1,
                ..AlertConfig::default()
            },
            2,
        )
    }

    fn frame(seq: u64) -> Frame {
        Frame::blank(100, 100, seq as f64, seq)
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            backend_timeout_ms: 200,
            frame_timeout_ms: 20,
            ..PipelineConfig::default()
        }
    }

    fn whole_frame_zone() -> Zone {
        Zone::new(
            "yard",
            "Yard",
            ZoneKind::Danger,
            vec![
                Point::new(0.0, 0.0),
                Point::new(1.0, 0.0),
                Point::new(1.0, 1.0),
                Point::new(0.0, 1.0),
            ],
        )
    }

    #[test]
    fn no_backends_yields_empty_snapshot() {
        let mut pipeline = Pipeline::new(plane(FusionStrategy::Parallel), fast_config()).unwrap();
        let snapshot = pipeline.process_frame(frame(1)).unwrap();
        assert!(snapshot.detections.is_empty());
        assert!(snapshot.tracks.is_empty());
    }

    #[test]
    fn parallel_scenario_fuses_to_one_detection() {
        let control = plane(FusionStrategy::Parallel);
        control
            .add_prepared_backend(
                "yolo",
                "a",
                Box::new(ScriptedBackend::new(BackendKind::Yolo).always(vec![person([10.0, 10.0, 50.0, 50.0], 0.9)])),
            )
            .unwrap();
        control
            .add_prepared_backend(
                "sleap",
                "b",
                Box::new(ScriptedBackend::new(BackendKind::Sleap).always(vec![person([12.0, 11.0, 52.0, 49.0], 0.6)])),
            )
            .unwrap();
        let mut pipeline = Pipeline::new(control, fast_config()).unwrap();
        let snapshot = pipeline.process_frame(frame(1)).unwrap();
        assert_eq!(snapshot.detections.len(), 1);
        assert_eq!(snapshot.detections[0].confidence, 0.9);
        assert_eq!(snapshot.timing.len(), 2);
        assert_eq!(snapshot.class_counts.get("person"), Some(&1));
    }

    #[test]
    fn slow_backend_is_treated_as_empty_and_marked_timed_out() {
        let control = plane(FusionStrategy::Parallel);
        control
            .add_prepared_backend(
                "yolo",
                "fast",
                Box::new(ScriptedBackend::new(BackendKind::Yolo).always(vec![person([10.0, 10.0, 50.0, 50.0], 0.9)])),
            )
            .unwrap();
        let slow = control
            .add_prepared_backend(
                "sleap",
                "slow",
                Box::new(ScriptedBackend::new(BackendKind::Sleap).stall(Duration::from_secs(5))),
            )
            .unwrap();
        let mut pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
        let started = Instant::now();
        let snapshot = pipeline.process_frame(frame(1)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(snapshot.detections.len(), 1);
        let slow_timing = snapshot.timing.iter().find(|t| t.backend_id == slow).unwrap();
        assert_eq!(slow_timing.outcome, "timed_out");
        assert_eq!(
            control.backend_status(&slow).unwrap().health,
            BackendHealth::TimedOut
        );
        control.release_backends().unwrap();
    }

    #[test]
    fn zone_alert_flow_and_tracker_reset() {
        let control = plane(FusionStrategy::FirstWins);
        control
            .add_prepared_backend(
                "stub",
                "walker",
                Box::new(ScriptedBackend::new(BackendKind::Stub).always(vec![person([40.0, 20.0, 60.0, 80.0], 0.9)])),
            )
            .unwrap();
        control.create_zone(whole_frame_zone()).unwrap();
        let mut pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
        let sub = pipeline.subscribe();

        let first = pipeline.process_frame(frame(1)).unwrap();
        assert!(first.zone_events.is_empty());
        let second = pipeline.process_frame(frame(2)).unwrap();
        let kinds: Vec<ZoneEventKind> = second.zone_events.iter().map(|e| e.event).collect();
        assert_eq!(kinds, vec![ZoneEventKind::Enter, ZoneEventKind::Inside]);
        assert_eq!(second.alerts.len(), 1);
        assert_eq!(second.alerts[0].title, "Danger zone alert");

        control.reset_tracker().unwrap();
        let third = pipeline.process_frame(frame(3)).unwrap();
        assert!(third
            .zone_events
            .iter()
            .any(|e| e.event == ZoneEventKind::Exit && e.synthetic));
        // The detection comes back under a fresh id.
        assert_eq!(third.active_track_ids, vec![2]);

        let counts = summarize(&sub.drain());
        assert_eq!(counts.get("zone_added"), Some(&1));
        assert_eq!(counts.get("tracker_reset"), Some(&1));
        control.release_backends().unwrap();
    }

    #[test]
    fn deleting_zone_emits_synthetic_exit_next_frame() {
        let control = plane(FusionStrategy::Parallel);
        control
            .add_prepared_backend(
                "yolo",
                "m",
                Box::new(ScriptedBackend::new(BackendKind::Yolo).always(vec![person([40.0, 20.0, 60.0, 80.0], 0.9)])),
            )
            .unwrap();
        control.create_zone(whole_frame_zone()).unwrap();
        let mut pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
        pipeline.process_frame(frame(1)).unwrap();
        pipeline.process_frame(frame(2)).unwrap();
        control.delete_zone("yard").unwrap();
        let snapshot = pipeline.process_frame(frame(3)).unwrap();
        assert_eq!(snapshot.zone_events.len(), 1);
        assert_eq!(snapshot.zone_events[0].event, ZoneEventKind::Exit);
        assert!(snapshot.zone_events[0].synthetic);
        control.release_backends().unwrap();
    }

    #[test]
    fn slow_subscriber_still_receives_enter_and_alert() {
        let control = plane(FusionStrategy::FirstWins);
        control
            .add_prepared_backend(
                "stub",
                "swimmer",
                Box::new(ScriptedBackend::new(BackendKind::Stub).always(vec![person([40.0, 20.0, 60.0, 80.0], 0.9)])),
            )
            .unwrap();
        control.create_zone(whole_frame_zone()).unwrap();
        let mut pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
        let sub = pipeline.subscribe();
        for seq in 1..=3 {
            pipeline.process_frame(frame(seq)).unwrap();
        }

        let snapshots: Vec<Snapshot> = sub
            .drain()
            .iter()
            .filter_map(|m| match m.as_ref() {
                Message::Detection(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].seq, 3);
        let kinds: Vec<ZoneEventKind> = snapshots[0].zone_events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![ZoneEventKind::Enter, ZoneEventKind::Inside, ZoneEventKind::Inside]
        );
        assert_eq!(snapshots[0].alerts.len(), 1);
        control.release_backends().unwrap();
    }

    #[test]
    fn panicking_backend_recovers_on_next_frame() {
        let control = plane(FusionStrategy::Parallel);
        let id = control
            .add_prepared_backend(
                "yolo",
                "flaky",
                Box::new(
                    ScriptedBackend::new(BackendKind::Yolo)
                        .panic_at(1)
                        .always(vec![person([10.0, 10.0, 50.0, 50.0], 0.9)]),
                ),
            )
            .unwrap();
        let mut pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();

        let started = Instant::now();
        let first = pipeline.process_frame(frame(1)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(fast_config().backend_timeout_ms));
        assert!(first.detections.is_empty());
        assert_eq!(first.timing[0].outcome, "unavailable");

        for seq in 2..=4 {
            let snapshot = pipeline.process_frame(frame(seq)).unwrap();
            assert_eq!(snapshot.detections.len(), 1);
            assert_eq!(snapshot.timing[0].outcome, "ok");
        }
        assert_eq!(control.backend_status(&id).unwrap().health, BackendHealth::Ok);
        control.release_backends().unwrap();
    }

    #[test]
    fn repeated_or_older_frames_are_rejected() {
        let control = plane(FusionStrategy::Parallel);
        control
            .add_prepared_backend(
                "stub",
                "walker",
                Box::new(ScriptedBackend::new(BackendKind::Stub).always(vec![person([40.0, 20.0, 60.0, 80.0], 0.9)])),
            )
            .unwrap();
        let mut pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
        pipeline.process_frame(frame(5)).unwrap();
        let track = pipeline.tracks()[0].clone();

        assert!(pipeline.is_stale(5));
        assert!(pipeline.is_stale(3));
        assert!(pipeline.process_frame(frame(5)).is_err());
        assert!(pipeline.process_frame(frame(3)).is_err());
        assert_eq!(pipeline.tracks()[0].hits, track.hits);
        assert_eq!(pipeline.stats().frames_processed, 1);

        assert!(!pipeline.is_stale(6));
        pipeline.process_frame(frame(6)).unwrap();
        assert_eq!(pipeline.stats().last_seq, Some(6));
        control.release_backends().unwrap();
    }
}
