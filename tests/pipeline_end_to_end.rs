use std::sync::Arc;
use std::time::{Duration, Instant};

use argos_core::detect::ScriptedBackend;
use argos_core::pipeline::{Message, PipelineState, Subscription};
use argos_core::{
    frame_channel, AlertConfig, BBox, BackendKind, ControlPlane, Detection, Frame, FusionConfig,
    FusionStrategy, Pipeline, PipelineConfig, PipelineHandle, Point, TrackerConfig, Zone,
    ZoneEventKind, ZoneKind,
};

const WAIT: Duration = Duration::from_secs(5);

fn person(b: [f32; 4], conf: f32) -> Detection {
    Detection::new(0, "person", conf, BBox::new(b[0], b[1], b[2], b[3]))
}

fn control_plane() -> ControlPlane {
    ControlPlane::new(
        FusionConfig {
            strategy: FusionStrategy::FirstWins,
            ..FusionConfig::default()
        },
        TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        },
        AlertConfig {
            min_frames_in_zone: 2,
            ..AlertConfig::default()
        },
        2,
    )
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        backend_timeout_ms: 300,
        frame_timeout_ms: 20,
        ..PipelineConfig::default()
    }
}

fn pool() -> Zone {
    Zone::new(
        "pool",
        "Pool",
        ZoneKind::Danger,
        vec![
            Point::new(0.0, 0.5),
            Point::new(1.0, 0.5),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
        ],
    )
}

fn wait_for<F>(sub: &Subscription, mut matches: F) -> Option<Arc<Message>>
where
    F: FnMut(&Message) -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(message) = sub.recv_timeout(Duration::from_millis(50)) {
            if matches(&message) {
                return Some(message);
            }
        }
    }
    None
}

fn is_state(message: &Message, wanted: PipelineState) -> bool {
    matches!(message, Message::Status { state, .. } if *state == wanted)
}

#[test]
fn pushed_frames_become_snapshots_with_stable_tracks_and_alerts() {
    let control = control_plane();
    // Feet at y = 0.8, inside the pool.
    control
        .add_prepared_backend(
            "stub",
            "swimmer",
            Box::new(
                ScriptedBackend::new(BackendKind::Stub)
                    .always(vec![person([40.0, 30.0, 60.0, 80.0], 0.9)]),
            ),
        )
        .unwrap();
    control.create_zone(pool()).unwrap();

    let pipeline = Pipeline::new(control, fast_config()).unwrap();
    let sub = pipeline.subscribe();
    let (feeder, source) = frame_channel(4);
    let handle = PipelineHandle::start(pipeline, Box::new(source)).unwrap();

    let mut snapshots = Vec::new();
    for seq in 1..=3u64 {
        feeder.push(Frame::blank(100, 100, seq as f64, seq)).unwrap();
        let message = wait_for(&sub, |m| m.is_snapshot()).expect("snapshot");
        if let Message::Detection(snapshot) = &*message {
            snapshots.push(snapshot.clone());
        }
    }

    let seqs: Vec<u64> = snapshots.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    for snapshot in &snapshots {
        assert_eq!(snapshot.active_track_ids, vec![1]);
        assert_eq!(snapshot.fusion_strategy, "first_wins");
    }
    let entered = &snapshots[1].zone_events;
    assert!(entered
        .iter()
        .any(|e| e.event == ZoneEventKind::Enter && e.zone_id == "pool"));
    let alerts: Vec<_> = snapshots.iter().flat_map(|s| s.alerts.iter()).collect();
    assert_eq!(alerts.len(), 1, "cooldown keeps one alert per track and zone");
    assert_eq!(alerts[0].track_id, 1);
    assert_eq!(alerts[0].zone_id, "pool");

    assert_eq!(handle.stats().frames_processed, 3);
    handle.stop().unwrap();
}

#[test]
fn idle_source_publishes_heartbeat_then_stalls_when_feeders_leave() {
    let pipeline = Pipeline::new(control_plane(), fast_config()).unwrap();
    let sub = pipeline.subscribe();
    let (feeder, source) = frame_channel(2);
    let handle = PipelineHandle::start(pipeline, Box::new(source)).unwrap();

    assert!(wait_for(&sub, |m| is_state(m, PipelineState::Idle)).is_some());
    drop(feeder);
    assert!(wait_for(&sub, |m| is_state(m, PipelineState::Stalled)).is_some());
    assert!(handle.is_running());

    handle.stop().unwrap();
}

#[test]
fn stop_releases_backends_and_ends_the_stream() {
    let control = control_plane();
    let backend = ScriptedBackend::new(BackendKind::Yolo).stall(Duration::from_secs(30));
    let probe = backend.probe();
    control
        .add_prepared_backend("yolo", "sleepy", Box::new(backend))
        .unwrap();

    let pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
    let sub = pipeline.subscribe();
    let (feeder, source) = frame_channel(2);
    let handle = PipelineHandle::start(pipeline, Box::new(source)).unwrap();
    feeder.push(Frame::blank(64, 64, 1.0, 1)).unwrap();
    while probe.calls() == 0 {
        std::thread::sleep(Duration::from_millis(2));
    }

    let started = Instant::now();
    handle.stop().unwrap();
    assert!(started.elapsed() < WAIT);
    assert!(probe.released());
    assert!(control.backends().unwrap().is_empty());

    let last = sub.drain().pop().expect("final message");
    assert!(is_state(&last, PipelineState::Stopped));
    assert!(sub.is_closed());
    assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
}

#[test]
fn control_changes_reach_the_running_loop() {
    let control = control_plane();
    control
        .add_prepared_backend(
            "stub",
            "walker",
            Box::new(
                ScriptedBackend::new(BackendKind::Stub)
                    .always(vec![person([40.0, 30.0, 60.0, 80.0], 0.9)]),
            ),
        )
        .unwrap();
    let pipeline = Pipeline::new(control.clone(), fast_config()).unwrap();
    let sub = pipeline.subscribe();
    let (feeder, source) = frame_channel(4);
    let handle = PipelineHandle::start(pipeline, Box::new(source)).unwrap();

    feeder.push(Frame::blank(100, 100, 1.0, 1)).unwrap();
    assert!(wait_for(&sub, |m| m.is_snapshot()).is_some());

    handle.control().create_zone(pool()).unwrap();
    handle.control().reset_tracker().unwrap();
    feeder.push(Frame::blank(100, 100, 2.0, 2)).unwrap();

    assert!(wait_for(&sub, |m| matches!(m, Message::ZoneAdded { zone } if zone.id == "pool")).is_some());
    let reset = wait_for(&sub, |m| matches!(m, Message::TrackerReset { .. })).expect("reset");
    if let Message::TrackerReset { dropped_tracks } = &*reset {
        assert_eq!(dropped_tracks, &vec![1]);
    }
    let message = wait_for(&sub, |m| m.is_snapshot()).expect("snapshot");
    if let Message::Detection(snapshot) = &*message {
        assert_eq!(snapshot.seq, 2);
        assert_eq!(snapshot.active_track_ids, vec![2]);
    }

    handle.stop().unwrap();
}
