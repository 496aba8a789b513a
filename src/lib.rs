//! Argos core
//!
//! Real-time multi-object detection and tracking over a single video source.
//!
//! # Architecture
//!
//! Each frame flows through one pipeline, strictly in order:
//!
//! 1. **Backends**: every enabled detector sees the frame in parallel, under a
//!    per-frame time budget. A late or failed backend contributes nothing.
//! 2. **Fusion**: per-backend lists become one list under the selected
//!    strategy (parallel, consensus, cascade, weighted, first_wins).
//! 3. **Tracker**: fused detections get stable ids that are never reused
//!    within a session.
//! 4. **Zones**: tracks are tested against user polygons with hysteresis,
//!    yielding enter / inside / exit events.
//! 5. **Alerts**: qualifying events become cooldown-gated alerts handed to a
//!    non-blocking sink.
//! 6. **Publish**: one snapshot per frame goes to every subscriber; slow
//!    subscribers drop their own stale snapshots.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: frames and pull-based frame sources
//! - `detect`: backend contract, registry, per-backend workers
//! - `fusion`, `tracker`, `zones`, `alerts`: the per-frame stages
//! - `pipeline`: control plane, frame loop, result stream
//! - `config`, `presets`: daemon configuration

pub mod alerts;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod geometry;
pub mod ingest;
pub mod pipeline;
pub mod presets;
pub mod tracker;
pub mod zones;

pub use alerts::{Alert, AlertConfig, AlertDispatcher, AlertPriority, AlertSink, SinkWorker};
pub use config::ArgosConfig;
pub use detect::{
    BackendCapabilities, BackendKind, BackendRegistry, Detection, DetectorBackend, Keypoint,
};
pub use error::PipelineError;
pub use frame::{Frame, FramePoll, FrameSource};
pub use fusion::{FusedDetection, FusionConfig, FusionEngine, FusionStrategy};
pub use geometry::{point_in_polygon, BBox, Point};
pub use ingest::{frame_channel, open_source, SourceConfig};
pub use pipeline::{
    ControlPlane, Message, Pipeline, PipelineConfig, PipelineHandle, Snapshot, Subscription,
};
pub use tracker::{Track, TrackState, Tracker, TrackerConfig};
pub use zones::{Zone, ZoneEvaluator, ZoneEvent, ZoneEventKind, ZoneKind, ZoneStore};
