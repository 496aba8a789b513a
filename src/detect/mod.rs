mod backend;
pub mod backends;
mod registry;
mod result;
mod worker;

pub use backend::{
    BackendCapabilities, BackendKind, CancelToken, DetectParams, DetectorBackend, TargetKind,
};
pub use backends::{ScriptProbe, ScriptedBackend, StubBackend, UnloadedBackend};
pub use registry::{
    ActiveBackend, BackendFactory, BackendHealth, BackendRegistry, BackendStatus,
    CombinedCapabilities,
};
pub use result::{non_max_suppression, Detection, Keypoint};
pub use worker::{BackendWorker, WorkerReply};
