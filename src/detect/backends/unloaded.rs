use anyhow::Result;

use crate::detect::backend::{BackendCapabilities, BackendKind, DetectParams, DetectorBackend};
use crate::detect::result::Detection;
use crate::error::PipelineError;
use crate::frame::Frame;

/// Placeholder for a backend whose model could not be loaded.
///
/// It stays registered so the registry reports it as unhealthy instead of
/// silently forgetting it. Every call fails with `BackendUnavailable`.
pub struct UnloadedBackend {
    kind: BackendKind,
    reason: String,
}

impl UnloadedBackend {
    pub fn new(kind: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl DetectorBackend for UnloadedBackend {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.kind.capabilities()
    }

    fn detect(&mut self, _frame: &Frame, _params: &DetectParams) -> Result<Vec<Detection>> {
        Err(PipelineError::BackendUnavailable {
            backend: self.kind.as_str().to_string(),
            reason: self.reason.clone(),
        }
        .into())
    }
}
