//! Domain error taxonomy.
//!
//! Every failure the pipeline reports to a caller is carried inside
//! `anyhow::Error`. The variants below are the ones callers are expected to
//! branch on; recover them with [`PipelineError::of`].

/// Closed set of pipeline failures with stable codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// Model not loaded or hardware failure.
    BackendUnavailable { backend: String, reason: String },
    /// Backend exceeded its per-frame budget.
    InferenceTimeout { backend: String, budget_ms: u64 },
    UnknownBackendType(String),
    BackendNotFound(String),
    InvalidPolygon { zone: String, reason: String },
    ZoneNotFound(String),
    FusionStrategyMisconfigured(String),
    InvalidConfig(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            PipelineError::InferenceTimeout { .. } => "INFERENCE_TIMEOUT",
            PipelineError::UnknownBackendType(_) => "UNKNOWN_BACKEND_TYPE",
            PipelineError::BackendNotFound(_) => "BACKEND_NOT_FOUND",
            PipelineError::InvalidPolygon { .. } => "INVALID_POLYGON",
            PipelineError::ZoneNotFound(_) => "ZONE_NOT_FOUND",
            PipelineError::FusionStrategyMisconfigured(_) => "FUSION_STRATEGY_MISCONFIGURED",
            PipelineError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Find a `PipelineError` anywhere in an error chain.
    pub fn of(err: &anyhow::Error) -> Option<&PipelineError> {
        err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
    }

    /// True for failures that only cost one backend its contribution to a frame.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendUnavailable { .. } | PipelineError::InferenceTimeout { .. }
        )
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::BackendUnavailable { backend, reason } => {
                write!(f, "{}: backend {} unavailable: {}", self.code(), backend, reason)
            }
            PipelineError::InferenceTimeout { backend, budget_ms } => write!(
                f,
                "{}: backend {} exceeded {}ms budget",
                self.code(),
                backend,
                budget_ms
            ),
            PipelineError::UnknownBackendType(kind) => {
                write!(f, "{}: unknown backend type '{}'", self.code(), kind)
            }
            PipelineError::BackendNotFound(id) => {
                write!(f, "{}: no backend with id '{}'", self.code(), id)
            }
            PipelineError::InvalidPolygon { zone, reason } => {
                write!(f, "{}: zone '{}': {}", self.code(), zone, reason)
            }
            PipelineError::ZoneNotFound(id) => {
                write!(f, "{}: no zone with id '{}'", self.code(), id)
            }
            PipelineError::FusionStrategyMisconfigured(msg)
            | PipelineError::InvalidConfig(msg) => write!(f, "{}: {}", self.code(), msg),
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn recovers_variant_through_context() {
        let err: anyhow::Error = PipelineError::ZoneNotFound("gate".into()).into();
        let err = Err::<(), _>(err).context("updating zone").unwrap_err();
        let found = PipelineError::of(&err).expect("variant");
        assert_eq!(found.code(), "ZONE_NOT_FOUND");
        assert!(err.root_cause().to_string().contains("gate"));
    }

    #[test]
    fn only_backend_failures_are_transient() {
        assert!(PipelineError::InferenceTimeout {
            backend: "yolo_1".into(),
            budget_ms: 50
        }
        .is_transient());
        assert!(!PipelineError::UnknownBackendType("x".into()).is_transient());
    }
}
