//! Boundary error kinds for the pairing pipeline.
//!
//! Every error that can cross the HTTP surface is one of these variants;
//! the gateway maps them to status codes and nothing else interprets them.

use crate::domain::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("session not found: {0}")]
    SessionNotFound(uuid::Uuid),

    #[error("session is not active")]
    SessionNotActive,

    #[error("cooldown active: {remaining_seconds}s remaining")]
    CooldownActive { remaining_seconds: u32 },

    #[error("invalid escalation: {reason}")]
    InvalidEscalation { reason: String },

    #[error("exercise not found: {0}")]
    ExerciseNotFound(String),

    #[error("spec not found: {0}")]
    SpecNotFound(String),

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("execution timed out after {0}s")]
    ExecutionTimeout(u32),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PairingError {
    /// HTTP status code this kind maps to at the boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SessionNotFound(_) | Self::ExerciseNotFound(_) | Self::SpecNotFound(_) => 404,
            Self::SessionNotActive | Self::InvalidEscalation { .. } | Self::InvalidRequest(_) => {
                400
            }
            Self::CooldownActive { .. } => 429,
            Self::SandboxUnavailable(_) => 503,
            Self::ExecutionTimeout(_) => 504,
            Self::ProviderUnavailable(_) => 502,
            Self::UpstreamTimeout => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable kind used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionNotActive => "session_not_active",
            Self::CooldownActive { .. } => "cooldown_active",
            Self::InvalidEscalation { .. } => "invalid_escalation",
            Self::ExerciseNotFound(_) => "exercise_not_found",
            Self::SpecNotFound(_) => "spec_not_found",
            Self::SandboxUnavailable(_) => "sandbox_unavailable",
            Self::ExecutionTimeout(_) => "execution_timeout",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<SessionError> for PairingError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotActive => Self::SessionNotActive,
            SessionError::CooldownActive { remaining_seconds } => {
                Self::CooldownActive { remaining_seconds }
            }
            SessionError::MissingExercise => {
                Self::InvalidRequest("training sessions require an exercise_id".into())
            }
            SessionError::MissingSpec => {
                Self::InvalidRequest("feature-guidance sessions require a spec_path".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_contract() {
        assert_eq!(PairingError::SessionNotFound(uuid::Uuid::nil()).status_code(), 404);
        assert_eq!(PairingError::SessionNotActive.status_code(), 400);
        assert_eq!(
            PairingError::CooldownActive {
                remaining_seconds: 3
            }
            .status_code(),
            429
        );
        assert_eq!(
            PairingError::InvalidEscalation {
                reason: "short".into()
            }
            .status_code(),
            400
        );
        assert_eq!(PairingError::SandboxUnavailable("x".into()).status_code(), 503);
        assert_eq!(PairingError::ExecutionTimeout(1).status_code(), 504);
        assert_eq!(
            PairingError::ProviderUnavailable("circuit open".into()).status_code(),
            502
        );
        assert_eq!(PairingError::UpstreamTimeout.status_code(), 504);
        assert_eq!(PairingError::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn session_errors_convert() {
        let e: PairingError = SessionError::CooldownActive {
            remaining_seconds: 42,
        }
        .into();
        assert_eq!(e.status_code(), 429);
        assert_eq!(e.kind(), "cooldown_active");
    }
}
