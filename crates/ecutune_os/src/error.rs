#![forbid(unsafe_code)]

use ecutune_engines::contract::EngineError;
use ecutune_kernel_contracts::capability::EngineId;
use ecutune_kernel_contracts::flash::FlashJobId;
use ecutune_kernel_contracts::safety::ViolationSeverity;
use ecutune_kernel_contracts::session::{ApplyMode, ApplySessionId};
use ecutune_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use ecutune_storage::ecu_store::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Profile,
    Map,
    Changeset,
    Session,
    FlashJob,
}

impl NotFoundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotFoundKind::Profile => "profile",
            NotFoundKind::Map => "map",
            NotFoundKind::Changeset => "changeset",
            NotFoundKind::Session => "session",
            NotFoundKind::FlashJob => "flash job",
        }
    }
}

/// Transport-facing classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryClass {
    NotFound,
    BadRequest,
    Unauthorized,
    Unavailable,
}

impl BoundaryClass {
    pub fn http_status(self) -> u16 {
        match self {
            BoundaryClass::NotFound => 404,
            BoundaryClass::BadRequest => 400,
            BoundaryClass::Unauthorized => 401,
            BoundaryClass::Unavailable => 503,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("{} not found: {id}", kind.as_str())]
    NotFound { kind: NotFoundKind, id: String },

    #[error("engine not registered: {0}")]
    EngineNotFound(EngineId),

    #[error("engine {engine_id} does not support mode {}", mode.as_str())]
    ModeNotSupportedByEngine { engine_id: EngineId, mode: ApplyMode },

    #[error("not armed: {reason}")]
    NotArmed { reason: String },

    #[error("invalid apply token for session {session_id}")]
    InvalidToken { session_id: ApplySessionId },

    #[error("session {session_id} expired at {}", expired_at.0)]
    SessionExpired {
        session_id: ApplySessionId,
        expired_at: MonotonicTimeNs,
    },

    #[error("concurrent session limit reached: {current} >= {max}")]
    ConcurrencyLimitExceeded { current: usize, max: usize },

    #[error("value {value} outside [{min}, {max}]")]
    OutOfBounds { value: f64, min: f64, max: f64 },

    #[error("safety violation ({})", severity.as_str())]
    SafetyViolation { severity: ViolationSeverity },

    #[error("write to session {session_id} could not be verified by readback")]
    VerificationFailed { session_id: ApplySessionId },

    #[error("flash job {job_id} checksum mismatch")]
    ChecksumMismatch { job_id: FlashJobId },

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("attribution required: a technician id must accompany writes outside development mode")]
    AttributionRequired,

    #[error("write rejected by operator context: {reason}")]
    WriteRejected { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("telemetry unavailable: {reason}")]
    Telemetry { reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::OutOfBounds { value, min, max } => {
                OrchestratorError::OutOfBounds { value, min, max }
            }
            other => OrchestratorError::Storage(other),
        }
    }
}

impl OrchestratorError {
    pub fn not_found(kind: NotFoundKind, id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        OrchestratorError::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn boundary_class(&self) -> BoundaryClass {
        match self {
            OrchestratorError::NotFound { .. } | OrchestratorError::EngineNotFound(_) => {
                BoundaryClass::NotFound
            }
            OrchestratorError::InvalidToken { .. }
            | OrchestratorError::NotArmed { .. }
            | OrchestratorError::AttributionRequired
            | OrchestratorError::WriteRejected { .. } => BoundaryClass::Unauthorized,
            OrchestratorError::Engine(EngineError::MapNotFound(_))
            | OrchestratorError::Engine(EngineError::ChangesetNotFound(_))
            | OrchestratorError::Storage(StorageError::NotFound { .. }) => BoundaryClass::NotFound,
            OrchestratorError::Engine(_)
            | OrchestratorError::Telemetry { .. }
            | OrchestratorError::ConcurrencyLimitExceeded { .. } => BoundaryClass::Unavailable,
            OrchestratorError::ModeNotSupportedByEngine { .. }
            | OrchestratorError::SessionExpired { .. }
            | OrchestratorError::OutOfBounds { .. }
            | OrchestratorError::SafetyViolation { .. }
            | OrchestratorError::VerificationFailed { .. }
            | OrchestratorError::ChecksumMismatch { .. }
            | OrchestratorError::ValidationFailed { .. }
            | OrchestratorError::InvalidState { .. }
            | OrchestratorError::Storage(_)
            | OrchestratorError::Contract(_) => BoundaryClass::BadRequest,
        }
    }
}
