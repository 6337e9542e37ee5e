//! Engine error taxonomy
//!
//! Row- and batch-level failures never surface here: the controller turns them
//! into counters and error-log entries. `EngineError` covers what callers of the
//! job control surface can observe.

use thiserror::Error;
use uuid::Uuid;

use crate::types::JobStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Source unreadable, mapping set missing, destination unreachable at start
    #[error("setup failed: {0}")]
    Setup(String),

    /// The persisted cursor can no longer be honoured (e.g. upload deleted)
    #[error("cannot resume: {0}")]
    ResumeInconsistency(String),

    /// Mid-run failure that ends the job (source lost, destination down)
    #[error("job aborted: {0}")]
    Fatal(String),

    #[error("job {job_id} is {status}, cannot {action}")]
    InvalidTransition {
        job_id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Short machine-readable code used in NATS error replies
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Setup(_) => "SETUP_FAILED",
            EngineError::ResumeInconsistency(_) => "RESUME_FAILED",
            EngineError::Fatal(_) => "JOB_ABORTED",
            EngineError::InvalidTransition { .. } => "INVALID_STATE",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::AlreadyRunning(_) => "ALREADY_RUNNING",
            EngineError::InvalidRequest(_) => "INVALID_REQUEST",
            EngineError::Store(_) => "INTERNAL_ERROR",
        }
    }
}

/// Classification of a failed destination write
#[derive(Debug, Error)]
pub enum DestinationError {
    /// The destination answered and refused the batch
    #[error("destination rejected batch: {0}")]
    Rejected(String),

    /// The destination could not be reached or failed internally
    #[error("destination unavailable: {0}")]
    Unavailable(String),
}

impl DestinationError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DestinationError::Unavailable(_))
    }
}
