use crate::job::{JobId, JobState};
use thiserror::Error;

/// A request field that failed validation. The job is never created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("capacity exceeded: {limit} jobs already queued")]
    CapacityExceeded { limit: usize },
}

/// Errors returned synchronously to whoever submitted or cancelled a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("capacity exceeded: {limit} jobs already queued")]
    CapacityExceeded { limit: usize },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("supervisor is not running")]
    Unavailable,
}

impl From<RegistryError> for SubmitError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => SubmitError::NotFound(id),
            RegistryError::CapacityExceeded { limit } => SubmitError::CapacityExceeded { limit },
            // create/cancel paths never request a transition themselves
            RegistryError::InvalidTransition { .. } => SubmitError::Unavailable,
        }
    }
}
