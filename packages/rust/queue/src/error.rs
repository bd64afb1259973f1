//! Queue error types.

use contactforge_shared::{ContactForgeError, JobId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached or rejected a statement.
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("job {0} is not in the queue")]
    NotFound(JobId),

    /// The delivery was superseded (lease expired and the job was redelivered).
    #[error("stale receipt for job {0}")]
    StaleReceipt(JobId),

    #[error("job {0} is already queued")]
    AlreadyQueued(JobId),

    #[error("job {job_id} is {state}")]
    InvalidState { job_id: JobId, state: &'static str },

    #[error("job {job_id} exhausted {attempts}/{max_attempts} attempts")]
    Exhausted {
        job_id: JobId,
        attempts: u32,
        max_attempts: u32,
    },
}

impl From<libsql::Error> for QueueError {
    fn from(e: libsql::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<QueueError> for ContactForgeError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(_) => ContactForgeError::NotFound(e.to_string()),
            QueueError::AlreadyQueued(_)
            | QueueError::InvalidState { .. }
            | QueueError::Exhausted { .. } => ContactForgeError::Conflict(e.to_string()),
            QueueError::Backend(_) | QueueError::StaleReceipt(_) => {
                ContactForgeError::Queue(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_into_shared_error() {
        let id = JobId::new();
        let err: ContactForgeError = QueueError::NotFound(id.clone()).into();
        assert!(matches!(err, ContactForgeError::NotFound(_)));
        assert!(!err.is_retryable());

        let err: ContactForgeError = QueueError::Backend("connection reset".into()).into();
        assert!(matches!(err, ContactForgeError::Queue(_)));
        assert!(err.is_retryable());

        let err: ContactForgeError = QueueError::Exhausted {
            job_id: id,
            attempts: 3,
            max_attempts: 3,
        }
        .into();
        assert!(err.to_string().contains("3/3"));
    }
}
