use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Another worker holds a claim that is still inside the grace period.
    #[error("job is already accepted: {0}")]
    AlreadyAccepted(Uuid),

    /// The version check on accept matched zero rows.
    #[error("job {0} was modified concurrently")]
    ConcurrencyConflict(Uuid),

    /// COMPLETE or FAILED; a stale copy was handed out twice.
    #[error("job is already finished: {0}")]
    AlreadyFinished(Uuid),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl JobStoreError {
    /// Claim lost to another worker; pick a different job.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            JobStoreError::AlreadyAccepted(_)
                | JobStoreError::ConcurrencyConflict(_)
                | JobStoreError::AlreadyFinished(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JobStoreError::NotFound(_))
    }
}
