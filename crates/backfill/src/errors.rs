//! Terminal error classes of the backfill pipeline.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReorgError {
    #[error("reorg job {0} is cancelled")]
    ReorgCancelled(i64),
    #[error("reorg job {0} timed out")]
    ReorgTimeout(i64),
    #[error("this instance is no longer the schema-change owner")]
    NotOwner,
    #[error("panic while backfilling")]
    ReorgPanic,
    #[error("cannot find region in range [{start}, {end}]")]
    InvalidSplitRegionRanges { start: String, end: String },
    #[error("backfill job {0} not found")]
    JobNotFound(i64),
}

/// The persisted job record has gone away: another owner finished the job,
/// so the local task outcome is treated as success.
pub fn is_job_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ReorgError>(),
        Some(ReorgError::JobNotFound(_))
    )
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ReorgError>(),
        Some(ReorgError::ReorgCancelled(_) | ReorgError::ReorgTimeout(_) | ReorgError::NotOwner)
    )
}
