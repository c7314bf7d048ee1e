use common::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Job {job_id} not found in queue {queue}")]
    NotFound { queue: String, job_id: JobId },

    /// Outcome reported for a claim that no longer holds the job (already
    /// completed, or requeued by the sweeper and possibly claimed again).
    #[error("Job {0} is not executing")]
    NotExecuting(JobId),

    #[error("Invalid queue name: {0}")]
    InvalidQueue(String),

    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(feature = "postgres")]
impl From<sea_orm::DbErr> for LedgerError {
    fn from(e: sea_orm::DbErr) -> Self {
        LedgerError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
