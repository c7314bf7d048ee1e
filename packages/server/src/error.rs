use common::storage::StorageError;
use ledger::LedgerError;
use thiserror::Error;

use crate::domain::{DescriptorError, HandleError};
use crate::eventlog::EventLogError;
use crate::pipeline::RouterError;
use crate::repository::ExecuteError;

/// Error surfaced by the document and jobs services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Descriptor rejected command: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Handle rejected command: {0}")]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Machine-readable code: `VALIDATION_ERROR`, `NOT_FOUND`, `CONFLICT`
    /// or `INTERNAL_ERROR`.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_)
            | ServiceError::Descriptor(_)
            | ServiceError::Handle(_)
            | ServiceError::Ledger(LedgerError::InvalidQueue(_))
            | ServiceError::Storage(StorageError::InvalidBlobId(_))
            | ServiceError::Storage(StorageError::SizeLimitExceeded { .. }) => "VALIDATION_ERROR",
            ServiceError::NotFound(_)
            | ServiceError::Storage(StorageError::NotFound(_))
            | ServiceError::Ledger(LedgerError::NotFound { .. }) => "NOT_FOUND",
            ServiceError::Conflict(_) | ServiceError::Ledger(LedgerError::NotExecuting(_)) => {
                "CONFLICT"
            }
            _ => "INTERNAL_ERROR",
        }
    }
}

impl<E> From<ExecuteError<E>> for ServiceError
where
    E: std::error::Error + Send + Sync + 'static,
    ServiceError: From<E>,
{
    fn from(err: ExecuteError<E>) -> Self {
        match err {
            ExecuteError::Domain(e) => e.into(),
            ExecuteError::Conflict { stream, attempts } => ServiceError::Conflict(format!(
                "{stream} is being modified concurrently ({attempts} attempts)"
            )),
            ExecuteError::EventLog(e) => e.into(),
        }
    }
}

impl From<ServiceError> for worker::WorkerError {
    fn from(err: ServiceError) -> Self {
        worker::WorkerError::Pipeline(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
