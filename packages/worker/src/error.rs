use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The server side of the round trip rejected a call.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Converter error: {0}")]
    Converter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
