pub mod client;
pub mod config;
pub mod converter;
pub mod error;
pub mod poller;

pub use client::PipelineClient;
pub use config::{CommandConverterConfig, WorkerConfig};
pub use converter::CommandConverter;
pub use error::{Result, WorkerError};
pub use poller::{JobOutcome, Poller, PollerState};
