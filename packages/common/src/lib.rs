pub mod config;
pub mod converter;
pub mod job;
pub mod model;
pub mod retry;
pub mod storage;

pub use config::{QueueConfig, StorageConfig};
pub use job::{JobClaim, JobFilter, JobId, JobKeys, JobStatus, NewJob, QueuedJob};
pub use model::{BlobId, DescriptorId, FileName, Format, HandleId, PipelineId, TenantId};
