use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::QueuedJob;
use common::converter::Artifact;

use crate::error::Result;

/// Server half of the worker round trip.
///
/// Workers share no memory with each other; every step goes through this
/// seam, which fronts the job ledger, the blob store and the aggregates.
#[async_trait]
pub trait PipelineClient: Send + Sync {
    /// Atomically take the next job of `queue`, or `None` when idle.
    async fn claim(&self, queue: &str, identity: &str) -> Result<Option<QueuedJob>>;

    /// Write the job's input blob into `folder` and return its path.
    async fn download_input(&self, job: &QueuedJob, folder: &Path) -> Result<PathBuf>;

    /// Store an artifact and register it as a format of the job's document,
    /// correlated with the job id.
    async fn add_format(&self, job: &QueuedJob, identity: &str, artifact: &Artifact)
    -> Result<()>;

    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    async fn fail(&self, job: &QueuedJob, message: &str) -> Result<()>;
}
