use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use common::converter::{Artifact, ArtifactSource};
use common::storage::{BlobInfo, BlobStore};
use common::{
    FileName, JobClaim, JobFilter, JobId, JobKeys, PipelineId, QueueConfig, QueuedJob,
};
use ledger::{JobLedger, LedgerError};
use tracing::{info, warn};
use worker::PipelineClient;

use crate::domain::{CommandContext, DescriptorError};
use crate::error::{Result, ServiceError};
use crate::service::DocumentService;

/// Job-facing half of the pipeline: claims, input download, format
/// registration and outcome reporting.
pub struct JobsService {
    ledger: Arc<dyn JobLedger>,
    blobs: Arc<dyn BlobStore>,
    documents: Arc<DocumentService>,
    queues: BTreeMap<String, QueueConfig>,
}

impl JobsService {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        blobs: Arc<dyn BlobStore>,
        documents: Arc<DocumentService>,
        queues: &[QueueConfig],
    ) -> Self {
        Self {
            ledger,
            blobs,
            documents,
            queues: queues.iter().map(|q| (q.name.clone(), q.clone())).collect(),
        }
    }

    fn queue(&self, name: &str) -> Result<&QueueConfig> {
        self.queues
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(format!("Queue {name} not found")))
    }

    pub async fn claim_job(&self, queue: &str, identity: &str) -> Result<Option<QueuedJob>> {
        self.queue(queue)?;
        let job = self.ledger.claim_next(queue, identity).await?;
        if let Some(job) = &job {
            info!(
                queue,
                job_id = %job.id,
                identity,
                extension = job.file_extension(),
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Input blob of a job, looked up by queue and id. Works for jobs whose
    /// input is some stage's raw output with no handle bound to it yet.
    pub async fn job_input(&self, queue: &str, job_id: &JobId) -> Result<BlobInfo> {
        let job = self.get_job(queue, job_id).await?;
        let blob = job.blob_id().ok_or_else(|| {
            ServiceError::Validation(format!("Job {job_id} has no {}", JobKeys::BLOB_ID))
        })?;
        Ok(self.blobs.info(&blob).await?)
    }

    /// Store a produced artifact and register it on the job's descriptor.
    pub async fn register_artifact(
        &self,
        job: &QueuedJob,
        identity: &str,
        artifact: &Artifact,
    ) -> Result<()> {
        let descriptor = job.descriptor_id().ok_or_else(|| {
            ServiceError::Validation(format!("Job {} has no {}", job.id, JobKeys::DESCRIPTOR_ID))
        })?;

        let blob = match &artifact.source {
            ArtifactSource::File(path) => self.blobs.upload_file(&artifact.format, path).await?,
            ArtifactSource::Payload(value) => {
                let data = serde_json::to_vec(value)
                    .map_err(|e| ServiceError::Internal(format!("Invalid payload: {e}")))?;
                let file_name = FileName::new(format!("{}.json", artifact.format));
                self.blobs.put(&artifact.format, &file_name, &data).await?
            }
        };

        let ctx = CommandContext::default()
            .with_actor(identity)
            .with_correlation_id(job.id.as_str());
        let result = self
            .documents
            .add_format(
                &descriptor,
                artifact.format.clone(),
                &blob,
                PipelineId::new(job.queue.as_str()),
                &ctx,
            )
            .await;

        match result {
            // The document went away while the job ran; nothing to attach to.
            Err(ServiceError::Descriptor(DescriptorError::AlreadyDeleted)) => {
                warn!(job_id = %job.id, descriptor_id = %descriptor, format = %artifact.format, "Descriptor deleted, artifact dropped");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn complete_job(&self, queue: &str, claim: &JobClaim) -> Result<QueuedJob> {
        let job = self.ledger.complete(queue, claim).await?;
        info!(queue, job_id = %job.id, identity = %claim.identity, "Job completed");
        Ok(job)
    }

    pub async fn fail_job(
        &self,
        queue: &str,
        claim: &JobClaim,
        message: &str,
    ) -> Result<QueuedJob> {
        let max_failures = self.queue(queue)?.max_failures;
        let job = self.ledger.fail(queue, claim, message, max_failures).await?;
        if job.finished {
            warn!(
                queue,
                job_id = %job.id,
                errors = job.error_count,
                error = message,
                "Job abandoned"
            );
        } else {
            info!(
                queue,
                job_id = %job.id,
                errors = job.error_count,
                max_failures,
                error = message,
                "Job failed, will be retried"
            );
        }
        Ok(job)
    }

    pub async fn list_jobs(&self, queue: &str, filter: &JobFilter) -> Result<Vec<QueuedJob>> {
        self.queue(queue)?;
        Ok(self.ledger.list(queue, filter).await?)
    }

    pub async fn get_job(&self, queue: &str, job_id: &JobId) -> Result<QueuedJob> {
        self.ledger
            .get(queue, job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Job {job_id} not found in {queue}")))
    }
}

#[async_trait]
impl PipelineClient for JobsService {
    async fn claim(&self, queue: &str, identity: &str) -> worker::Result<Option<QueuedJob>> {
        Ok(self.claim_job(queue, identity).await?)
    }

    async fn download_input(&self, job: &QueuedJob, folder: &Path) -> worker::Result<PathBuf> {
        let input = self.job_input(&job.queue, &job.id).await?;
        let path = self
            .blobs
            .download(&input.id, folder)
            .await
            .map_err(ServiceError::from)?;
        Ok(path)
    }

    async fn add_format(
        &self,
        job: &QueuedJob,
        identity: &str,
        artifact: &Artifact,
    ) -> worker::Result<()> {
        Ok(self.register_artifact(job, identity, artifact).await?)
    }

    async fn complete(&self, job: &QueuedJob) -> worker::Result<()> {
        self.complete_job(&job.queue, &held_claim(job)?).await?;
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, message: &str) -> worker::Result<()> {
        self.fail_job(&job.queue, &held_claim(job)?, message).await?;
        Ok(())
    }
}

/// Claim carried by a job as the worker received it.
fn held_claim(job: &QueuedJob) -> Result<JobClaim> {
    job.claim()
        .ok_or_else(|| LedgerError::NotExecuting(job.id.clone()).into())
}
