use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use common::{JobId, JobKeys, NewJob, QueueConfig, TenantId};
use fancy_regex::Regex;
use ledger::{JobLedger, LedgerError};
use thiserror::Error;
use tracing::{info, warn};

use crate::projections::StreamRow;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid pipeline pattern for queue {queue}: {source}")]
    InvalidPattern {
        queue: String,
        #[source]
        source: Box<fancy_regex::Error>,
    },

    #[error("Queue {0} is defined twice")]
    DuplicateQueue(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

struct CompiledQueue {
    config: QueueConfig,
    pipeline: Option<Regex>,
    extensions: Vec<String>,
}

impl CompiledQueue {
    fn compile(config: &QueueConfig) -> Result<Self, RouterError> {
        let pipeline = config
            .pipeline
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| RouterError::InvalidPattern {
                queue: config.name.clone(),
                source: Box::new(e),
            })?;
        let extensions = config
            .extensions
            .as_deref()
            .unwrap_or_default()
            .split('|')
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        Ok(Self {
            config: config.clone(),
            pipeline,
            extensions,
        })
    }

    fn admits(&self, row: &StreamRow) -> bool {
        if !self.extensions.is_empty()
            && !self
                .extensions
                .iter()
                .any(|ext| ext.eq_ignore_ascii_case(&row.file_extension))
        {
            return false;
        }
        match &self.pipeline {
            None => true,
            Some(pattern) => match pattern.is_match(row.pipeline.as_str()) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(queue = %self.config.name, pipeline = %row.pipeline, error = %e, "Pipeline pattern evaluation failed");
                    false
                }
            },
        }
    }
}

/// Decides which queues a stream row enters and records the jobs.
pub struct QueueRouter {
    queues: Vec<CompiledQueue>,
    tenant: TenantId,
    ledger: Arc<dyn JobLedger>,
}

impl QueueRouter {
    pub fn new(
        queues: &[QueueConfig],
        tenant: TenantId,
        ledger: Arc<dyn JobLedger>,
    ) -> Result<Self, RouterError> {
        let mut names = HashSet::new();
        let mut compiled = Vec::with_capacity(queues.len());
        for queue in queues {
            if !names.insert(queue.name.as_str()) {
                return Err(RouterError::DuplicateQueue(queue.name.clone()));
            }
            compiled.push(CompiledQueue::compile(queue)?);
        }
        Ok(Self {
            queues: compiled,
            tenant,
            ledger,
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues
            .iter()
            .map(|q| &q.config)
            .find(|q| q.name == name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueConfig> {
        self.queues.iter().map(|q| &q.config)
    }

    /// Names of the queues admitting `row`.
    pub fn matching_queues(&self, row: &StreamRow) -> Vec<&str> {
        self.queues
            .iter()
            .filter(|q| q.admits(row))
            .map(|q| q.config.name.as_str())
            .collect()
    }

    fn job_for(&self, queue: &CompiledQueue, row: &StreamRow) -> NewJob {
        let mut parameters: BTreeMap<String, String> = queue.config.parameters.clone();
        for (key, value) in [
            (JobKeys::FILE_EXTENSION, row.file_extension.clone()),
            (JobKeys::DESCRIPTOR_ID, row.descriptor_id.to_string()),
            (JobKeys::FORMAT, row.format.to_string()),
            (JobKeys::BLOB_ID, row.blob_id.to_string()),
            (JobKeys::TENANT_ID, self.tenant.to_string()),
            (JobKeys::PIPELINE_ID, row.pipeline.to_string()),
        ] {
            parameters.insert(key.to_string(), value);
        }

        NewJob {
            id: JobId::for_row(row.id, &self.tenant),
            queue: queue.config.name.clone(),
            stream_row_id: row.id,
            tenant: self.tenant.clone(),
            parameters,
        }
    }

    /// Enqueue `row` into every admitting queue. Routing a row again is
    /// harmless: the deterministic job id makes the insert a no-op.
    ///
    /// Returns the ids of newly inserted jobs.
    pub async fn route(&self, row: &StreamRow) -> Result<Vec<(String, JobId)>, RouterError> {
        let mut inserted = Vec::new();
        for queue in self.queues.iter().filter(|q| q.admits(row)) {
            let job = self.job_for(queue, row);
            let id = job.id.clone();
            if self.ledger.upsert(job).await? {
                info!(
                    queue = %queue.config.name,
                    job_id = %id,
                    descriptor_id = %row.descriptor_id,
                    format = %row.format,
                    "Job routed"
                );
                inserted.push((queue.config.name.clone(), id));
            }
        }
        Ok(inserted)
    }
}
