//! Pipeline job records as stored in the job ledger.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BlobId, DescriptorId, Format, TenantId};
use crate::retry::RetryAttempt;

/// Well-known keys of the job parameter map.
pub struct JobKeys;

impl JobKeys {
    pub const FILE_EXTENSION: &'static str = "file_extension";
    pub const DESCRIPTOR_ID: &'static str = "descriptor_id";
    pub const FORMAT: &'static str = "format";
    pub const BLOB_ID: &'static str = "blob_id";
    pub const TENANT_ID: &'static str = "tenant_id";
    pub const PIPELINE_ID: &'static str = "pipeline_id";
}

/// Deterministic job identifier: `{stream_row_id}_{tenant}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Id of the job created for a stream row. Routing the same row twice
    /// yields the same id, which is what makes routing idempotent.
    pub fn for_row(stream_row_id: u64, tenant: &TenantId) -> Self {
        Self(format!("{stream_row_id}_{tenant}"))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job about to be inserted by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub queue: String,
    pub stream_row_id: u64,
    pub tenant: TenantId,
    pub parameters: BTreeMap<String, String>,
}

/// Who holds a job and since when. Outcome reports carry the claim they
/// belong to, so a worker whose claim was swept and handed to someone else
/// cannot finish or fail the newer execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClaim {
    pub job_id: JobId,
    pub identity: String,
    pub started: DateTime<Utc>,
}

/// Persisted work item.
///
/// Only the ledger's claim/complete/fail operations mutate a job once it has
/// been inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue: String,
    pub stream_row_id: u64,
    pub tenant: TenantId,
    pub parameters: BTreeMap<String, String>,
    /// Insertion order within the queue; claims go oldest first.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub executing: bool,
    pub executing_identity: Option<String>,
    pub execution_start: Option<DateTime<Utc>>,
    pub execution_end: Option<DateTime<Utc>>,
    pub finished: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub history: Vec<RetryAttempt>,
}

impl QueuedJob {
    pub fn from_new(job: NewJob, sequence: u64) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            stream_row_id: job.stream_row_id,
            tenant: job.tenant,
            parameters: job.parameters,
            sequence,
            created_at: Utc::now(),
            executing: false,
            executing_identity: None,
            execution_start: None,
            execution_end: None,
            finished: false,
            error_count: 0,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn blob_id(&self) -> Option<BlobId> {
        self.param(JobKeys::BLOB_ID).map(BlobId::from)
    }

    pub fn descriptor_id(&self) -> Option<DescriptorId> {
        self.param(JobKeys::DESCRIPTOR_ID).map(DescriptorId::from)
    }

    pub fn format(&self) -> Option<Format> {
        self.param(JobKeys::FORMAT).map(Format::from)
    }

    pub fn file_extension(&self) -> &str {
        self.param(JobKeys::FILE_EXTENSION).unwrap_or_default()
    }

    /// Whether a claim may pick this job up.
    pub fn is_claimable(&self) -> bool {
        !self.finished && !self.executing
    }

    /// The claim currently held on this job, if it is executing.
    pub fn claim(&self) -> Option<JobClaim> {
        if !self.executing {
            return None;
        }
        Some(JobClaim {
            job_id: self.id.clone(),
            identity: self.executing_identity.clone()?,
            started: self.execution_start?,
        })
    }

    pub fn is_held_by(&self, claim: &JobClaim) -> bool {
        self.executing
            && self.id == claim.job_id
            && self.executing_identity.as_deref() == Some(claim.identity.as_str())
            && self.execution_start == Some(claim.started)
    }

    pub fn status(&self) -> JobStatus {
        match (self.finished, self.executing) {
            (true, _) if self.last_error.is_some() => JobStatus::Abandoned,
            (true, _) => JobStatus::Completed,
            (false, true) => JobStatus::Executing,
            (false, false) => JobStatus::Pending,
        }
    }

    /// Mark the job as taken by `identity`.
    pub fn mark_claimed(&mut self, identity: &str, now: DateTime<Utc>) {
        self.executing = true;
        self.executing_identity = Some(identity.to_string());
        self.execution_start = Some(now);
        self.last_error = None;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.executing = false;
        self.finished = true;
        self.execution_end = Some(now);
    }

    /// Record a failed attempt. The job is abandoned once the error count
    /// reaches `max_failures`; otherwise it becomes claimable again.
    pub fn mark_failed(&mut self, message: &str, max_failures: u32, now: DateTime<Utc>) {
        self.error_count += 1;
        self.last_error = Some(message.to_string());
        self.history.push(RetryAttempt::new(
            self.error_count,
            self.executing_identity.clone(),
            message,
            now,
        ));
        if self.error_count >= max_failures {
            self.finished = true;
        }
        self.executing = false;
        self.execution_end = Some(now);
    }
}

/// Lifecycle state derived from the job flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Executing,
    Completed,
    /// Failed as many times as the queue allows.
    Abandoned,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!(
                "Invalid job status '{}'. Must be one of: pending, executing, completed, abandoned",
                s
            )),
        }
    }
}

/// Listing filter for operator queries.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    pub fn matches(&self, job: &QueuedJob) -> bool {
        self.status.is_none_or(|status| job.status() == status)
    }
}
