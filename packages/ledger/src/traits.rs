use async_trait::async_trait;
use common::{JobClaim, JobFilter, JobId, NewJob, QueuedJob};

use crate::error::Result;

/// Durable store of pipeline jobs, partitioned by queue.
///
/// Jobs are only ever mutated through these operations. Implementations must
/// make [`claim_next`](JobLedger::claim_next) a single indivisible
/// read-modify-write: two callers can never receive the same job.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a job unless one with the same id already exists in its queue.
    ///
    /// Returns `true` when the job was inserted.
    async fn upsert(&self, job: NewJob) -> Result<bool>;

    /// Atomically take the oldest job that is neither finished nor executing.
    ///
    /// Returns `None` when there is no work available.
    async fn claim_next(&self, queue: &str, identity: &str) -> Result<Option<QueuedJob>>;

    /// Report success: the job stops executing and is retained as finished.
    ///
    /// Outcomes only apply while `claim` still holds the job; otherwise they
    /// fail with [`NotExecuting`](crate::LedgerError::NotExecuting).
    async fn complete(&self, queue: &str, claim: &JobClaim) -> Result<QueuedJob>;

    /// Report failure. The job is abandoned once its error count reaches
    /// `max_failures`, otherwise it becomes claimable again.
    async fn fail(
        &self,
        queue: &str,
        claim: &JobClaim,
        message: &str,
        max_failures: u32,
    ) -> Result<QueuedJob>;

    async fn get(&self, queue: &str, job_id: &JobId) -> Result<Option<QueuedJob>>;

    /// Jobs of a queue in claim order.
    async fn list(&self, queue: &str, filter: &JobFilter) -> Result<Vec<QueuedJob>>;
}

/// Queue names end up in file names and SQL parameters.
pub(crate) fn validate_queue(queue: &str) -> Result<()> {
    let valid = !queue.is_empty()
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(crate::LedgerError::InvalidQueue(queue.to_string()))
    }
}
