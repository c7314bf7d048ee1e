use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{JobFilter, JobStatus, QueueConfig, QueuedJob};
use ledger::{JobLedger, LedgerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const STALE_JOB_ERROR: &str = "execution timed out";

/// Fail executing jobs whose worker has not reported back within
/// `stale_after`. The failure counts toward the queue's threshold, so a job
/// that keeps hanging is eventually abandoned.
///
/// Failures are reported against the claim seen in the listing; a job that
/// changed hands in the meantime is left to its new holder.
pub async fn sweep_stale_jobs(
    ledger: &dyn JobLedger,
    queues: &[QueueConfig],
    stale_after: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<usize, LedgerError> {
    let Some(threshold) = now.checked_sub_signed(stale_after) else {
        return Ok(0);
    };
    let mut swept = 0;

    for queue in queues {
        let executing = ledger
            .list(&queue.name, &JobFilter::with_status(JobStatus::Executing))
            .await?;
        let stale = executing
            .iter()
            .filter(|job| job.execution_start.is_some_and(|start| start < threshold))
            .filter_map(QueuedJob::claim);

        for claim in stale {
            match ledger
                .fail(&queue.name, &claim, STALE_JOB_ERROR, queue.max_failures)
                .await
            {
                Ok(job) => {
                    warn!(
                        queue = %queue.name,
                        job_id = %job.id,
                        identity = %claim.identity,
                        errors = job.error_count,
                        abandoned = job.finished,
                        "Stale job failed"
                    );
                    swept += 1;
                }
                // The worker reported, or the job was claimed again, while
                // we were looking.
                Err(LedgerError::NotExecuting(id)) => {
                    debug!(queue = %queue.name, job_id = %id, "Job changed hands before sweep");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(swept)
}

/// Run the stale job sweeper until cancelled.
pub async fn run_sweeper(
    ledger: Arc<dyn JobLedger>,
    queues: Vec<QueueConfig>,
    stale_after: Duration,
    scan_interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        stale_after_secs = stale_after.as_secs(),
        scan_interval_secs = scan_interval.as_secs(),
        "Starting stale job sweeper"
    );

    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    let mut interval = tokio::time::interval(scan_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match sweep_stale_jobs(ledger.as_ref(), &queues, stale_after, Utc::now()).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Swept stale jobs"),
            Err(e) => error!(error = %e, "Stale job sweep failed"),
        }
    }

    info!("Stale job sweeper stopped");
}
