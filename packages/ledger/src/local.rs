use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use common::{JobClaim, JobFilter, JobId, NewJob, QueuedJob};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::traits::{JobLedger, validate_queue};

/// Job ledger for a single host.
///
/// All queues sit behind one async mutex, which is what makes the claim
/// atomic. When opened on a directory, every mutation is appended to
/// `{dir}/{queue}.jsonl` and synced before the in-memory state changes;
/// the journal is replayed and compacted the first time a queue is used.
pub struct LocalLedger {
    dir: Option<PathBuf>,
    queues: Mutex<HashMap<String, QueueState>>,
}

#[derive(Default)]
struct QueueState {
    /// Keyed by sequence, so iteration is claim order.
    jobs: BTreeMap<u64, QueuedJob>,
    index: HashMap<JobId, u64>,
    next_sequence: u64,
    journal: Option<fs::File>,
}

impl QueueState {
    fn find(&self, job_id: &JobId) -> Option<&QueuedJob> {
        self.index.get(job_id).and_then(|seq| self.jobs.get(seq))
    }

    fn insert(&mut self, job: QueuedJob) {
        self.next_sequence = self.next_sequence.max(job.sequence + 1);
        if let Some(old) = self.index.insert(job.id.clone(), job.sequence) {
            if old != job.sequence {
                self.jobs.remove(&old);
            }
        }
        self.jobs.insert(job.sequence, job);
    }

    /// Make `job` durable, then visible.
    async fn commit(&mut self, job: QueuedJob) -> Result<QueuedJob> {
        if let Some(journal) = self.journal.as_mut() {
            let mut line = serde_json::to_vec(&job)?;
            line.push(b'\n');
            journal.write_all(&line).await?;
            journal.sync_data().await?;
        }
        self.insert(job.clone());
        Ok(job)
    }
}

impl LocalLedger {
    /// A ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// A ledger journaled under `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir: Some(dir),
            queues: Mutex::new(HashMap::new()),
        })
    }

    async fn load_queue(&self, queue: &str) -> Result<QueueState> {
        let mut state = QueueState {
            next_sequence: 1,
            ..Default::default()
        };
        let Some(dir) = &self.dir else {
            return Ok(state);
        };

        let path = dir.join(format!("{queue}.jsonl"));
        let mut records = 0usize;
        let mut torn = 0usize;
        if fs::try_exists(&path).await? {
            let file = fs::File::open(&path).await?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueuedJob>(&line) {
                    Ok(job) => {
                        records += 1;
                        state.insert(job);
                    }
                    // A crash mid-append leaves a torn last line.
                    Err(e) => {
                        torn += 1;
                        warn!(queue, error = %e, "Skipping unreadable ledger record");
                    }
                }
            }
        }

        if records > state.jobs.len() || torn > 0 {
            compact(&path, dir, &state).await?;
            info!(
                queue,
                records,
                jobs = state.jobs.len(),
                "Compacted ledger journal"
            );
        }

        state.journal = Some(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?,
        );
        Ok(state)
    }

    /// State of `queue`, replayed from the journal on first use.
    async fn state<'a>(
        &self,
        queues: &'a mut HashMap<String, QueueState>,
        queue: &str,
    ) -> Result<&'a mut QueueState> {
        validate_queue(queue)?;
        Ok(match queues.entry(queue.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.load_queue(queue).await?),
        })
    }
}

async fn compact(path: &Path, dir: &Path, state: &QueueState) -> Result<()> {
    let temp_path = dir.join(format!(
        ".{}.compact",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("queue")
    ));
    let mut body = Vec::new();
    for job in state.jobs.values() {
        body.extend(serde_json::to_vec(job)?);
        body.push(b'\n');
    }
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl JobLedger for LocalLedger {
    async fn upsert(&self, job: NewJob) -> Result<bool> {
        let mut queues = self.queues.lock().await;
        let state = self.state(&mut queues, &job.queue).await?;
        if state.index.contains_key(&job.id) {
            return Ok(false);
        }

        let job = QueuedJob::from_new(job, state.next_sequence);
        debug!(queue = %job.queue, job_id = %job.id, sequence = job.sequence, "Queued job");
        state.commit(job).await?;
        Ok(true)
    }

    async fn claim_next(&self, queue: &str, identity: &str) -> Result<Option<QueuedJob>> {
        let mut queues = self.queues.lock().await;
        let state = self.state(&mut queues, queue).await?;
        let Some(mut job) = state.jobs.values().find(|j| j.is_claimable()).cloned() else {
            return Ok(None);
        };

        job.mark_claimed(identity, Utc::now());
        state.commit(job).await.map(Some)
    }

    async fn complete(&self, queue: &str, claim: &JobClaim) -> Result<QueuedJob> {
        let mut queues = self.queues.lock().await;
        let state = self.state(&mut queues, queue).await?;
        let mut job = claimed_job(state, queue, claim)?;
        job.mark_completed(Utc::now());
        state.commit(job).await
    }

    async fn fail(
        &self,
        queue: &str,
        claim: &JobClaim,
        message: &str,
        max_failures: u32,
    ) -> Result<QueuedJob> {
        let mut queues = self.queues.lock().await;
        let state = self.state(&mut queues, queue).await?;
        let mut job = claimed_job(state, queue, claim)?;
        job.mark_failed(message, max_failures, Utc::now());
        state.commit(job).await
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> Result<Option<QueuedJob>> {
        let mut queues = self.queues.lock().await;
        let state = self.state(&mut queues, queue).await?;
        Ok(state.find(job_id).cloned())
    }

    async fn list(&self, queue: &str, filter: &JobFilter) -> Result<Vec<QueuedJob>> {
        let mut queues = self.queues.lock().await;
        let state = self.state(&mut queues, queue).await?;
        Ok(state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

fn claimed_job(state: &QueueState, queue: &str, claim: &JobClaim) -> Result<QueuedJob> {
    let job = state
        .find(&claim.job_id)
        .ok_or_else(|| LedgerError::NotFound {
            queue: queue.to_string(),
            job_id: claim.job_id.clone(),
        })?;
    if !job.is_held_by(claim) {
        return Err(LedgerError::NotExecuting(claim.job_id.clone()));
    }
    Ok(job.clone())
}
