//! Worker side of the round trip: claim, download, transform, upload,
//! report.

use std::path::Path;
use std::sync::Arc;

use common::converter::{ConvertOutcome, ConvertRequest, Converter};
use common::retry::calculate_backoff;
use common::{JobId, QueuedJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::PipelineClient;
use crate::config::WorkerConfig;
use crate::converter::CommandConverter;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Downloading,
    Transforming,
    Uploading,
    Reporting,
}

/// How a claimed job ended, as reported to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Artifacts registered, job completed.
    Converted { artifacts: usize },
    /// No converter for the input, or the converter declined. Completed
    /// without output.
    Skipped,
    /// Reported as a failure with this message.
    Failed(String),
}

pub struct Poller {
    config: WorkerConfig,
    client: Arc<dyn PipelineClient>,
    converters: Vec<Arc<dyn Converter>>,
    state: PollerState,
}

impl Poller {
    pub fn new(config: WorkerConfig, client: Arc<dyn PipelineClient>) -> Self {
        Self {
            config,
            client,
            converters: Vec::new(),
            state: PollerState::Idle,
        }
    }

    /// Poller with the external converters its configuration declares.
    pub fn from_config(config: WorkerConfig, client: Arc<dyn PipelineClient>) -> Self {
        let converters: Vec<Arc<dyn Converter>> = config
            .converters
            .iter()
            .cloned()
            .map(|c| Arc::new(CommandConverter::new(c)) as Arc<dyn Converter>)
            .collect();
        let mut poller = Self::new(config, client);
        poller.converters = converters;
        poller
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converters.push(converter);
        self
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    fn transition(&mut self, next: PollerState) {
        debug!(identity = %self.config.identity, from = ?self.state, to = ?next, "Poller state");
        self.state = next;
    }

    /// Poll until cancelled, backing off while the queue is empty.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(identity = %self.config.identity, queue = %self.config.queue, "Worker started");
        let mut idle_polls: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.poll_once().await {
                Ok(Some(_)) => {
                    idle_polls = 0;
                    continue;
                }
                Ok(None) => idle_polls = idle_polls.saturating_add(1),
                Err(e) => {
                    warn!(identity = %self.config.identity, error = %e, "Poll cycle failed");
                    idle_polls = idle_polls.saturating_add(1);
                }
            }

            let delay = calculate_backoff(
                idle_polls,
                self.config.poll_interval_ms,
                self.config.max_idle_backoff_ms,
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(identity = %self.config.identity, "Worker stopped");
    }

    /// One poll: claim a job and take it through the round trip.
    ///
    /// Returns `None` when no job was available. An `Err` means the outcome
    /// could not be reported; the job then stays executing until swept.
    pub async fn poll_once(&mut self) -> Result<Option<(JobId, JobOutcome)>> {
        self.transition(PollerState::Polling);
        let claimed = self
            .client
            .claim(&self.config.queue, &self.config.identity)
            .await;
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.transition(PollerState::Idle);
                return Ok(None);
            }
            Err(e) => {
                self.transition(PollerState::Idle);
                return Err(e);
            }
        };

        let result = self.process(&job).await;
        self.transition(PollerState::Idle);
        result.map(|outcome| Some((job.id.clone(), outcome)))
    }

    #[instrument(skip_all, fields(job_id = %job.id, queue = %job.queue))]
    async fn process(&mut self, job: &QueuedJob) -> Result<JobOutcome> {
        let extension = job.file_extension().to_string();
        let Some(converter) = self
            .converters
            .iter()
            .find(|c| c.can_convert(&extension))
            .cloned()
        else {
            info!(extension = %extension, "No converter for input, completing");
            self.transition(PollerState::Reporting);
            self.client.complete(job).await?;
            return Ok(JobOutcome::Skipped);
        };

        let scratch = self
            .config
            .working_dir
            .join(&self.config.identity)
            .join(format!("{}-{}", job.id, uuid::Uuid::new_v4().simple()));
        let outcome = self.round_trip(job, converter.as_ref(), &scratch).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %scratch.display(), error = %e, "Failed to clean scratch directory");
        }

        self.transition(PollerState::Reporting);
        match outcome {
            Ok(Some(artifacts)) => {
                self.client.complete(job).await?;
                info!(converter = converter.name(), artifacts, "Job completed");
                Ok(JobOutcome::Converted { artifacts })
            }
            Ok(None) => {
                self.client.complete(job).await?;
                info!(converter = converter.name(), "Converter declined input, completing");
                Ok(JobOutcome::Skipped)
            }
            Err(message) => {
                self.client.fail(job, &message).await?;
                error!(converter = converter.name(), error = %message, "Job failed");
                Ok(JobOutcome::Failed(message))
            }
        }
    }

    /// Download, transform, upload. `Ok(None)` when the converter declines;
    /// `Err` carries the failure message for the ledger.
    async fn round_trip(
        &mut self,
        job: &QueuedJob,
        converter: &dyn Converter,
        scratch: &Path,
    ) -> std::result::Result<Option<usize>, String> {
        self.transition(PollerState::Downloading);
        let input_dir = scratch.join("input");
        let output_dir = scratch.join("output");
        for dir in [&input_dir, &output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| format!("cannot create scratch directory: {e}"))?;
        }
        let input = self
            .client
            .download_input(job, &input_dir)
            .await
            .map_err(|e| format!("download failed: {e}"))?;

        self.transition(PollerState::Transforming);
        let request = ConvertRequest {
            input,
            extension: job.file_extension().to_string(),
            output_dir,
            parameters: job.parameters.clone(),
        };
        let artifacts = match converter.convert(&request).await {
            Ok(ConvertOutcome::Converted(artifacts)) => artifacts,
            Ok(ConvertOutcome::Unsupported) => return Ok(None),
            Err(e) => return Err(format!("{} failed: {e:#}", converter.name())),
        };

        self.transition(PollerState::Uploading);
        for artifact in &artifacts {
            self.client
                .add_format(job, &self.config.identity, artifact)
                .await
                .map_err(|e| format!("upload of {} failed: {e}", artifact.format))?;
        }
        Ok(Some(artifacts.len()))
    }
}
