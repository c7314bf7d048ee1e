use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use worker::{PipelineClient, Poller};

use super::sweeper::run_sweeper;
use crate::config::AppConfig;
use crate::domain::CommandContext;
use crate::error::Result;
use crate::state::AppState;

const SYSTEM_ACTOR: &str = "pipeline";

/// Background side of the store: routes new stream rows into queues and
/// runs the maintenance loops and embedded workers.
pub struct PipelineHost {
    state: AppState,
    config: AppConfig,
}

impl PipelineHost {
    pub fn new(state: AppState, config: AppConfig) -> Self {
        Self { state, config }
    }

    /// Route every stream row produced since the last pass. Rows are
    /// acknowledged only once routed; a failing row is retried on the next
    /// pass together with everything after it.
    pub async fn route_pending(&self) -> Result<usize> {
        let mut stream = self.state.stream.lock().await;
        stream.catch_up(self.state.event_log.as_ref()).await?;

        let rows = stream.state().pending().to_vec();
        let mut routed = 0;
        let mut acknowledged = 0;
        let mut failure = None;
        for row in &rows {
            match self.state.router.route(row).await {
                Ok(jobs) => {
                    routed += jobs.len();
                    acknowledged += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if acknowledged > 0 {
            stream.state_mut().acknowledge(acknowledged);
            stream.save().await?;
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(routed),
        }
    }

    async fn run_router(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.pipeline.poll_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.route_pending().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Routed new jobs"),
                Err(e) => error!(error = %e, "Routing pass failed"),
            }
        }
    }

    async fn run_recycle_purge(&self, cancel: CancellationToken) {
        let retention = self.config.recycle_bin.retention();
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.recycle_bin.purge_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self
                .state
                .documents
                .purge_recycle_bin(Utc::now(), retention)
                .await
            {
                Ok(0) => {}
                Ok(count) => info!(count, "Purged blobs of deleted descriptors"),
                Err(e) => error!(error = %e, "Recycle bin purge failed"),
            }
        }
    }

    async fn run_dedup(&self, cancel: CancellationToken) {
        let ctx = CommandContext::default().with_actor(SYSTEM_ACTOR);
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.dedup.scan_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.state.documents.resolve_duplicates(&ctx).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Moved handles off duplicate descriptors"),
                Err(e) => error!(error = %e, "Duplicate resolution failed"),
            }
            if let Err(e) = self.state.documents.save_checkpoints().await {
                error!(error = %e, "Failed to save projection checkpoints");
            }
        }
    }

    /// Run every loop until `cancel` fires, then save the projections.
    pub async fn run(self, cancel: CancellationToken) {
        let host = Arc::new(self);
        let mut tasks = JoinSet::new();

        tasks.spawn({
            let host = host.clone();
            let cancel = cancel.clone();
            async move { host.run_router(cancel).await }
        });
        tasks.spawn(run_sweeper(
            host.state.ledger.clone(),
            host.config.queues.clone(),
            Duration::from_secs(host.config.sweeper.stale_after_secs),
            Duration::from_secs(host.config.sweeper.scan_interval_secs),
            cancel.clone(),
        ));
        tasks.spawn({
            let host = host.clone();
            let cancel = cancel.clone();
            async move { host.run_recycle_purge(cancel).await }
        });
        tasks.spawn({
            let host = host.clone();
            let cancel = cancel.clone();
            async move { host.run_dedup(cancel).await }
        });

        let client: Arc<dyn PipelineClient> = host.state.jobs.clone();
        for worker in &host.config.workers {
            info!(identity = %worker.identity, queue = %worker.queue, "Starting embedded worker");
            let poller = Poller::from_config(worker.clone(), client.clone());
            tasks.spawn(poller.run(cancel.child_token()));
        }

        info!(
            queues = host.config.queues.len(),
            workers = host.config.workers.len(),
            "Pipeline host started"
        );

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Pipeline task panicked");
            }
        }

        if let Err(e) = host.state.documents.save_checkpoints().await {
            error!(error = %e, "Failed to save projection checkpoints");
        }
        info!("Pipeline host stopped");
    }
}
