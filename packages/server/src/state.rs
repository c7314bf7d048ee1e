use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use common::storage::BlobStore;
use common::storage::filesystem::FilesystemBlobStore;
use common::{QueueConfig, TenantId};
use ledger::{JobLedger, LocalLedger};
use tokio::sync::Mutex;

use crate::config::{AppConfig, LedgerBackend, PipelineConfig};
use crate::eventlog::{EventLog, LocalEventLog};
use crate::pipeline::{JobsService, QueueRouter};
use crate::projections::{DocumentCatalog, ProjectionRunner, RecycleBin, StreamProjection};
use crate::repository::Repository;
use crate::service::DocumentService;

#[derive(Clone)]
pub struct AppState {
    pub event_log: Arc<dyn EventLog>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn JobLedger>,
    pub documents: Arc<DocumentService>,
    pub router: Arc<QueueRouter>,
    pub jobs: Arc<JobsService>,
    pub stream: Arc<Mutex<ProjectionRunner<StreamProjection>>>,
}

impl AppState {
    /// Open the file-backed stores named by `config`.
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let event_log = LocalEventLog::open(&config.event_log.path)
            .await
            .context("Failed to open event log")?;
        let blobs = FilesystemBlobStore::new(config.storage.path.clone(), config.storage.max_blob_size)
            .await
            .context("Failed to open blob store")?;
        let ledger = open_ledger(config).await?;

        Self::from_parts(
            Arc::new(event_log),
            Arc::new(blobs),
            ledger,
            &config.pipeline,
            &config.queues,
            Some(&config.projections_dir()),
        )
        .await
    }

    /// Wire the services over existing stores. Without `projections_dir`
    /// every projection lives in memory and is rebuilt from the log.
    pub async fn from_parts(
        event_log: Arc<dyn EventLog>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<dyn JobLedger>,
        pipeline: &PipelineConfig,
        queues: &[QueueConfig],
        projections_dir: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let (catalog, recycle_bin, stream): (
            ProjectionRunner<DocumentCatalog>,
            ProjectionRunner<RecycleBin>,
            ProjectionRunner<StreamProjection>,
        ) = match projections_dir {
            Some(dir) => (
                ProjectionRunner::open(dir).await?,
                ProjectionRunner::open(dir).await?,
                ProjectionRunner::open(dir).await?,
            ),
            None => (
                ProjectionRunner::in_memory(),
                ProjectionRunner::in_memory(),
                ProjectionRunner::in_memory(),
            ),
        };

        let documents = Arc::new(DocumentService::new(
            Repository::new(event_log.clone()),
            blobs.clone(),
            catalog.with_batch_size(pipeline.batch_size),
            recycle_bin.with_batch_size(pipeline.batch_size),
        ));
        let router = QueueRouter::new(
            queues,
            TenantId::new(pipeline.tenant.as_str()),
            ledger.clone(),
        )
        .context("Invalid queue configuration")?;
        let jobs = Arc::new(JobsService::new(
            ledger.clone(),
            blobs.clone(),
            documents.clone(),
            queues,
        ));

        Ok(Self {
            event_log,
            blobs,
            ledger,
            documents,
            router: Arc::new(router),
            jobs,
            stream: Arc::new(Mutex::new(stream.with_batch_size(pipeline.batch_size))),
        })
    }
}

async fn open_ledger(config: &AppConfig) -> anyhow::Result<Arc<dyn JobLedger>> {
    match config.ledger.backend {
        LedgerBackend::Local => {
            let ledger = LocalLedger::open(&config.ledger.dir)
                .await
                .context("Failed to open job ledger")?;
            Ok(Arc::new(ledger))
        }
        #[cfg(feature = "postgres")]
        LedgerBackend::Postgres => {
            let url = config
                .ledger
                .url
                .as_deref()
                .context("ledger.url is required for the postgres backend")?;
            let ledger = ledger::PostgresLedger::connect(url)
                .await
                .context("Failed to connect to postgres ledger")?;
            Ok(Arc::new(ledger))
        }
        #[cfg(not(feature = "postgres"))]
        LedgerBackend::Postgres => {
            anyhow::bail!("the postgres ledger backend requires the `postgres` feature")
        }
    }
}
