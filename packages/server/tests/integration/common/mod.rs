use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::converter::{Artifact, ConvertOutcome, ConvertRequest, Converter};
use common::storage::filesystem::FilesystemBlobStore;
use common::{HandleId, QueueConfig};
use ledger::LocalLedger;
use tempfile::TempDir;

use server::config::{AppConfig, PipelineConfig};
use server::domain::CommandContext;
use server::eventlog::LocalEventLog;
use server::pipeline::PipelineHost;
use server::service::{Upload, UploadResult};
use server::state::AppState;
use worker::{Poller, WorkerConfig};

pub const TENANT: &str = "acme";

/// A fully wired store: in-memory event log and ledger, blobs on a
/// temporary directory.
pub struct TestStore {
    pub state: AppState,
    pub host: PipelineHost,
    dir: TempDir,
}

impl TestStore {
    pub async fn spawn(queues: Vec<QueueConfig>) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let blobs = FilesystemBlobStore::new(dir.path().join("blobs"), 16 * 1024 * 1024)
            .await
            .expect("Failed to open blob store");
        let pipeline = PipelineConfig {
            tenant: TENANT.into(),
            ..Default::default()
        };

        let state = AppState::from_parts(
            Arc::new(LocalEventLog::in_memory()),
            Arc::new(blobs),
            Arc::new(LocalLedger::in_memory()),
            &pipeline,
            &queues,
            None,
        )
        .await
        .expect("Failed to wire store");

        let config = AppConfig {
            pipeline,
            queues,
            ..Default::default()
        };
        let host = PipelineHost::new(state.clone(), config);

        Self { state, host, dir }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub async fn upload(&self, handle: &str, file_name: &str, content: &[u8]) -> UploadResult {
        self.state
            .documents
            .upload(Upload::bytes(handle, file_name, content.to_vec()), &ctx())
            .await
            .expect("Upload failed")
    }

    pub fn poller(&self, identity: &str, queue: &str, converter: impl Converter + 'static) -> Poller {
        let config = WorkerConfig::new(identity, queue).with_working_dir(self.dir().join("work"));
        Poller::new(config, self.state.jobs.clone()).with_converter(Arc::new(converter))
    }
}

pub fn ctx() -> CommandContext {
    CommandContext::default().with_actor("tester")
}

pub fn handle(name: &str) -> HandleId {
    HandleId::from(name)
}

/// Turns `.txt` inputs into a "pdf" holding the uppercased text.
pub struct UppercaseConverter;

#[async_trait]
impl Converter for UppercaseConverter {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn can_convert(&self, extension: &str) -> bool {
        extension == "txt"
    }

    async fn convert(&self, request: &ConvertRequest) -> anyhow::Result<ConvertOutcome> {
        let text = tokio::fs::read_to_string(&request.input).await?;
        let stem = request
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let output = request.output_dir.join(format!("{stem}.pdf"));
        tokio::fs::write(&output, text.to_uppercase()).await?;
        Ok(ConvertOutcome::Converted(vec![
            Artifact::file("pdf", output),
            Artifact::payload("tika", serde_json::json!({ "characters": text.len() })),
        ]))
    }
}

/// Accepts everything and always fails.
pub struct BrokenConverter;

#[async_trait]
impl Converter for BrokenConverter {
    fn name(&self) -> &str {
        "broken"
    }

    fn can_convert(&self, _extension: &str) -> bool {
        true
    }

    async fn convert(&self, _request: &ConvertRequest) -> anyhow::Result<ConvertOutcome> {
        anyhow::bail!("renderer crashed")
    }
}
