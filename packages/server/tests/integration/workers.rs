use std::collections::HashSet;

use async_trait::async_trait;
use common::converter::{Artifact, ConvertOutcome, ConvertRequest, Converter};
use common::{Format, JobFilter, JobId, JobStatus, QueueConfig, TenantId};
use futures::future::join_all;
use tokio::io::AsyncReadExt;
use worker::JobOutcome;

use crate::common::{BrokenConverter, TENANT, TestStore, UppercaseConverter, handle};

#[tokio::test]
async fn converted_artifacts_become_formats() {
    let store = TestStore::spawn(vec![QueueConfig::new("text").with_extensions("txt")]).await;
    store.upload("notes", "notes.txt", b"hello pipeline").await;
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let mut poller = store.poller("w1", "text", UppercaseConverter);
    let (job_id, outcome) = poller.poll_once().await.unwrap().unwrap();
    assert_eq!(job_id, JobId::for_row(1, &TenantId::from(TENANT)));
    assert_eq!(outcome, JobOutcome::Converted { artifacts: 2 });

    let docs = &store.state.documents;
    let entry = docs.get_handle(&handle("notes")).await.unwrap();
    assert!(entry.formats.contains_key(&Format::new("tika")));

    let (info, mut reader) = docs
        .open_format(&handle("notes"), &Format::new("pdf"))
        .await
        .unwrap();
    let mut content = String::new();
    reader.read_to_string(&mut content).await.unwrap();
    assert_eq!(content, "HELLO PIPELINE");
    assert_eq!(info.file_name.as_str(), "notes.pdf");

    let job = store.state.jobs.get_job("text", &job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);

    // The new pdf and json rows do not match the txt queue.
    assert_eq!(store.host.route_pending().await.unwrap(), 0);
    assert!(poller.poll_once().await.unwrap().is_none());
}

#[tokio::test]
async fn input_without_converter_completes_as_noop() {
    let store = TestStore::spawn(vec![QueueConfig::new("all")]).await;
    store.upload("photo", "photo.png", b"png").await;
    // The detected rasterimage format shares the original blob and is not
    // routed a second time.
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let mut poller = store.poller("w1", "all", UppercaseConverter);
    let (_, outcome) = poller.poll_once().await.unwrap().unwrap();
    assert_eq!(outcome, JobOutcome::Skipped);
    assert!(poller.poll_once().await.unwrap().is_none());
    let completed = store
        .state
        .jobs
        .list_jobs("all", &JobFilter::with_status(JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    let entry = store.state.documents.get_handle(&handle("photo")).await.unwrap();
    assert_eq!(entry.formats.len(), 2);
}

#[tokio::test]
async fn repeated_failures_abandon_the_job() {
    let store = TestStore::spawn(vec![QueueConfig::new("render").with_max_failures(2)]).await;
    store.upload("notes", "notes.txt", b"hello").await;
    store.host.route_pending().await.unwrap();

    let mut poller = store.poller("w1", "render", BrokenConverter);
    let (job_id, outcome) = poller.poll_once().await.unwrap().unwrap();
    let JobOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("renderer crashed"));

    let job = store.state.jobs.get_job("render", &job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.error_count, 1);

    let (_, outcome) = poller.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(_)));
    assert!(poller.poll_once().await.unwrap().is_none());

    let job = store.state.jobs.get_job("render", &job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Abandoned);
    assert_eq!(job.error_count, 2);
    assert_eq!(job.history.len(), 2);
    assert!(job.last_error.as_deref().unwrap_or_default().contains("renderer crashed"));
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let store = TestStore::spawn(vec![QueueConfig::new("q")]).await;
    for i in 0..8 {
        store
            .upload(&format!("doc-{i}"), "doc.txt", format!("content {i}").as_bytes())
            .await;
    }
    assert_eq!(store.host.route_pending().await.unwrap(), 8);

    let claims = (0..4).map(|w| {
        let jobs = store.state.jobs.clone();
        async move {
            let identity = format!("w{w}");
            let mut claimed = Vec::new();
            while let Some(job) = jobs.claim_job("q", &identity).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }
    });
    let claimed: Vec<JobId> = join_all(claims).await.into_iter().flatten().collect();

    assert_eq!(claimed.len(), 8);
    assert_eq!(claimed.iter().collect::<HashSet<_>>().len(), 8);
}

#[tokio::test]
async fn artifact_for_deleted_document_is_dropped() {
    let store = TestStore::spawn(vec![QueueConfig::new("text")]).await;
    store.upload("notes", "notes.txt", b"hello").await;
    store.host.route_pending().await.unwrap();

    let job = store.state.jobs.claim_job("text", "w1").await.unwrap().unwrap();
    store
        .state
        .documents
        .delete_handle(&handle("notes"), &crate::common::ctx())
        .await
        .unwrap();

    let artifact = common::converter::Artifact::payload("tika", serde_json::json!({}));
    store
        .state
        .jobs
        .register_artifact(&job, "w1", &artifact)
        .await
        .unwrap();
    let job = store
        .state
        .jobs
        .complete_job("text", &job.claim().unwrap())
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
}

/// Second stage: reads the pdf produced by the first one.
struct TextExtractor;

#[async_trait]
impl Converter for TextExtractor {
    fn name(&self) -> &str {
        "text-extractor"
    }

    fn can_convert(&self, extension: &str) -> bool {
        extension == "pdf"
    }

    async fn convert(&self, request: &ConvertRequest) -> anyhow::Result<ConvertOutcome> {
        let text = tokio::fs::read_to_string(&request.input).await?;
        Ok(ConvertOutcome::Converted(vec![Artifact::payload(
            "text",
            serde_json::json!({ "text": text }),
        )]))
    }
}

#[tokio::test]
async fn second_stage_reads_first_stage_output_by_job_id() {
    let store = TestStore::spawn(vec![
        QueueConfig::new("convert").with_extensions("txt"),
        QueueConfig::new("extract").with_extensions("pdf"),
    ])
    .await;
    store.upload("notes", "notes.txt", b"hello pipeline").await;
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let mut first = store.poller("w1", "convert", UppercaseConverter);
    first.poll_once().await.unwrap().unwrap();
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let jobs = &store.state.jobs;
    let queued = jobs.list_jobs("extract", &JobFilter::default()).await.unwrap();
    assert_eq!(queued.len(), 1);
    let input = jobs.job_input("extract", &queued[0].id).await.unwrap();
    assert_eq!(input.format, Format::new("pdf"));
    assert_eq!(input.file_name.as_str(), "notes.pdf");

    let mut second = store.poller("w2", "extract", TextExtractor);
    let (job_id, outcome) = second.poll_once().await.unwrap().unwrap();
    assert_eq!(job_id, queued[0].id);
    assert_eq!(outcome, JobOutcome::Converted { artifacts: 1 });

    let (_, mut reader) = store
        .state
        .documents
        .open_format(&handle("notes"), &Format::new("text"))
        .await
        .unwrap();
    let mut body = String::new();
    reader.read_to_string(&mut body).await.unwrap();
    let payload: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(payload["text"], "HELLO PIPELINE");
}

#[tokio::test]
async fn job_input_of_unknown_job_is_not_found() {
    let store = TestStore::spawn(vec![QueueConfig::new("extract")]).await;
    let err = store
        .state
        .jobs
        .job_input("extract", &JobId::new("9_acme"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}
