use common::storage::BlobStore;
use common::{BlobId, FileName, Format, JobFilter, JobId, JobKeys, PipelineId, QueueConfig, TenantId};
use server::projections::StreamRow;

use crate::common::{TENANT, TestStore, ctx};

fn office_queue() -> QueueConfig {
    QueueConfig::new("office")
        .with_extensions("pdf|docx")
        .with_pipeline("^(?!thumbnail$).*")
        .with_parameter("quality", "high")
}

#[tokio::test]
async fn filters_decide_which_rows_enter_a_queue() {
    let store = TestStore::spawn(vec![office_queue()]).await;
    let jobs = &store.state.jobs;

    // The png original matches no extension of the queue.
    store.upload("photo", "photo.png", b"png bytes").await;
    assert_eq!(store.host.route_pending().await.unwrap(), 0);

    let report = store.upload("report", "report.docx", b"docx bytes").await;
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let blobs = &store.state.blobs;
    let thumbnail = blobs
        .put(&Format::new("pdf"), &FileName::from("report.pdf"), b"%PDF thumb")
        .await
        .unwrap();
    store
        .state
        .documents
        .add_format(
            &report.descriptor,
            Format::new("pdf"),
            &thumbnail,
            PipelineId::from("thumbnail"),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(store.host.route_pending().await.unwrap(), 0);

    let rendered = blobs
        .put(&Format::new("pdf"), &FileName::from("report.pdf"), b"%PDF full")
        .await
        .unwrap();
    store
        .state
        .documents
        .add_format(
            &report.descriptor,
            Format::new("pdf"),
            &rendered,
            PipelineId::from("office"),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let queued = jobs.list_jobs("office", &JobFilter::default()).await.unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].file_extension(), "docx");
    assert_eq!(queued[1].file_extension(), "pdf");
    assert_eq!(queued[1].param(JobKeys::PIPELINE_ID), Some("office"));
    assert_eq!(queued[1].blob_id(), Some(rendered.id.clone()));
    assert_eq!(queued[1].descriptor_id(), Some(report.descriptor.clone()));
    assert_eq!(queued[0].param("quality"), Some("high"));
}

#[tokio::test]
async fn rerouting_a_row_creates_no_second_job() {
    let store = TestStore::spawn(vec![office_queue()]).await;
    let report = store.upload("report", "report.docx", b"docx bytes").await;
    assert_eq!(store.host.route_pending().await.unwrap(), 1);

    let queued = store
        .state
        .jobs
        .list_jobs("office", &JobFilter::default())
        .await
        .unwrap();
    let job = &queued[0];
    assert_eq!(job.id, JobId::for_row(job.stream_row_id, &TenantId::from(TENANT)));

    // The projection emitting the same row again is harmless.
    let row = StreamRow {
        id: job.stream_row_id,
        descriptor_id: report.descriptor.clone(),
        format: Format::original(),
        blob_id: job.blob_id().unwrap_or_else(|| BlobId::from("missing")),
        pipeline: PipelineId::original(),
        file_extension: "docx".into(),
    };
    assert!(store.state.router.route(&row).await.unwrap().is_empty());
    assert_eq!(
        store
            .state
            .jobs
            .list_jobs("office", &JobFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(store.host.route_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn a_row_enters_every_matching_queue() {
    let store = TestStore::spawn(vec![
        QueueConfig::new("text").with_extensions("txt"),
        QueueConfig::new("everything"),
        QueueConfig::new("images").with_extensions("png"),
    ])
    .await;
    store.upload("notes", "notes.txt", b"hello").await;

    assert_eq!(store.host.route_pending().await.unwrap(), 2);
    let jobs = &store.state.jobs;
    for (queue, expected) in [("text", 1), ("everything", 1), ("images", 0)] {
        let queued = jobs.list_jobs(queue, &JobFilter::default()).await.unwrap();
        assert_eq!(queued.len(), expected, "queue {queue}");
    }
}

#[tokio::test]
async fn unknown_queue_is_not_found() {
    let store = TestStore::spawn(vec![office_queue()]).await;
    let err = store
        .state
        .jobs
        .claim_job("nope", "w1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}
