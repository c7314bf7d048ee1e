use common::storage::BlobStore;
use common::{FileName, Format, JobFilter, PipelineId, QueueConfig};

use crate::common::{TestStore, ctx, handle};

#[tokio::test]
async fn last_registered_blob_wins() {
    let store = TestStore::spawn(vec![QueueConfig::new("all")]).await;
    let docs = &store.state.documents;
    let blobs = &store.state.blobs;
    let upload = store.upload("doc", "notes.txt", b"text").await;

    let first = blobs
        .put(&Format::new("pdf"), &FileName::from("notes.pdf"), b"%PDF one")
        .await
        .unwrap();
    let second = blobs
        .put(&Format::new("pdf"), &FileName::from("notes.pdf"), b"%PDF two")
        .await
        .unwrap();
    for (blob, pipeline) in [(&first, "office"), (&second, "rerender")] {
        docs.add_format(
            &upload.descriptor,
            Format::new("PDF"),
            blob,
            PipelineId::from(pipeline),
            &ctx(),
        )
        .await
        .unwrap();
    }

    let entry = docs.get_handle(&handle("doc")).await.unwrap();
    assert_eq!(entry.formats[&Format::new("pdf")], second.id);
    let descriptor = docs.get_descriptor(&upload.descriptor).await.unwrap();
    assert_eq!(descriptor.formats[&Format::new("pdf")], second.id);

    // The replaced blob is orphaned, not deleted.
    assert!(blobs.exists(&first.id).await.unwrap());

    // Both registrations are new artifacts for the pipeline.
    assert_eq!(store.host.route_pending().await.unwrap(), 3);
}

#[tokio::test]
async fn registering_the_same_blob_twice_is_a_noop() {
    let store = TestStore::spawn(vec![QueueConfig::new("all")]).await;
    let docs = &store.state.documents;
    let upload = store.upload("doc", "notes.txt", b"text").await;
    let pdf = store
        .state
        .blobs
        .put(&Format::new("pdf"), &FileName::from("notes.pdf"), b"%PDF")
        .await
        .unwrap();

    for _ in 0..2 {
        docs.add_format(
            &upload.descriptor,
            Format::new("pdf"),
            &pdf,
            PipelineId::from("office"),
            &ctx(),
        )
        .await
        .unwrap();
    }

    store.host.route_pending().await.unwrap();
    let jobs = store
        .state
        .jobs
        .list_jobs("all", &JobFilter::default())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn format_reaches_every_handle_of_the_descriptor() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    let upload = store.upload("a", "same.txt", b"same").await;
    store.upload("b", "same.txt", b"same").await;

    let pdf = store
        .state
        .blobs
        .put(&Format::new("pdf"), &FileName::from("same.pdf"), b"%PDF")
        .await
        .unwrap();
    docs.add_format(
        &upload.descriptor,
        Format::new("pdf"),
        &pdf,
        PipelineId::from("office"),
        &ctx(),
    )
    .await
    .unwrap();

    for name in ["a", "b"] {
        let entry = docs.get_handle(&handle(name)).await.unwrap();
        assert_eq!(entry.formats[&Format::new("pdf")], pdf.id);
    }
}

#[tokio::test]
async fn format_on_deleted_descriptor_is_rejected_and_blob_discarded() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    let upload = store.upload("doc", "notes.txt", b"text").await;
    docs.delete_handle(&handle("doc"), &ctx()).await.unwrap();

    let pdf = store
        .state
        .blobs
        .put(&Format::new("pdf"), &FileName::from("notes.pdf"), b"%PDF")
        .await
        .unwrap();
    let err = docs
        .add_format(
            &upload.descriptor,
            Format::new("pdf"),
            &pdf,
            PipelineId::from("office"),
            &ctx(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(!store.state.blobs.exists(&pdf.id).await.unwrap());
}

#[tokio::test]
async fn deleting_a_format_removes_it_from_handles() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    store.upload("scan", "scan.PDF", b"%PDF scan").await;
    assert!(
        docs.get_handle(&handle("scan"))
            .await
            .unwrap()
            .formats
            .contains_key(&Format::new("pdf"))
    );

    docs.delete_format(&handle("scan"), &Format::new("pdf"), &ctx())
        .await
        .unwrap();
    let entry = docs.get_handle(&handle("scan")).await.unwrap();
    assert_eq!(entry.formats.keys().collect::<Vec<_>>(), vec![&Format::original()]);
}
