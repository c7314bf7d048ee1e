use std::collections::BTreeMap;

use common::storage::{BlobStore, ContentHash};
use common::{DescriptorId, FileName, Format, HandleId};
use serde_json::json;
use server::domain::{ContentDescriptor, DescriptorCommand, Handle, HandleCommand};
use server::service::Upload;

use crate::common::{TestStore, ctx, handle};

#[tokio::test]
async fn merged_handle_resolves_to_target() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    let target = store.upload("contract", "contract.pdf", b"v1").await;
    let duplicate = store.upload("contract-copy", "copy.pdf", b"v2").await;

    docs.merge_handles(&handle("contract"), &handle("contract-copy"), &ctx())
        .await
        .unwrap();

    let entry = docs.get_handle(&handle("contract-copy")).await.unwrap();
    assert_eq!(entry.handle, handle("contract"));
    assert_eq!(entry.descriptor, target.descriptor);
    assert!(entry.names.contains(&handle("contract-copy")));
    // Nothing else referenced the duplicate's content.
    assert!(docs.get_descriptor(&duplicate.descriptor).await.is_err());
}

#[tokio::test]
async fn deleting_an_alias_keeps_the_handle() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    store.upload("a", "a.txt", b"a").await;
    store.upload("b", "b.txt", b"b").await;
    docs.merge_handles(&handle("a"), &handle("b"), &ctx())
        .await
        .unwrap();

    let result = docs.delete_handle(&handle("b"), &ctx()).await.unwrap();
    assert!(result.handles.is_empty());
    assert!(docs.get_handle(&handle("a")).await.is_ok());
    assert_eq!(
        docs.get_handle(&handle("b")).await.unwrap_err().code(),
        "NOT_FOUND"
    );
}

#[tokio::test]
async fn merging_a_handle_into_itself_is_rejected() {
    let store = TestStore::spawn(vec![]).await;
    store.upload("a", "a.txt", b"a").await;
    let err = store
        .state
        .documents
        .merge_handles(&handle("a"), &handle("A"), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn custom_data_is_set_at_upload_and_replaceable() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    docs.upload(
        Upload::bytes("doc", "d.txt", b"d".to_vec())
            .with_custom_data(BTreeMap::from([("owner".to_string(), json!("alice"))])),
        &ctx(),
    )
    .await
    .unwrap();
    assert_eq!(
        docs.get_handle(&handle("doc")).await.unwrap().custom_data["owner"],
        json!("alice")
    );

    docs.set_custom_data(
        &handle("doc"),
        BTreeMap::from([("owner".to_string(), json!("bob")), ("tag".to_string(), json!(1))]),
        &ctx(),
    )
    .await
    .unwrap();
    let entry = docs.get_handle(&handle("doc")).await.unwrap();
    assert_eq!(entry.custom_data["owner"], json!("bob"));
    assert_eq!(entry.custom_data.len(), 2);
}

#[tokio::test]
async fn duplicate_descriptors_collapse_onto_the_oldest() {
    let store = TestStore::spawn(vec![]).await;
    let docs = &store.state.documents;
    let repo = docs.repository();
    let kept = store.upload("first", "same.txt", b"same bytes").await;

    // A racing upload that missed the hash index.
    let blob = store
        .state
        .blobs
        .put(&Format::original(), &FileName::from("same.txt"), b"same bytes")
        .await
        .unwrap();
    repo.execute::<ContentDescriptor>(
        "racer",
        DescriptorCommand::Initialize {
            blob_id: blob.id.clone(),
            handle: handle("second"),
            hash: ContentHash::compute(b"same bytes"),
            file_name: FileName::from("same.txt"),
        },
        &ctx(),
    )
    .await
    .unwrap();
    repo.execute::<Handle>(
        "second",
        HandleCommand::Create {
            handle: handle("second"),
            descriptor: DescriptorId::from("racer"),
            file_name: FileName::from("same.txt"),
            formats: BTreeMap::from([(Format::original(), blob.id.clone())]),
            custom_data: BTreeMap::new(),
            attached_to: None,
        },
        &ctx(),
    )
    .await
    .unwrap();

    assert_eq!(docs.resolve_duplicates(&ctx()).await.unwrap(), 1);

    let second = docs.get_handle(&handle("second")).await.unwrap();
    assert_eq!(second.descriptor, kept.descriptor);
    let descriptor = docs.get_descriptor(&kept.descriptor).await.unwrap();
    assert_eq!(
        descriptor.handles,
        [HandleId::from("first"), HandleId::from("second")].into()
    );
    assert!(docs.get_descriptor(&DescriptorId::from("racer")).await.is_err());

    let bin = docs.recycle_bin().await.unwrap();
    assert_eq!(bin.len(), 1);
    assert_eq!(bin[0].blob_ids, vec![blob.id]);

    // Nothing left to resolve.
    assert_eq!(docs.resolve_duplicates(&ctx()).await.unwrap(), 0);
}
