use chrono::{Duration, Utc};
use common::storage::BlobStore;
use common::{FileName, Format, PipelineId};
use server::ServiceError;

use crate::common::{TestStore, ctx, handle};

mod deduplication {
    use super::*;

    #[tokio::test]
    async fn identical_uploads_share_one_blob() {
        let store = TestStore::spawn(vec![]).await;
        let first = store.upload("invoice-1", "invoice.pdf", b"%PDF-1.7 same").await;
        let second = store.upload("invoice-2", "copy.pdf", b"%PDF-1.7 same").await;

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.descriptor, second.descriptor);

        let docs = &store.state.documents;
        let a = docs.get_handle(&handle("invoice-1")).await.unwrap();
        let b = docs.get_handle(&handle("invoice-2")).await.unwrap();
        assert_eq!(a.formats[&Format::original()], b.formats[&Format::original()]);
        assert_eq!(b.file_name.as_str(), "copy.pdf");
        assert!(b.formats.contains_key(&Format::new("pdf")));
    }

    #[tokio::test]
    async fn handle_names_are_case_insensitive() {
        let store = TestStore::spawn(vec![]).await;
        store.upload("Report", "r.txt", b"v1").await;
        let entry = store
            .state
            .documents
            .get_handle(&handle("REPORT"))
            .await
            .unwrap();
        assert_eq!(entry.handle.as_str(), "report");
    }
}

mod deletion {
    use super::*;

    #[tokio::test]
    async fn descriptor_survives_until_last_handle_is_deleted() {
        let store = TestStore::spawn(vec![]).await;
        let docs = &store.state.documents;
        let upload = store.upload("a", "scan.pdf", b"shared").await;
        store.upload("b", "scan.pdf", b"shared").await;

        let first = docs.delete_handle(&handle("a"), &ctx()).await.unwrap();
        assert_eq!(first.handles, vec![handle("a")]);
        assert!(first.descriptors.is_empty());
        assert!(docs.get_descriptor(&upload.descriptor).await.is_ok());

        let second = docs.delete_handle(&handle("b"), &ctx()).await.unwrap();
        assert_eq!(second.descriptors, vec![upload.descriptor.clone()]);
        assert!(matches!(
            docs.get_descriptor(&upload.descriptor).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_unknown_handle_is_not_found() {
        let store = TestStore::spawn(vec![]).await;
        let err = store
            .state
            .documents
            .delete_handle(&handle("ghost"), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn deletion_manifest_lists_every_blob_and_purge_reclaims_them() {
        let store = TestStore::spawn(vec![]).await;
        let docs = &store.state.documents;
        let blobs = &store.state.blobs;
        let upload = store.upload("doc", "notes.txt", b"text").await;

        let pdf = blobs
            .put(&Format::new("pdf"), &FileName::from("notes.pdf"), b"%PDF")
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
        let original = docs.get_handle(&handle("doc")).await.unwrap().formats[&Format::original()].clone();

        docs.delete_handle(&handle("doc"), &ctx()).await.unwrap();

        let bin = docs.recycle_bin().await.unwrap();
        assert_eq!(bin.len(), 1);
        assert_eq!(bin[0].descriptor, upload.descriptor);
        let mut expected = vec![original.clone(), pdf.id.clone()];
        expected.sort();
        assert_eq!(bin[0].blob_ids, expected);

        // Still within the retention window.
        let retention = Duration::days(7);
        assert_eq!(docs.purge_recycle_bin(Utc::now(), retention).await.unwrap(), 0);
        assert!(blobs.exists(&original).await.unwrap());

        let later = Utc::now() + Duration::days(8);
        assert_eq!(docs.purge_recycle_bin(later, retention).await.unwrap(), 2);
        assert!(!blobs.exists(&original).await.unwrap());
        assert!(!blobs.exists(&pdf.id).await.unwrap());
        assert!(docs.recycle_bin().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_name_can_be_reused() {
        let store = TestStore::spawn(vec![]).await;
        let docs = &store.state.documents;
        store.upload("doc", "v1.txt", b"first").await;
        docs.delete_handle(&handle("doc"), &ctx()).await.unwrap();

        let again = store.upload("doc", "v2.txt", b"second").await;
        let entry = docs.get_handle(&handle("doc")).await.unwrap();
        assert_eq!(entry.descriptor, again.descriptor);
        assert_eq!(entry.file_name.as_str(), "v2.txt");
    }
}
