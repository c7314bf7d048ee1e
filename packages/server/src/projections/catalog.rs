use std::collections::{BTreeMap, BTreeSet};

use common::storage::ContentHash;
use common::{BlobId, DescriptorId, FileName, Format, HandleId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Projection;
use crate::domain::aggregate::decode_event;
use crate::domain::{ContentDescriptor, DescriptorEvent, Handle, HandleEvent};
use crate::eventlog::RecordedEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub id: DescriptorId,
    pub hash: ContentHash,
    pub file_name: FileName,
    pub formats: BTreeMap<Format, BlobId>,
    pub handles: BTreeSet<HandleId>,
    /// Log position of the initialization.
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleEntry {
    pub handle: HandleId,
    pub descriptor: DescriptorId,
    pub file_name: FileName,
    pub formats: BTreeMap<Format, BlobId>,
    /// Names resolving to this handle, its own name while not detached.
    pub names: BTreeSet<HandleId>,
    pub attachments: BTreeSet<HandleId>,
    pub attached_to: Option<HandleId>,
    pub custom_data: BTreeMap<String, Value>,
}

/// Live descriptors and handles, the content hash index and alias
/// resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentCatalog {
    descriptors: BTreeMap<DescriptorId, DescriptorEntry>,
    /// Live descriptors per hash in creation order.
    by_hash: BTreeMap<ContentHash, Vec<DescriptorId>>,
    handles: BTreeMap<HandleId, HandleEntry>,
    /// Alias -> handle stream it belongs to.
    aliases: BTreeMap<HandleId, HandleId>,
}

impl DocumentCatalog {
    pub fn descriptor(&self, id: &DescriptorId) -> Option<&DescriptorEntry> {
        self.descriptors.get(id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &DescriptorEntry> {
        self.descriptors.values()
    }

    /// Oldest live descriptor holding content with this hash.
    pub fn find_by_hash(&self, hash: &ContentHash) -> Option<&DescriptorEntry> {
        self.by_hash
            .get(hash)
            .and_then(|ids| ids.first())
            .and_then(|id| self.descriptors.get(id))
    }

    /// Hashes held by more than one live descriptor, oldest descriptor first.
    pub fn duplicate_groups(&self) -> Vec<(ContentHash, Vec<DescriptorId>)> {
        self.by_hash
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(hash, ids)| (*hash, ids.clone()))
            .collect()
    }

    /// Handle stream a name refers to, following aliases.
    pub fn resolve(&self, name: &HandleId) -> Option<&HandleId> {
        if let Some(canonical) = self.aliases.get(name) {
            return Some(canonical);
        }
        self.handles
            .get_key_value(name)
            .filter(|(_, entry)| entry.names.contains(name))
            .map(|(key, _)| key)
    }

    pub fn handle(&self, name: &HandleId) -> Option<&HandleEntry> {
        self.resolve(name).and_then(|h| self.handles.get(h))
    }

    pub fn handles(&self) -> impl Iterator<Item = &HandleEntry> {
        self.handles.values()
    }

    fn apply_descriptor(&mut self, id: DescriptorId, position: u64, event: DescriptorEvent) {
        match event {
            DescriptorEvent::Initialized {
                blob_id,
                handle,
                hash,
                file_name,
            } => {
                self.by_hash.entry(hash).or_default().push(id.clone());
                self.descriptors.insert(
                    id.clone(),
                    DescriptorEntry {
                        id,
                        hash,
                        file_name,
                        formats: BTreeMap::from([(Format::original(), blob_id)]),
                        handles: BTreeSet::from([handle]),
                        created_at: position,
                    },
                );
            }
            DescriptorEvent::FormatAdded {
                format, blob_id, ..
            }
            | DescriptorEvent::FormatUpdated {
                format, blob_id, ..
            } => {
                if let Some(entry) = self.descriptors.get_mut(&id) {
                    entry.formats.insert(format, blob_id);
                }
            }
            DescriptorEvent::FormatDeleted { format, .. } => {
                if let Some(entry) = self.descriptors.get_mut(&id) {
                    entry.formats.remove(&format);
                }
            }
            DescriptorEvent::HandleAttached { handle } => {
                if let Some(entry) = self.descriptors.get_mut(&id) {
                    entry.handles.insert(handle);
                }
            }
            DescriptorEvent::HandleDetached { handle } => {
                if let Some(entry) = self.descriptors.get_mut(&id) {
                    entry.handles.remove(&handle);
                }
            }
            DescriptorEvent::Deduplicated { .. } => {}
            DescriptorEvent::Deleted { .. } => {
                let Some(entry) = self.descriptors.remove(&id) else {
                    return;
                };
                if let Some(ids) = self.by_hash.get_mut(&entry.hash) {
                    ids.retain(|d| *d != id);
                    if ids.is_empty() {
                        self.by_hash.remove(&entry.hash);
                    }
                }
            }
        }
    }

    fn apply_handle(&mut self, id: HandleId, event: HandleEvent) {
        if let HandleEvent::Created {
            handle,
            descriptor,
            file_name,
            formats,
            custom_data,
            attached_to,
        } = event
        {
            self.aliases.remove(&handle);
            self.handles.insert(
                id,
                HandleEntry {
                    names: BTreeSet::from([handle.clone()]),
                    handle,
                    descriptor,
                    file_name,
                    formats,
                    attachments: BTreeSet::new(),
                    attached_to,
                    custom_data,
                },
            );
            return;
        }

        if let HandleEvent::Deleted { .. } = event {
            self.handles.remove(&id);
            self.aliases.retain(|_, canonical| *canonical != id);
            return;
        }

        let Some(entry) = self.handles.get_mut(&id) else {
            return;
        };
        match event {
            HandleEvent::DescriptorLinked {
                descriptor,
                file_name,
                formats,
                ..
            } => {
                entry.descriptor = descriptor;
                entry.file_name = file_name;
                entry.formats = formats;
            }
            HandleEvent::FormatAdded { format, blob_id }
            | HandleEvent::FormatUpdated { format, blob_id } => {
                entry.formats.insert(format, blob_id);
            }
            HandleEvent::FormatDeleted { format } => {
                entry.formats.remove(&format);
            }
            HandleEvent::AttachmentAdded { child } => {
                entry.attachments.insert(child);
            }
            HandleEvent::AttachmentRemoved { child } => {
                entry.attachments.remove(&child);
            }
            HandleEvent::CustomDataSet { data } => {
                entry.custom_data = data;
            }
            HandleEvent::AliasAttached { alias, .. } => {
                entry.names.insert(alias.clone());
                if alias != id {
                    self.aliases.insert(alias, id);
                }
            }
            HandleEvent::AliasDetached { alias } => {
                entry.names.remove(&alias);
                self.aliases.remove(&alias);
            }
            HandleEvent::Created { .. }
            | HandleEvent::Deleted { .. }
            | HandleEvent::Deduplicated { .. } => {}
        }
    }
}

impl Projection for DocumentCatalog {
    const NAME: &'static str = "catalog";

    fn apply(&mut self, event: &RecordedEvent) {
        let id = event.stream.aggregate_id.as_str();
        if let Some(e) = decode_event::<ContentDescriptor>(event) {
            self.apply_descriptor(DescriptorId::from(id), event.position, e);
        } else if let Some(e) = decode_event::<Handle>(event) {
            self.apply_handle(HandleId::from(id), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::domain::{CommandContext, DescriptorCommand, HandleCommand};
    use crate::eventlog::LocalEventLog;
    use crate::projections::ProjectionRunner;
    use crate::repository::Repository;

    struct Fixture {
        log: Arc<LocalEventLog>,
        repo: Repository,
        ctx: CommandContext,
    }

    impl Fixture {
        fn new() -> Self {
            let log = Arc::new(LocalEventLog::in_memory());
            Self {
                repo: Repository::new(log.clone()),
                log,
                ctx: CommandContext::default(),
            }
        }

        async fn descriptor(&self, id: &str, cmd: DescriptorCommand) {
            self.repo
                .execute::<ContentDescriptor>(id, cmd, &self.ctx)
                .await
                .unwrap();
        }

        async fn handle(&self, id: &str, cmd: HandleCommand) {
            self.repo
                .execute::<Handle>(id, cmd, &self.ctx)
                .await
                .unwrap();
        }

        async fn catalog(&self) -> DocumentCatalog {
            let mut runner = ProjectionRunner::<DocumentCatalog>::in_memory();
            runner.catch_up(self.log.as_ref()).await.unwrap();
            runner.state().clone()
        }

        async fn upload(&self, descriptor: &str, handle: &str, content: &[u8]) {
            let blob = format!("original.{descriptor}");
            self.descriptor(
                descriptor,
                DescriptorCommand::Initialize {
                    blob_id: BlobId::from(blob.as_str()),
                    handle: HandleId::from(handle),
                    hash: ContentHash::compute(content),
                    file_name: FileName::from("a.docx"),
                },
            )
            .await;
            self.handle(
                handle,
                HandleCommand::Create {
                    handle: HandleId::from(handle),
                    descriptor: DescriptorId::from(descriptor),
                    file_name: FileName::from("a.docx"),
                    formats: BTreeMap::from([(Format::original(), BlobId::from(blob.as_str()))]),
                    custom_data: BTreeMap::from([("k".to_string(), json!(1))]),
                    attached_to: None,
                },
            )
            .await;
        }
    }

    #[tokio::test]
    async fn indexes_descriptors_by_hash_oldest_first() {
        let f = Fixture::new();
        f.upload("d1", "doc1", b"same").await;
        f.upload("d2", "doc2", b"same").await;
        f.upload("d3", "doc3", b"other").await;

        let catalog = f.catalog().await;
        let found = catalog.find_by_hash(&ContentHash::compute(b"same")).unwrap();
        assert_eq!(found.id.as_str(), "d1");

        let groups = catalog.duplicate_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].1,
            vec![DescriptorId::from("d1"), DescriptorId::from("d2")]
        );
    }

    #[tokio::test]
    async fn deleted_descriptor_leaves_index() {
        let f = Fixture::new();
        f.upload("d1", "doc1", b"same").await;
        f.descriptor(
            "d1",
            DescriptorCommand::DetachHandle {
                handle: HandleId::from("doc1"),
            },
        )
        .await;

        let catalog = f.catalog().await;
        assert!(catalog.find_by_hash(&ContentHash::compute(b"same")).is_none());
        assert!(catalog.descriptor(&DescriptorId::from("d1")).is_none());
    }

    #[tokio::test]
    async fn aliases_resolve_to_their_handle() {
        let f = Fixture::new();
        f.upload("d1", "doc1", b"a").await;
        f.handle(
            "doc1",
            HandleCommand::DeduplicateOnto {
                other: HandleId::from("doc2"),
                alias: HandleId::from("doc2"),
                file_name: FileName::from("b.docx"),
            },
        )
        .await;

        let catalog = f.catalog().await;
        assert_eq!(
            catalog.resolve(&HandleId::from("DOC2")),
            Some(&HandleId::from("doc1"))
        );
        assert_eq!(catalog.handle(&HandleId::from("doc2")).unwrap().custom_data["k"], json!(1));

        f.handle(
            "doc1",
            HandleCommand::Delete {
                alias: Some(HandleId::from("doc1")),
            },
        )
        .await;
        let catalog = f.catalog().await;
        assert!(catalog.resolve(&HandleId::from("doc1")).is_none());
        assert_eq!(
            catalog.resolve(&HandleId::from("doc2")),
            Some(&HandleId::from("doc1"))
        );

        f.handle(
            "doc1",
            HandleCommand::Delete {
                alias: Some(HandleId::from("doc2")),
            },
        )
        .await;
        let catalog = f.catalog().await;
        assert!(catalog.resolve(&HandleId::from("doc2")).is_none());
        assert_eq!(catalog.handles().count(), 0);
    }

    #[tokio::test]
    async fn tracks_handle_formats() {
        let f = Fixture::new();
        f.upload("d1", "doc1", b"a").await;
        f.handle(
            "doc1",
            HandleCommand::AddFormat {
                format: Format::from("pdf"),
                blob_id: BlobId::from("pdf.1"),
            },
        )
        .await;

        let catalog = f.catalog().await;
        let entry = catalog.handle(&HandleId::from("doc1")).unwrap();
        assert_eq!(entry.formats.len(), 2);
        assert_eq!(entry.descriptor.as_str(), "d1");
    }
}
