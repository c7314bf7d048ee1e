use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::storage::{BlobInfo, BlobStore, BoxReader, ContentHash, ContentHasher, StorageError};
use common::{BlobId, DescriptorId, FileName, Format, HandleId, PipelineId};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{
    CommandContext, ContentDescriptor, DescriptorCommand, DescriptorError, DescriptorEvent, Handle,
    HandleCommand, HandleError, HandleEvent,
};
use crate::error::{Result, ServiceError};
use crate::projections::{
    DescriptorEntry, DocumentCatalog, HandleEntry, ProjectionRunner, RecycleBin, RecycleEntry,
};
use crate::repository::{ExecuteError, Repository};

pub enum UploadSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// A document to ingest under a handle.
pub struct Upload {
    pub handle: HandleId,
    pub file_name: FileName,
    pub source: UploadSource,
    pub custom_data: BTreeMap<String, Value>,
    /// Parent handle this upload enriches.
    pub attach_to: Option<HandleId>,
}

impl Upload {
    pub fn bytes(handle: impl Into<HandleId>, file_name: impl Into<FileName>, data: Vec<u8>) -> Self {
        Self {
            handle: handle.into(),
            file_name: file_name.into(),
            source: UploadSource::Bytes(data),
            custom_data: BTreeMap::new(),
            attach_to: None,
        }
    }

    /// Upload of a local file under its own name.
    pub fn file(handle: impl Into<HandleId>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = FileName::new(path.to_string_lossy().into_owned());
        Self {
            handle: handle.into(),
            file_name,
            source: UploadSource::File(path),
            custom_data: BTreeMap::new(),
            attach_to: None,
        }
    }

    pub fn with_custom_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.custom_data = data;
        self
    }

    pub fn attached_to(mut self, parent: impl Into<HandleId>) -> Self {
        self.attach_to = Some(parent.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub handle: HandleId,
    pub descriptor: DescriptorId,
    /// The content was already stored; no new blob was written.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub handles: Vec<HandleId>,
    pub descriptors: Vec<DescriptorId>,
}

/// Command submission for documents: routes each operation to the
/// descriptor and handle aggregates it touches.
pub struct DocumentService {
    repo: Repository,
    blobs: Arc<dyn BlobStore>,
    catalog: Mutex<ProjectionRunner<DocumentCatalog>>,
    recycle_bin: Mutex<ProjectionRunner<RecycleBin>>,
}

impl DocumentService {
    pub fn new(
        repo: Repository,
        blobs: Arc<dyn BlobStore>,
        catalog: ProjectionRunner<DocumentCatalog>,
        recycle_bin: ProjectionRunner<RecycleBin>,
    ) -> Self {
        Self {
            repo,
            blobs,
            catalog: Mutex::new(catalog),
            recycle_bin: Mutex::new(recycle_bin),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Read the catalog after catching it up with the log.
    pub async fn with_catalog<R>(&self, f: impl FnOnce(&DocumentCatalog) -> R) -> Result<R> {
        let mut runner = self.catalog.lock().await;
        runner.catch_up(self.repo.event_log().as_ref()).await?;
        Ok(f(runner.state()))
    }

    async fn resolve(&self, name: &HandleId) -> Result<Option<HandleId>> {
        self.with_catalog(|c| c.resolve(name).cloned()).await
    }

    async fn require(&self, name: &HandleId) -> Result<HandleId> {
        self.resolve(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Handle {name} not found")))
    }

    pub async fn upload(&self, upload: Upload, ctx: &CommandContext) -> Result<UploadResult> {
        if !upload.handle.is_valid() {
            return Err(ServiceError::Validation(format!(
                "Invalid handle \"{}\"",
                upload.handle
            )));
        }
        let file_name = upload.file_name.sanitized();
        let handle = self
            .resolve(&upload.handle)
            .await?
            .unwrap_or_else(|| upload.handle.clone());
        let parent = match &upload.attach_to {
            Some(parent) => Some(self.require(parent).await?),
            None => None,
        };
        if parent.as_ref() == Some(&handle) {
            return Err(ServiceError::Validation(
                "A handle cannot be attached to itself".into(),
            ));
        }

        let hash = match &upload.source {
            UploadSource::Bytes(data) => ContentHash::compute(data),
            UploadSource::File(path) => hash_file(path).await?,
        };

        let (descriptor, formats, deduplicated) =
            match self.attach_to_existing(&hash, &handle, ctx).await? {
                Some((descriptor, formats)) => (descriptor, formats, true),
                None => {
                    let (descriptor, formats) = self
                        .initialize(&upload.source, &file_name, hash, &handle, ctx)
                        .await?;
                    (descriptor, formats, false)
                }
            };

        self.bind_handle(
            &handle,
            &descriptor,
            &file_name,
            formats,
            upload.custom_data,
            parent.clone(),
            ctx,
        )
        .await?;

        if let Some(parent) = parent {
            self.repo
                .execute::<Handle>(
                    parent.as_str(),
                    HandleCommand::AddAttachment {
                        child: handle.clone(),
                    },
                    ctx,
                )
                .await?;
        }

        info!(
            handle = %handle,
            descriptor_id = %descriptor,
            hash = %hash,
            deduplicated,
            "Document uploaded"
        );
        Ok(UploadResult {
            handle,
            descriptor,
            deduplicated,
        })
    }

    /// Bind `handle` to a live descriptor already holding this content.
    async fn attach_to_existing(
        &self,
        hash: &ContentHash,
        handle: &HandleId,
        ctx: &CommandContext,
    ) -> Result<Option<(DescriptorId, BTreeMap<Format, BlobId>)>> {
        let Some(existing) = self
            .with_catalog(|c| c.find_by_hash(hash).map(|d| d.id.clone()))
            .await?
        else {
            return Ok(None);
        };

        match self
            .repo
            .execute::<ContentDescriptor>(
                existing.as_str(),
                DescriptorCommand::AttachHandle {
                    handle: handle.clone(),
                },
                ctx,
            )
            .await
        {
            Ok(executed) => Ok(Some((existing, executed.state.formats))),
            // Deleted since the catalog last saw it.
            Err(ExecuteError::Domain(DescriptorError::AlreadyDeleted)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn initialize(
        &self,
        source: &UploadSource,
        file_name: &FileName,
        hash: ContentHash,
        handle: &HandleId,
        ctx: &CommandContext,
    ) -> Result<(DescriptorId, BTreeMap<Format, BlobId>)> {
        let original = Format::original();
        let info = match source {
            UploadSource::Bytes(data) => self.blobs.put(&original, file_name, data).await?,
            UploadSource::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(StorageError::from)?;
                self.blobs
                    .put_stream(&original, file_name, Box::new(tokio::io::BufReader::new(file)))
                    .await?
            }
        };

        let descriptor = DescriptorId::generate();
        let executed = self
            .repo
            .execute::<ContentDescriptor>(
                descriptor.as_str(),
                DescriptorCommand::Initialize {
                    blob_id: info.id.clone(),
                    handle: handle.clone(),
                    hash,
                    file_name: file_name.clone(),
                },
                ctx,
            )
            .await;
        match executed {
            Ok(executed) => Ok((descriptor, executed.state.formats)),
            Err(e) => {
                self.discard_blob(&info.id).await;
                Err(e.into())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn bind_handle(
        &self,
        handle: &HandleId,
        descriptor: &DescriptorId,
        file_name: &FileName,
        formats: BTreeMap<Format, BlobId>,
        custom_data: BTreeMap<String, Value>,
        parent: Option<HandleId>,
        ctx: &CommandContext,
    ) -> Result<()> {
        let (current, _) = self.repo.load::<Handle>(handle.as_str()).await?;
        if !current.is_live() {
            self.repo
                .execute::<Handle>(
                    handle.as_str(),
                    HandleCommand::Create {
                        handle: handle.clone(),
                        descriptor: descriptor.clone(),
                        file_name: file_name.clone(),
                        formats,
                        custom_data,
                        attached_to: parent,
                    },
                    ctx,
                )
                .await?;
            return Ok(());
        }

        let executed = self
            .repo
            .execute::<Handle>(
                handle.as_str(),
                HandleCommand::LinkDescriptor {
                    descriptor: descriptor.clone(),
                    file_name: file_name.clone(),
                    formats,
                },
                ctx,
            )
            .await?;
        for event in &executed.events {
            if let HandleEvent::DescriptorLinked {
                previous: Some(previous),
                ..
            } = event
                && previous != descriptor
            {
                self.detach(previous, handle, ctx).await?;
            }
        }

        if !custom_data.is_empty() {
            self.repo
                .execute::<Handle>(
                    handle.as_str(),
                    HandleCommand::SetCustomData { data: custom_data },
                    ctx,
                )
                .await?;
        }
        Ok(())
    }

    /// Detach `handle` from a descriptor, tolerating a descriptor that has
    /// already let go of it.
    async fn detach(
        &self,
        descriptor: &DescriptorId,
        handle: &HandleId,
        ctx: &CommandContext,
    ) -> Result<bool> {
        let result = self
            .repo
            .execute::<ContentDescriptor>(
                descriptor.as_str(),
                DescriptorCommand::DetachHandle {
                    handle: handle.clone(),
                },
                ctx,
            )
            .await;
        match result {
            Ok(executed) => {
                let deleted = executed
                    .events
                    .iter()
                    .any(|e| matches!(e, DescriptorEvent::Deleted { .. }));
                if deleted {
                    info!(descriptor_id = %descriptor, "Descriptor deleted");
                }
                Ok(deleted)
            }
            Err(ExecuteError::Domain(
                e @ (DescriptorError::InvalidHandle(_) | DescriptorError::AlreadyDeleted),
            )) => {
                debug!(descriptor_id = %descriptor, handle = %handle, error = %e, "Handle already detached");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register a produced artifact as a format of a descriptor and of every
    /// handle bound to it.
    ///
    /// The blob is deleted again when the descriptor rejects the format, so
    /// a failed registration leaves nothing behind.
    pub async fn add_format(
        &self,
        descriptor: &DescriptorId,
        format: Format,
        blob: &BlobInfo,
        pipeline: PipelineId,
        ctx: &CommandContext,
    ) -> Result<()> {
        let executed = match self
            .repo
            .execute::<ContentDescriptor>(
                descriptor.as_str(),
                DescriptorCommand::AddFormat {
                    format: format.clone(),
                    blob_id: blob.id.clone(),
                    pipeline: pipeline.clone(),
                    file_name: blob.file_name.clone(),
                },
                ctx,
            )
            .await
        {
            Ok(executed) => executed,
            Err(e) => {
                self.discard_blob(&blob.id).await;
                return Err(e.into());
            }
        };

        for event in &executed.events {
            if let DescriptorEvent::FormatUpdated { previous, .. } = event {
                info!(descriptor_id = %descriptor, format = %format, orphaned = %previous, "Format replaced");
            }
        }

        for handle in &executed.state.handles {
            let result = self
                .repo
                .execute::<Handle>(
                    handle.as_str(),
                    HandleCommand::AddFormat {
                        format: format.clone(),
                        blob_id: blob.id.clone(),
                    },
                    ctx,
                )
                .await;
            if let Err(e) = result {
                warn!(handle = %handle, format = %format, error = %e, "Failed to propagate format to handle");
            }
        }

        info!(
            descriptor_id = %descriptor,
            format = %format,
            blob_id = %blob.id,
            pipeline = %pipeline,
            "Format added"
        );
        Ok(())
    }

    pub async fn delete_format(
        &self,
        name: &HandleId,
        format: &Format,
        ctx: &CommandContext,
    ) -> Result<()> {
        if format.is_original() {
            return Err(ServiceError::Validation(
                "The original format cannot be deleted".into(),
            ));
        }
        let handle = self.require(name).await?;
        let (state, _) = self.repo.load::<Handle>(handle.as_str()).await?;
        let Some(descriptor) = state.descriptor else {
            return Err(ServiceError::NotFound(format!("Handle {name} not found")));
        };

        let executed = self
            .repo
            .execute::<ContentDescriptor>(
                descriptor.as_str(),
                DescriptorCommand::DeleteFormat {
                    format: format.clone(),
                },
                ctx,
            )
            .await?;
        for handle in &executed.state.handles {
            self.repo
                .execute::<Handle>(
                    handle.as_str(),
                    HandleCommand::DeleteFormat {
                        format: format.clone(),
                    },
                    ctx,
                )
                .await?;
        }
        Ok(())
    }

    /// Delete a handle, or one alias of it.
    ///
    /// A deleted handle takes its attachments with it and detaches from its
    /// descriptor, which deletes itself when no handle is left.
    pub async fn delete_handle(&self, name: &HandleId, ctx: &CommandContext) -> Result<DeleteResult> {
        let canonical = self.require(name).await?;
        let mut result = DeleteResult::default();
        let mut visited = HashSet::new();

        let alias = (canonical != *name).then(|| name.clone());
        let mut pending = vec![(canonical, alias, false)];

        while let Some((handle, alias, cascaded)) = pending.pop() {
            if !visited.insert(handle.clone()) {
                continue;
            }
            let executed = match self
                .repo
                .execute::<Handle>(handle.as_str(), HandleCommand::Delete { alias }, ctx)
                .await
            {
                Ok(executed) => executed,
                // Attachment removed on its own already.
                Err(ExecuteError::Domain(
                    HandleError::AlreadyDeleted | HandleError::NotCreated,
                )) if cascaded => continue,
                Err(e) => return Err(e.into()),
            };

            let Some(HandleEvent::Deleted {
                descriptor,
                attachments,
                ..
            }) = executed.events.last().cloned()
            else {
                info!(handle = %handle, "Alias removed");
                continue;
            };
            info!(handle = %handle, attachments = attachments.len(), "Handle deleted");
            result.handles.push(handle.clone());

            if let Some(parent) = &executed.state.attached_to {
                self.unlink_from_parent(parent, &handle, ctx).await?;
            }
            if let Some(descriptor) = descriptor
                && self.detach(&descriptor, &handle, ctx).await?
            {
                result.descriptors.push(descriptor);
            }
            pending.extend(attachments.into_iter().map(|child| (child, None, true)));
        }

        Ok(result)
    }

    async fn unlink_from_parent(
        &self,
        parent: &HandleId,
        child: &HandleId,
        ctx: &CommandContext,
    ) -> Result<()> {
        let Some(parent) = self.resolve(parent).await? else {
            return Ok(());
        };
        let result = self
            .repo
            .execute::<Handle>(
                parent.as_str(),
                HandleCommand::RemoveAttachment {
                    child: child.clone(),
                },
                ctx,
            )
            .await;
        match result {
            Ok(_) | Err(ExecuteError::Domain(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fold `duplicate` into `target`: the duplicate's name becomes an alias
    /// of the target and its own binding is released.
    pub async fn merge_handles(
        &self,
        target: &HandleId,
        duplicate: &HandleId,
        ctx: &CommandContext,
    ) -> Result<()> {
        let target = self.require(target).await?;
        let duplicate = self.require(duplicate).await?;
        if target == duplicate {
            return Err(ServiceError::Validation(format!(
                "{duplicate} already resolves to {target}"
            )));
        }

        let (dup_state, _) = self.repo.load::<Handle>(duplicate.as_str()).await?;
        let file_name = dup_state
            .file_name
            .clone()
            .unwrap_or_else(|| FileName::new(duplicate.as_str()));

        self.repo
            .execute::<Handle>(
                target.as_str(),
                HandleCommand::DeduplicateOnto {
                    other: duplicate.clone(),
                    alias: duplicate.clone(),
                    file_name,
                },
                ctx,
            )
            .await?;
        for child in &dup_state.attachments {
            self.repo
                .execute::<Handle>(
                    target.as_str(),
                    HandleCommand::AddAttachment {
                        child: child.clone(),
                    },
                    ctx,
                )
                .await?;
        }

        self.repo
            .execute::<Handle>(
                duplicate.as_str(),
                HandleCommand::Delete { alias: None },
                ctx,
            )
            .await?;
        if let Some(descriptor) = &dup_state.descriptor {
            self.detach(descriptor, &duplicate, ctx).await?;
        }

        info!(target = %target, duplicate = %duplicate, "Handles merged");
        Ok(())
    }

    pub async fn set_custom_data(
        &self,
        name: &HandleId,
        data: BTreeMap<String, Value>,
        ctx: &CommandContext,
    ) -> Result<()> {
        let handle = self.require(name).await?;
        self.repo
            .execute::<Handle>(handle.as_str(), HandleCommand::SetCustomData { data }, ctx)
            .await?;
        Ok(())
    }

    /// Collapse live descriptors sharing a content hash onto the oldest one.
    ///
    /// Concurrent uploads of identical bytes can both miss the hash index;
    /// this moves every handle of the newer descriptors over, after which
    /// they delete themselves. Returns the number of handles moved.
    pub async fn resolve_duplicates(&self, ctx: &CommandContext) -> Result<usize> {
        let groups = self
            .with_catalog(|c| {
                c.duplicate_groups()
                    .into_iter()
                    .map(|(hash, ids)| {
                        let members: Vec<DescriptorEntry> = ids
                            .iter()
                            .filter_map(|id| c.descriptor(id).cloned())
                            .collect();
                        (hash, members)
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        let mut moved = 0;
        for (hash, members) in groups {
            let Some((keep, redundant)) = members.split_first() else {
                continue;
            };
            for other in redundant {
                for handle in &other.handles {
                    self.move_handle(keep, other, handle, ctx).await?;
                    moved += 1;
                }
            }
            info!(hash = %hash, kept = %keep.id, merged = redundant.len(), "Duplicate descriptors resolved");
        }
        Ok(moved)
    }

    async fn move_handle(
        &self,
        keep: &DescriptorEntry,
        other: &DescriptorEntry,
        handle: &HandleId,
        ctx: &CommandContext,
    ) -> Result<()> {
        let (handle_state, _) = self.repo.load::<Handle>(handle.as_str()).await?;
        let file_name = handle_state
            .file_name
            .clone()
            .unwrap_or_else(|| other.file_name.clone());

        let executed = self
            .repo
            .execute::<ContentDescriptor>(
                keep.id.as_str(),
                DescriptorCommand::Deduplicate {
                    duplicate: other.id.clone(),
                    handle: handle.clone(),
                    file_name: file_name.clone(),
                },
                ctx,
            )
            .await?;

        if handle_state.is_live() && handle_state.descriptor.as_ref() == Some(&other.id) {
            self.repo
                .execute::<Handle>(
                    handle.as_str(),
                    HandleCommand::LinkDescriptor {
                        descriptor: keep.id.clone(),
                        file_name,
                        formats: executed.state.formats,
                    },
                    ctx,
                )
                .await?;
        }
        self.detach(&other.id, handle, ctx).await?;
        debug!(handle = %handle, from = %other.id, to = %keep.id, "Handle moved to surviving descriptor");
        Ok(())
    }

    pub async fn get_handle(&self, name: &HandleId) -> Result<HandleEntry> {
        self.with_catalog(|c| c.handle(name).cloned())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Handle {name} not found")))
    }

    pub async fn get_descriptor(&self, id: &DescriptorId) -> Result<DescriptorEntry> {
        self.with_catalog(|c| c.descriptor(id).cloned())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Descriptor {id} not found")))
    }

    async fn format_blob(&self, name: &HandleId, format: &Format) -> Result<BlobId> {
        let entry = self.get_handle(name).await?;
        entry
            .formats
            .get(format)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("Handle {name} has no format {format}")))
    }

    /// Stream one format of a document.
    pub async fn open_format(
        &self,
        name: &HandleId,
        format: &Format,
    ) -> Result<(BlobInfo, BoxReader)> {
        let blob = self.format_blob(name, format).await?;
        let info = self.blobs.info(&blob).await?;
        let reader = self.blobs.get_stream(&blob).await?;
        Ok((info, reader))
    }

    pub async fn download_format(
        &self,
        name: &HandleId,
        format: &Format,
        folder: &Path,
    ) -> Result<PathBuf> {
        let blob = self.format_blob(name, format).await?;
        Ok(self.blobs.download(&blob, folder).await?)
    }

    /// Recompute the hash of a document's original bytes.
    pub async fn verify_integrity(&self, name: &HandleId) -> Result<bool> {
        let blob = self.format_blob(name, &Format::original()).await?;
        Ok(self.blobs.verify_integrity(&blob).await?)
    }

    pub async fn recycle_bin(&self) -> Result<Vec<RecycleEntry>> {
        let mut runner = self.recycle_bin.lock().await;
        runner.catch_up(self.repo.event_log().as_ref()).await?;
        Ok(runner.state().entries().cloned().collect())
    }

    /// Physically delete the blobs of descriptors deleted more than
    /// `retention` ago. Returns the number of blobs removed.
    pub async fn purge_recycle_bin(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let mut runner = self.recycle_bin.lock().await;
        runner.catch_up(self.repo.event_log().as_ref()).await?;

        let mut purged = 0;
        for entry in runner.state().expired(now, retention) {
            for blob in &entry.blob_ids {
                if self.blobs.delete(blob).await? {
                    purged += 1;
                }
            }
            runner.state_mut().remove(&entry.descriptor);
            info!(descriptor_id = %entry.descriptor, blobs = entry.blob_ids.len(), "Descriptor purged");
        }
        runner.save().await?;
        Ok(purged)
    }

    pub async fn save_checkpoints(&self) -> Result<()> {
        {
            let mut catalog = self.catalog.lock().await;
            catalog.catch_up(self.repo.event_log().as_ref()).await?;
            catalog.save().await?;
        }
        let mut recycle_bin = self.recycle_bin.lock().await;
        recycle_bin.catch_up(self.repo.event_log().as_ref()).await?;
        recycle_bin.save().await?;
        Ok(())
    }

    async fn discard_blob(&self, id: &BlobId) {
        if let Err(e) = self.blobs.delete(id).await {
            warn!(blob_id = %id, error = %e, "Failed to discard unreferenced blob");
        }
    }
}

async fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(StorageError::from)?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(StorageError::from)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
