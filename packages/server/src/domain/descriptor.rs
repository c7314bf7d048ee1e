//! Content descriptor aggregate: one unique binary content and the formats
//! derived from it.
//!
//! A descriptor is created on the first upload of a content hash. Handles
//! bind to it; when the last handle detaches, the descriptor deletes itself
//! and lists every blob it referenced so they can be reclaimed.

use std::collections::{BTreeMap, BTreeSet};

use common::storage::ContentHash;
use common::{BlobId, DescriptorId, FileName, Format, HandleId, PipelineId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Aggregate;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub initialized: bool,
    pub hash: Option<ContentHash>,
    /// Blob of the original upload.
    pub primary_blob: Option<BlobId>,
    pub file_name: Option<FileName>,
    pub formats: BTreeMap<Format, BlobId>,
    pub handles: BTreeSet<HandleId>,
    /// Redundant descriptors whose handles were folded into this one.
    pub merged: BTreeSet<DescriptorId>,
    pub deleted: bool,
}

impl ContentDescriptor {
    /// Every blob currently referenced, without duplicates.
    pub fn blob_ids(&self) -> Vec<BlobId> {
        self.formats
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn ensure_live(&self) -> Result<(), DescriptorError> {
        if self.deleted {
            return Err(DescriptorError::AlreadyDeleted);
        }
        if !self.initialized {
            return Err(DescriptorError::NotInitialized);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorCommand {
    Initialize {
        blob_id: BlobId,
        handle: HandleId,
        hash: ContentHash,
        file_name: FileName,
    },
    /// Register an artifact. A new format raises `FormatAdded`, a different
    /// blob under an existing format raises `FormatUpdated` (last writer
    /// wins). Re-adding the blob a format already maps to raises nothing,
    /// so a redelivered job result produces no stream row and no new jobs.
    AddFormat {
        format: Format,
        blob_id: BlobId,
        pipeline: PipelineId,
        /// Name of the produced artifact.
        file_name: FileName,
    },
    DeleteFormat {
        format: Format,
    },
    AttachHandle {
        handle: HandleId,
    },
    DetachHandle {
        handle: HandleId,
    },
    /// Take over `handle` from `duplicate`, a redundant descriptor of the
    /// same content.
    Deduplicate {
        duplicate: DescriptorId,
        handle: HandleId,
        file_name: FileName,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DescriptorEvent {
    Initialized {
        blob_id: BlobId,
        handle: HandleId,
        hash: ContentHash,
        file_name: FileName,
    },
    FormatAdded {
        format: Format,
        blob_id: BlobId,
        pipeline: PipelineId,
        file_name: FileName,
    },
    /// The format already existed; `previous` is now orphaned.
    FormatUpdated {
        format: Format,
        blob_id: BlobId,
        previous: BlobId,
        pipeline: PipelineId,
        file_name: FileName,
    },
    FormatDeleted {
        format: Format,
        blob_id: BlobId,
    },
    HandleAttached {
        handle: HandleId,
    },
    HandleDetached {
        handle: HandleId,
    },
    Deduplicated {
        duplicate: DescriptorId,
        handle: HandleId,
        file_name: FileName,
    },
    /// Raised when the last handle detaches.
    Deleted {
        hash: Option<ContentHash>,
        blob_ids: Vec<BlobId>,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor is already initialized")]
    AlreadyInitialized,

    #[error("descriptor is not initialized")]
    NotInitialized,

    #[error("descriptor has been deleted")]
    AlreadyDeleted,

    #[error("handle {0} is not bound to this descriptor")]
    InvalidHandle(HandleId),
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for ContentDescriptor {
    const AGGREGATE_TYPE: &'static str = "descriptor";
    type Command = DescriptorCommand;
    type DomainEvent = DescriptorEvent;
    type Error = DescriptorError;

    fn handle(&self, cmd: DescriptorCommand) -> Result<Vec<DescriptorEvent>, DescriptorError> {
        match cmd {
            DescriptorCommand::Initialize {
                blob_id,
                handle,
                hash,
                file_name,
            } => {
                if self.deleted {
                    return Err(DescriptorError::AlreadyDeleted);
                }
                if self.initialized {
                    return Err(DescriptorError::AlreadyInitialized);
                }

                let mut events = vec![DescriptorEvent::Initialized {
                    blob_id: blob_id.clone(),
                    handle,
                    hash,
                    file_name: file_name.clone(),
                }];
                if let Some(format) = Format::detect(&file_name) {
                    events.push(DescriptorEvent::FormatAdded {
                        format,
                        blob_id,
                        pipeline: PipelineId::original(),
                        file_name,
                    });
                }
                Ok(events)
            }

            DescriptorCommand::AddFormat {
                format,
                blob_id,
                pipeline,
                file_name,
            } => {
                self.ensure_live()?;
                match self.formats.get(&format) {
                    // Redelivered job result.
                    Some(current) if *current == blob_id => Ok(vec![]),
                    Some(current) => Ok(vec![DescriptorEvent::FormatUpdated {
                        format,
                        blob_id,
                        previous: current.clone(),
                        pipeline,
                        file_name,
                    }]),
                    None => Ok(vec![DescriptorEvent::FormatAdded {
                        format,
                        blob_id,
                        pipeline,
                        file_name,
                    }]),
                }
            }

            DescriptorCommand::DeleteFormat { format } => {
                self.ensure_live()?;
                Ok(self
                    .formats
                    .get(&format)
                    .map(|blob_id| DescriptorEvent::FormatDeleted {
                        format: format.clone(),
                        blob_id: blob_id.clone(),
                    })
                    .into_iter()
                    .collect())
            }

            DescriptorCommand::AttachHandle { handle } => {
                self.ensure_live()?;
                if self.handles.contains(&handle) {
                    return Ok(vec![]);
                }
                Ok(vec![DescriptorEvent::HandleAttached { handle }])
            }

            DescriptorCommand::DetachHandle { handle } => {
                self.ensure_live()?;
                if !self.handles.contains(&handle) {
                    return Err(DescriptorError::InvalidHandle(handle));
                }

                let mut events = vec![DescriptorEvent::HandleDetached {
                    handle: handle.clone(),
                }];
                if self.handles.len() == 1 {
                    events.push(DescriptorEvent::Deleted {
                        hash: self.hash,
                        blob_ids: self.blob_ids(),
                    });
                }
                Ok(events)
            }

            DescriptorCommand::Deduplicate {
                duplicate,
                handle,
                file_name,
            } => {
                self.ensure_live()?;
                let mut events = vec![DescriptorEvent::Deduplicated {
                    duplicate,
                    handle: handle.clone(),
                    file_name,
                }];
                if !self.handles.contains(&handle) {
                    events.push(DescriptorEvent::HandleAttached { handle });
                }
                Ok(events)
            }
        }
    }

    fn apply(mut self, event: &DescriptorEvent) -> Self {
        match event {
            DescriptorEvent::Initialized {
                blob_id,
                handle,
                hash,
                file_name,
            } => {
                self.initialized = true;
                self.hash = Some(*hash);
                self.primary_blob = Some(blob_id.clone());
                self.file_name = Some(file_name.clone());
                self.formats.insert(Format::original(), blob_id.clone());
                self.handles.insert(handle.clone());
            }
            DescriptorEvent::FormatAdded {
                format, blob_id, ..
            }
            | DescriptorEvent::FormatUpdated {
                format, blob_id, ..
            } => {
                self.formats.insert(format.clone(), blob_id.clone());
            }
            DescriptorEvent::FormatDeleted { format, .. } => {
                self.formats.remove(format);
            }
            DescriptorEvent::HandleAttached { handle } => {
                self.handles.insert(handle.clone());
            }
            DescriptorEvent::HandleDetached { handle } => {
                self.handles.remove(handle);
            }
            DescriptorEvent::Deduplicated { duplicate, .. } => {
                self.merged.insert(duplicate.clone());
            }
            DescriptorEvent::Deleted { .. } => {
                self.deleted = true;
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
