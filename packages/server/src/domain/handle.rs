//! Handle aggregate: a logical, user-facing document name bound to one
//! content descriptor.

use std::collections::{BTreeMap, BTreeSet};

use common::{BlobId, DescriptorId, FileName, Format, HandleId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::Aggregate;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handle {
    pub created: bool,
    pub deleted: bool,
    pub descriptor: Option<DescriptorId>,
    pub file_name: Option<FileName>,
    /// Names resolving to this handle, its own name included.
    pub aliases: BTreeSet<HandleId>,
    pub formats: BTreeMap<Format, BlobId>,
    /// Child handles uploaded as enrichments of this one.
    pub attachments: BTreeSet<HandleId>,
    pub attached_to: Option<HandleId>,
    pub custom_data: BTreeMap<String, Value>,
}

impl Handle {
    pub fn is_live(&self) -> bool {
        self.created && !self.deleted
    }

    fn ensure_live(&self) -> Result<(), HandleError> {
        if self.deleted {
            return Err(HandleError::AlreadyDeleted);
        }
        if !self.created {
            return Err(HandleError::NotCreated);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum HandleCommand {
    Create {
        handle: HandleId,
        descriptor: DescriptorId,
        file_name: FileName,
        formats: BTreeMap<Format, BlobId>,
        custom_data: BTreeMap<String, Value>,
        attached_to: Option<HandleId>,
    },
    /// Rebind the handle to another descriptor (re-upload, or duplicate
    /// resolution).
    LinkDescriptor {
        descriptor: DescriptorId,
        file_name: FileName,
        formats: BTreeMap<Format, BlobId>,
    },
    /// Mirror a descriptor format. Like the descriptor, re-adding the blob
    /// a format already maps to is a no-op rather than an update.
    AddFormat {
        format: Format,
        blob_id: BlobId,
    },
    DeleteFormat {
        format: Format,
    },
    AddAttachment {
        child: HandleId,
    },
    RemoveAttachment {
        child: HandleId,
    },
    SetCustomData {
        data: BTreeMap<String, Value>,
    },
    /// `None` deletes the handle outright; `Some(alias)` detaches one alias.
    Delete {
        alias: Option<HandleId>,
    },
    /// Fold handle `other` into this one, registering `alias` as a name.
    DeduplicateOnto {
        other: HandleId,
        alias: HandleId,
        file_name: FileName,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HandleEvent {
    Created {
        handle: HandleId,
        descriptor: DescriptorId,
        file_name: FileName,
        formats: BTreeMap<Format, BlobId>,
        #[serde(default)]
        custom_data: BTreeMap<String, Value>,
        #[serde(default)]
        attached_to: Option<HandleId>,
    },
    DescriptorLinked {
        descriptor: DescriptorId,
        previous: Option<DescriptorId>,
        file_name: FileName,
        formats: BTreeMap<Format, BlobId>,
    },
    FormatAdded {
        format: Format,
        blob_id: BlobId,
    },
    FormatUpdated {
        format: Format,
        blob_id: BlobId,
    },
    FormatDeleted {
        format: Format,
    },
    AttachmentAdded {
        child: HandleId,
    },
    AttachmentRemoved {
        child: HandleId,
    },
    CustomDataSet {
        data: BTreeMap<String, Value>,
    },
    AliasAttached {
        alias: HandleId,
        file_name: FileName,
    },
    AliasDetached {
        alias: HandleId,
    },
    Deduplicated {
        other: HandleId,
    },
    /// Terminal fact carrying what read models need to clean up.
    Deleted {
        descriptor: Option<DescriptorId>,
        formats: BTreeMap<Format, BlobId>,
        attachments: Vec<HandleId>,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("handle already exists")]
    AlreadyCreated,

    #[error("handle does not exist")]
    NotCreated,

    #[error("handle has been deleted")]
    AlreadyDeleted,

    #[error("\"{0}\" is not an alias of this handle")]
    InvalidHandle(HandleId),
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

impl Aggregate for Handle {
    const AGGREGATE_TYPE: &'static str = "handle";
    type Command = HandleCommand;
    type DomainEvent = HandleEvent;
    type Error = HandleError;

    fn handle(&self, cmd: HandleCommand) -> Result<Vec<HandleEvent>, HandleError> {
        match cmd {
            HandleCommand::Create {
                handle,
                descriptor,
                file_name,
                formats,
                custom_data,
                attached_to,
            } => {
                // A deleted name may be reused by a later upload.
                if self.is_live() {
                    return Err(HandleError::AlreadyCreated);
                }
                if !handle.is_valid() {
                    return Err(HandleError::InvalidHandle(handle));
                }
                Ok(vec![HandleEvent::Created {
                    handle,
                    descriptor,
                    file_name,
                    formats,
                    custom_data,
                    attached_to,
                }])
            }

            HandleCommand::LinkDescriptor {
                descriptor,
                file_name,
                formats,
            } => {
                self.ensure_live()?;
                if self.descriptor.as_ref() == Some(&descriptor)
                    && self.file_name.as_ref() == Some(&file_name)
                    && self.formats == formats
                {
                    return Ok(vec![]);
                }
                Ok(vec![HandleEvent::DescriptorLinked {
                    descriptor,
                    previous: self.descriptor.clone(),
                    file_name,
                    formats,
                }])
            }

            HandleCommand::AddFormat { format, blob_id } => {
                self.ensure_live()?;
                match self.formats.get(&format) {
                    Some(current) if *current == blob_id => Ok(vec![]),
                    Some(_) => Ok(vec![HandleEvent::FormatUpdated { format, blob_id }]),
                    None => Ok(vec![HandleEvent::FormatAdded { format, blob_id }]),
                }
            }

            HandleCommand::DeleteFormat { format } => {
                self.ensure_live()?;
                if !self.formats.contains_key(&format) {
                    return Ok(vec![]);
                }
                Ok(vec![HandleEvent::FormatDeleted { format }])
            }

            HandleCommand::AddAttachment { child } => {
                self.ensure_live()?;
                if self.attachments.contains(&child) {
                    return Ok(vec![]);
                }
                Ok(vec![HandleEvent::AttachmentAdded { child }])
            }

            HandleCommand::RemoveAttachment { child } => {
                self.ensure_live()?;
                if !self.attachments.contains(&child) {
                    return Ok(vec![]);
                }
                Ok(vec![HandleEvent::AttachmentRemoved { child }])
            }

            HandleCommand::SetCustomData { data } => {
                self.ensure_live()?;
                if self.custom_data == data {
                    return Ok(vec![]);
                }
                Ok(vec![HandleEvent::CustomDataSet { data }])
            }

            HandleCommand::Delete { alias } => {
                self.ensure_live()?;
                let deleted = HandleEvent::Deleted {
                    descriptor: self.descriptor.clone(),
                    formats: self.formats.clone(),
                    attachments: self.attachments.iter().cloned().collect(),
                };

                let Some(alias) = alias else {
                    return Ok(vec![deleted]);
                };
                if !self.aliases.contains(&alias) {
                    return Err(HandleError::InvalidHandle(alias));
                }
                let mut events = vec![HandleEvent::AliasDetached { alias }];
                if self.aliases.len() == 1 {
                    events.push(deleted);
                }
                Ok(events)
            }

            HandleCommand::DeduplicateOnto {
                other,
                alias,
                file_name,
            } => {
                self.ensure_live()?;
                if !alias.is_valid() {
                    return Err(HandleError::InvalidHandle(alias));
                }
                if self.aliases.contains(&alias) {
                    return Ok(vec![]);
                }
                Ok(vec![
                    HandleEvent::AliasAttached { alias, file_name },
                    HandleEvent::Deduplicated { other },
                ])
            }
        }
    }

    fn apply(mut self, event: &HandleEvent) -> Self {
        match event {
            HandleEvent::Created {
                handle,
                descriptor,
                file_name,
                formats,
                custom_data,
                attached_to,
            } => {
                self = Handle {
                    created: true,
                    deleted: false,
                    descriptor: Some(descriptor.clone()),
                    file_name: Some(file_name.clone()),
                    aliases: BTreeSet::from([handle.clone()]),
                    formats: formats.clone(),
                    attachments: BTreeSet::new(),
                    attached_to: attached_to.clone(),
                    custom_data: custom_data.clone(),
                };
            }
            HandleEvent::DescriptorLinked {
                descriptor,
                file_name,
                formats,
                ..
            } => {
                self.descriptor = Some(descriptor.clone());
                self.file_name = Some(file_name.clone());
                self.formats = formats.clone();
            }
            HandleEvent::FormatAdded { format, blob_id }
            | HandleEvent::FormatUpdated { format, blob_id } => {
                self.formats.insert(format.clone(), blob_id.clone());
            }
            HandleEvent::FormatDeleted { format } => {
                self.formats.remove(format);
            }
            HandleEvent::AttachmentAdded { child } => {
                self.attachments.insert(child.clone());
            }
            HandleEvent::AttachmentRemoved { child } => {
                self.attachments.remove(child);
            }
            HandleEvent::CustomDataSet { data } => {
                self.custom_data = data.clone();
            }
            HandleEvent::AliasAttached { alias, .. } => {
                self.aliases.insert(alias.clone());
            }
            HandleEvent::AliasDetached { alias } => {
                self.aliases.remove(alias);
            }
            HandleEvent::Deduplicated { .. } => {}
            HandleEvent::Deleted { .. } => {
                self.deleted = true;
                self.aliases.clear();
                self.attachments.clear();
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
