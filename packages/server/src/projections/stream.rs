use common::{BlobId, DescriptorId, FileName, Format, PipelineId};
use serde::{Deserialize, Serialize};

use super::Projection;
use crate::domain::aggregate::decode_event;
use crate::domain::{ContentDescriptor, DescriptorEvent};
use crate::eventlog::RecordedEvent;

/// "A new artifact is available": one row per format registered on a
/// descriptor. Rows are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRow {
    /// Log position of the fact that produced the row.
    pub id: u64,
    pub descriptor_id: DescriptorId,
    pub format: Format,
    pub blob_id: BlobId,
    pub pipeline: PipelineId,
    /// Lowercase extension of the artifact's file name.
    pub file_extension: String,
}

/// Buffers stream rows until the router has taken them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamProjection {
    pending: Vec<StreamRow>,
    /// Original blob of the descriptor initialized by the previous event.
    /// The format detected at initialization is appended right after it
    /// and points at the same bytes, so it gets no row of its own.
    #[serde(default)]
    initialized: Option<(DescriptorId, BlobId)>,
}

impl StreamProjection {
    pub fn pending(&self) -> &[StreamRow] {
        &self.pending
    }

    /// Drop the first `count` pending rows once they are routed.
    pub fn acknowledge(&mut self, count: usize) {
        let count = count.min(self.pending.len());
        self.pending.drain(..count);
    }

    fn push(
        &mut self,
        event: &RecordedEvent,
        format: &Format,
        blob_id: &BlobId,
        pipeline: PipelineId,
        file_name: &FileName,
    ) {
        self.pending.push(StreamRow {
            id: event.position,
            descriptor_id: DescriptorId::from(event.stream.aggregate_id.as_str()),
            format: format.clone(),
            blob_id: blob_id.clone(),
            pipeline,
            file_extension: file_name.extension(),
        });
    }
}

impl Projection for StreamProjection {
    const NAME: &'static str = "stream";

    fn apply(&mut self, event: &RecordedEvent) {
        let Some(domain_event) = decode_event::<ContentDescriptor>(event) else {
            return;
        };
        let descriptor = DescriptorId::from(event.stream.aggregate_id.as_str());
        let initialized = self.initialized.take();
        match &domain_event {
            DescriptorEvent::Initialized {
                blob_id, file_name, ..
            } => {
                self.push(
                    event,
                    &Format::original(),
                    blob_id,
                    PipelineId::original(),
                    file_name,
                );
                self.initialized = Some((descriptor, blob_id.clone()));
            }
            DescriptorEvent::FormatAdded { blob_id, .. }
                if initialized
                    .as_ref()
                    .is_some_and(|(id, primary)| *id == descriptor && primary == blob_id) => {}
            DescriptorEvent::FormatAdded {
                format,
                blob_id,
                pipeline,
                file_name,
            }
            | DescriptorEvent::FormatUpdated {
                format,
                blob_id,
                pipeline,
                file_name,
                ..
            } => self.push(event, format, blob_id, pipeline.clone(), file_name),
            _ => {}
        }
    }
}
