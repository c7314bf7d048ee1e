use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use common::storage::ContentHash;
use common::{BlobId, DescriptorId};
use serde::{Deserialize, Serialize};

use super::Projection;
use crate::domain::aggregate::decode_event;
use crate::domain::{ContentDescriptor, DescriptorEvent};
use crate::eventlog::RecordedEvent;

/// A deleted descriptor whose blobs await reclamation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecycleEntry {
    pub descriptor: DescriptorId,
    pub hash: Option<ContentHash>,
    pub blob_ids: Vec<BlobId>,
    pub deleted_at: DateTime<Utc>,
}

/// Soft-deleted descriptors, kept for the retention window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecycleBin {
    entries: BTreeMap<DescriptorId, RecycleEntry>,
}

impl RecycleBin {
    pub fn get(&self, descriptor: &DescriptorId) -> Option<&RecycleEntry> {
        self.entries.get(descriptor)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RecycleEntry> {
        self.entries.values()
    }

    /// Entries deleted at least `retention` before `now`.
    pub fn expired(&self, now: DateTime<Utc>, retention: Duration) -> Vec<RecycleEntry> {
        self.entries
            .values()
            .filter(|entry| entry.deleted_at + retention <= now)
            .cloned()
            .collect()
    }

    /// Forget an entry once its blobs are gone.
    pub fn remove(&mut self, descriptor: &DescriptorId) -> Option<RecycleEntry> {
        self.entries.remove(descriptor)
    }
}

impl Projection for RecycleBin {
    const NAME: &'static str = "recycle_bin";

    fn apply(&mut self, event: &RecordedEvent) {
        if let Some(DescriptorEvent::Deleted { hash, blob_ids }) =
            decode_event::<ContentDescriptor>(event)
        {
            let descriptor = DescriptorId::from(event.stream.aggregate_id.as_str());
            self.entries.insert(
                descriptor.clone(),
                RecycleEntry {
                    descriptor,
                    hash,
                    blob_ids,
                    deleted_at: event.recorded_at,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::eventlog::{EventMetadata, StreamId};

    fn deleted_event(id: &str, at: DateTime<Utc>) -> RecordedEvent {
        RecordedEvent {
            position: 1,
            stream: StreamId::new("descriptor", id),
            version: 3,
            event_type: "Deleted".into(),
            data: json!({ "hash": null, "blob_ids": ["original.1", "pdf.1"] }),
            metadata: EventMetadata::default(),
            recorded_at: at,
        }
    }

    #[test]
    fn records_deletion_manifest() {
        let mut bin = RecycleBin::default();
        let at = Utc::now();
        bin.apply(&deleted_event("d1", at));

        let entry = bin.get(&DescriptorId::from("d1")).unwrap();
        assert_eq!(
            entry.blob_ids,
            vec![BlobId::from("original.1"), BlobId::from("pdf.1")]
        );
        assert_eq!(entry.deleted_at, at);
    }

    #[test]
    fn ignores_other_aggregates() {
        let mut bin = RecycleBin::default();
        let mut event = deleted_event("doc1", Utc::now());
        event.stream = StreamId::new("handle", "doc1");
        bin.apply(&event);
        assert_eq!(bin.entries().count(), 0);
    }

    #[test]
    fn expiry_respects_retention() {
        let mut bin = RecycleBin::default();
        let now = Utc::now();
        bin.apply(&deleted_event("old", now - Duration::days(10)));
        bin.apply(&deleted_event("new", now - Duration::hours(1)));

        let expired = bin.expired(now, Duration::days(7));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].descriptor.as_str(), "old");

        bin.remove(&DescriptorId::from("old"));
        assert!(bin.expired(now, Duration::days(7)).is_empty());
    }
}
