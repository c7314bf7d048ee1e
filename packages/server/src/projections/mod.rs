//! Read models folded from the global event log.

pub mod catalog;
pub mod recycle_bin;
pub mod stream;

pub use catalog::{DescriptorEntry, DocumentCatalog, HandleEntry};
pub use recycle_bin::{RecycleBin, RecycleEntry};
pub use stream::{StreamProjection, StreamRow};

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::eventlog::{EventLog, EventLogError, RecordedEvent};

/// A read model built from every stream of the log.
///
/// `apply` must be deterministic and ignore events it does not know about.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Checkpoint file name.
    const NAME: &'static str;

    fn apply(&mut self, event: &RecordedEvent);
}

/// Serialized as `{ "state": ..., "position": N }` where `N` is the last
/// applied log position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Checkpoint<P> {
    state: P,
    position: u64,
}

/// Keeps one projection caught up with the log.
pub struct ProjectionRunner<P: Projection> {
    checkpoint: Checkpoint<P>,
    path: Option<PathBuf>,
    batch_size: usize,
}

impl<P: Projection> ProjectionRunner<P> {
    pub fn in_memory() -> Self {
        Self {
            checkpoint: Checkpoint::default(),
            path: None,
            batch_size: 500,
        }
    }

    /// Resume from `{dir}/{NAME}.json`. A corrupt checkpoint is rebuilt from
    /// the start of the log instead of failing.
    pub async fn open(dir: &Path) -> Result<Self, EventLogError> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", P::NAME));

        let checkpoint = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(projection = P::NAME, error = %e, "Corrupt checkpoint, rebuilding");
                    Checkpoint::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Checkpoint::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            checkpoint,
            path: Some(path),
            batch_size: 500,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn state(&self) -> &P {
        &self.checkpoint.state
    }

    pub fn state_mut(&mut self) -> &mut P {
        &mut self.checkpoint.state
    }

    pub fn position(&self) -> u64 {
        self.checkpoint.position
    }

    /// Apply every event past the current position. Returns how many were
    /// read.
    pub async fn catch_up(&mut self, log: &dyn EventLog) -> Result<usize, EventLogError> {
        let mut applied = 0;
        loop {
            let batch = log
                .read_all(self.checkpoint.position, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                if event.position <= self.checkpoint.position {
                    continue;
                }
                self.checkpoint.state.apply(event);
                self.checkpoint.position = event.position;
                applied += 1;
            }
            if batch.len() < self.batch_size {
                break;
            }
        }
        if applied > 0 {
            debug!(projection = P::NAME, applied, position = self.checkpoint.position, "Projection caught up");
        }
        Ok(applied)
    }

    /// Persist the checkpoint. No-op for in-memory runners.
    pub async fn save(&self) -> Result<(), EventLogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_vec(&self.checkpoint)?).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::eventlog::{EventMetadata, ExpectedVersion, LocalEventLog, NewEvent, StreamId};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        seen: Vec<u64>,
    }

    impl Projection for Counter {
        const NAME: &'static str = "counter";

        fn apply(&mut self, event: &RecordedEvent) {
            self.seen.push(event.position);
        }
    }

    async fn append(log: &LocalEventLog, n: usize) {
        for _ in 0..n {
            log.append(
                &StreamId::new("test", "a"),
                ExpectedVersion::Any,
                vec![NewEvent {
                    event_type: "Ticked".into(),
                    data: json!({}),
                    metadata: EventMetadata::default(),
                }],
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn catch_up_pages_through_log() {
        let log = LocalEventLog::in_memory();
        append(&log, 7).await;

        let mut runner = ProjectionRunner::<Counter>::in_memory().with_batch_size(3);
        assert_eq!(runner.catch_up(&log).await.unwrap(), 7);
        assert_eq!(runner.position(), 7);
        assert_eq!(runner.state().seen, (1..=7).collect::<Vec<_>>());

        append(&log, 1).await;
        assert_eq!(runner.catch_up(&log).await.unwrap(), 1);
        assert_eq!(runner.catch_up(&log).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let log = LocalEventLog::in_memory();
        append(&log, 3).await;

        let mut runner = ProjectionRunner::<Counter>::open(dir.path()).await.unwrap();
        runner.catch_up(&log).await.unwrap();
        runner.save().await.unwrap();

        append(&log, 2).await;
        let mut runner = ProjectionRunner::<Counter>::open(dir.path()).await.unwrap();
        assert_eq!(runner.position(), 3);
        assert_eq!(runner.catch_up(&log).await.unwrap(), 2);
        assert_eq!(runner.state().seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("counter.json"), b"{not json").unwrap();
        let log = LocalEventLog::in_memory();
        append(&log, 2).await;

        let mut runner = ProjectionRunner::<Counter>::open(dir.path()).await.unwrap();
        assert_eq!(runner.position(), 0);
        assert_eq!(runner.catch_up(&log).await.unwrap(), 2);
    }
}
