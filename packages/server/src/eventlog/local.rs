use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{EventLog, EventLogError, ExpectedVersion, NewEvent, RecordedEvent, StreamId};

/// Event log held in memory, optionally backed by a JSON-lines file.
///
/// Appends are serialized by one async mutex; with a file attached, a batch
/// is written and synced before it becomes readable. A batch that fails
/// halfway is cut off the file again, so the next batch starts on a clean
/// line.
pub struct LocalEventLog {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    events: Vec<RecordedEvent>,
    streams: HashMap<StreamId, Vec<usize>>,
    journal: Option<Journal>,
}

struct Journal {
    file: fs::File,
    /// Bytes of acknowledged batches.
    len: u64,
    broken: bool,
}

impl Journal {
    async fn append(&mut self, body: &[u8]) -> Result<(), EventLogError> {
        if self.broken {
            return Err(EventLogError::Unavailable);
        }
        match write_synced(&mut self.file, body).await {
            Ok(()) => {
                self.len += body.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback().await {
                    error!(error = %rollback, "Failed to cut torn append, refusing further writes");
                    self.broken = true;
                }
                Err(e.into())
            }
        }
    }

    /// Drop whatever part of a failed batch reached the file.
    async fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len).await?;
        self.file.sync_data().await
    }
}

async fn write_synced(file: &mut fs::File, body: &[u8]) -> std::io::Result<()> {
    file.write_all(body).await?;
    file.flush().await?;
    file.sync_data().await
}

impl Inner {
    fn push(&mut self, event: RecordedEvent) {
        self.streams
            .entry(event.stream.clone())
            .or_default()
            .push(self.events.len());
        self.events.push(event);
    }

    fn version(&self, stream: &StreamId) -> u64 {
        self.streams.get(stream).map_or(0, |idx| idx.len() as u64)
    }
}

impl LocalEventLog {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open (or create) a log file and replay it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, EventLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut inner = Inner::default();
        let mut skipped = 0usize;
        let mut clean_tail = true;
        if fs::try_exists(&path).await? {
            let body = fs::read(&path).await?;
            clean_tail = body.last().is_none_or(|&b| b == b'\n');
            for line in body.split(|&b| b == b'\n') {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<RecordedEvent>(line) {
                    Ok(event) => {
                        let expected = inner.events.len() as u64 + 1;
                        if event.position != expected {
                            return Err(EventLogError::Corrupt {
                                found: event.position,
                                expected,
                            });
                        }
                        inner.push(event);
                    }
                    // Left behind by a crash in the middle of an append.
                    Err(e) => {
                        skipped += 1;
                        warn!(error = %e, "Skipping unreadable event record");
                    }
                }
            }
        }

        if skipped > 0 || !clean_tail {
            rewrite(&path, &inner.events).await?;
            info!(skipped, "Compacted event log");
        }

        info!(path = %path.display(), events = inner.events.len(), "Opened event log");
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();
        inner.journal = Some(Journal {
            file,
            len,
            broken: false,
        });
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

async fn rewrite(path: &Path, events: &[RecordedEvent]) -> Result<(), EventLogError> {
    let temp_path = path.with_extension("rewrite");
    let mut body = Vec::new();
    for event in events {
        body.extend(serde_json::to_vec(event)?);
        body.push(b'\n');
    }
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl EventLog for LocalEventLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError> {
        let mut inner = self.inner.lock().await;
        let current = inner.version(stream);
        if !expected.is_satisfied_by(current) {
            return Err(EventLogError::WrongExpectedVersion {
                stream: stream.clone(),
                expected,
                actual: current,
            });
        }
        if events.is_empty() {
            return Ok(current);
        }

        let now = Utc::now();
        let first_position = inner.events.len() as u64 + 1;
        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| RecordedEvent {
                position: first_position + i as u64,
                stream: stream.clone(),
                version: current + 1 + i as u64,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                recorded_at: now,
            })
            .collect();

        if let Some(journal) = inner.journal.as_mut() {
            let mut body = Vec::new();
            for event in &recorded {
                body.extend(serde_json::to_vec(event)?);
                body.push(b'\n');
            }
            journal.append(&body).await?;
        }

        let version = current + recorded.len() as u64;
        for event in recorded {
            inner.push(event);
        }
        Ok(version)
    }

    async fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, EventLogError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|idx| idx.iter().map(|&i| inner.events[i].clone()).collect())
            .unwrap_or_default())
    }

    async fn read_all(&self, after: u64, max: usize) -> Result<Vec<RecordedEvent>, EventLogError> {
        let inner = self.inner.lock().await;
        let start = (after as usize).min(inner.events.len());
        Ok(inner.events[start..].iter().take(max).cloned().collect())
    }

    async fn head(&self) -> Result<u64, EventLogError> {
        Ok(self.inner.lock().await.events.len() as u64)
    }
}
