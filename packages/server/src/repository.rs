use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::Aggregate;
use crate::domain::CommandContext;
use crate::domain::aggregate::{decode_event, encode_event};
use crate::eventlog::{EventLog, EventLogError, ExpectedVersion, StreamId};

/// Attempts made before a contended command gives up.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by the aggregate.
    #[error(transparent)]
    Domain(E),

    /// Every attempt lost the race against a concurrent writer.
    #[error("Concurrency conflict on {stream} after {attempts} attempts")]
    Conflict { stream: StreamId, attempts: u32 },

    #[error(transparent)]
    EventLog(EventLogError),
}

/// Result of a successfully executed command.
#[derive(Debug, Clone)]
pub struct Executed<A: Aggregate> {
    pub state: A,
    /// Events produced by the command; empty for a no-op.
    pub events: Vec<A::DomainEvent>,
    pub version: u64,
}

/// Loads aggregates from the event log and appends the events their
/// commands produce, with optimistic concurrency.
#[derive(Clone)]
pub struct Repository {
    log: Arc<dyn EventLog>,
}

impl Repository {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Rebuild an aggregate from its stream. Returns the default state at
    /// version 0 when the stream does not exist.
    pub async fn load<A: Aggregate>(&self, id: &str) -> Result<(A, u64), EventLogError> {
        let stream = StreamId::new(A::AGGREGATE_TYPE, id);
        let records = self.log.read_stream(&stream).await?;
        let version = records.last().map_or(0, |r| r.version);
        let events: Vec<A::DomainEvent> = records
            .iter()
            .filter_map(|record| {
                let event = decode_event::<A>(record);
                if event.is_none() {
                    warn!(stream = %stream, version = record.version, event_type = %record.event_type, "Skipping undecodable event");
                }
                event
            })
            .collect();
        Ok((A::replay(&events), version))
    }

    /// Decide and append. A concurrent append to the same stream between
    /// load and append makes the command re-run against the newer state.
    pub async fn execute<A: Aggregate>(
        &self,
        id: &str,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        let stream = StreamId::new(A::AGGREGATE_TYPE, id);

        for attempt in 1..=MAX_ATTEMPTS {
            let (state, version) = self.load::<A>(id).await.map_err(ExecuteError::EventLog)?;
            let events = state.handle(cmd.clone()).map_err(ExecuteError::Domain)?;
            if events.is_empty() {
                return Ok(Executed {
                    state,
                    events,
                    version,
                });
            }

            let records = events
                .iter()
                .map(|event| encode_event::<A>(event, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ExecuteError::EventLog(e.into()))?;

            match self
                .log
                .append(&stream, ExpectedVersion::from_version(version), records)
                .await
            {
                Ok(version) => {
                    debug!(stream = %stream, version, count = events.len(), "Events appended");
                    let state = events.iter().fold(state, |s, e| s.apply(e));
                    return Ok(Executed {
                        state,
                        events,
                        version,
                    });
                }
                Err(EventLogError::WrongExpectedVersion { actual, .. }) => {
                    debug!(stream = %stream, attempt, expected = version, actual, "Version conflict, retrying");
                }
                Err(e) => return Err(ExecuteError::EventLog(e)),
            }
        }

        Err(ExecuteError::Conflict {
            stream,
            attempts: MAX_ATTEMPTS,
        })
    }
}
