use serde::de::DeserializeOwned;
use serde::{Serialize, ser::Error as _};

use super::command::CommandContext;
use crate::eventlog::{EventMetadata, NewEvent, RecordedEvent};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself is the state. [`handle`](Aggregate::handle)
/// is a pure decision function: it validates a command against the current
/// state and returns zero or more events, or rejects the command.
/// [`apply`](Aggregate::apply) folds one event into the next state and must
/// never fail.
pub trait Aggregate:
    Default + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stream type name (e.g. "descriptor").
    const AGGREGATE_TYPE: &'static str;

    /// Commands are retried on version conflicts, so they must be cloneable.
    type Command: Clone + std::fmt::Debug + Send + 'static;

    /// Adjacently tagged (`type` + `data`) event enum.
    type DomainEvent: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static;

    type Error: std::error::Error + Send + Sync + 'static;

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Fold a whole history into a state.
    fn replay<'a>(events: impl IntoIterator<Item = &'a Self::DomainEvent>) -> Self {
        events
            .into_iter()
            .fold(Self::default(), |state, event| state.apply(event))
    }
}

/// Turn a domain event into a log record.
pub fn encode_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
) -> serde_json::Result<NewEvent> {
    let value = serde_json::to_value(event)?;
    let Some(obj) = value.as_object() else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to a tagged object",
        ));
    };
    let Some(event_type) = obj.get("type").and_then(|t| t.as_str()) else {
        return Err(serde_json::Error::custom(
            "domain event is missing its type tag",
        ));
    };

    Ok(NewEvent {
        event_type: event_type.to_string(),
        data: obj.get("data").cloned().unwrap_or(serde_json::Value::Null),
        metadata: EventMetadata {
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
        },
    })
}

/// Interpret a log record as an event of `A`.
///
/// Records of other aggregate types, and unknown event types, yield `None`.
pub fn decode_event<A: Aggregate>(record: &RecordedEvent) -> Option<A::DomainEvent> {
    if record.stream.aggregate_type != A::AGGREGATE_TYPE {
        return None;
    }
    let tagged = if record.data.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({ "type": record.event_type, "data": record.data })
    };
    serde_json::from_value(tagged).ok()
}
