use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::types::{Aggregate, Position, SequenceNumber};

/// Creator recorded on events that are not attributable to a user.
pub const CREATOR_SYSTEM: &str = "system";

/// An event to be pushed to the store.
///
/// Carries everything but the fields the store assigns on commit
/// (`aggregate_version`, `position`, `created_at`).
#[derive(Debug, Clone)]
pub struct EventCommand {
    pub aggregate: Aggregate,
    pub event_type: String,
    pub revision: i16,
    pub creator: String,
    pub payload: Option<Value>,
}

impl EventCommand {
    pub fn new(aggregate: Aggregate, event_type: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            revision: 1,
            creator: creator.into(),
            payload: None,
        }
    }

    pub fn with_revision(mut self, revision: i16) -> Self {
        self.revision = revision;
        self
    }

    /// Attaches a serialized payload conforming to the
    /// `(event_type, revision)` contract.
    pub fn with_payload<P: Serialize>(mut self, payload: &P) -> Result<Self, Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }
}

/// An event as recorded in the store. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub instance_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub aggregate_version: SequenceNumber,
    pub event_type: String,
    pub revision: i16,
    pub position: Position,
    pub creator: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

impl StoredEvent {
    /// Deserializes the payload into the typed contract of the event type.
    pub fn payload_as<P: DeserializeOwned>(&self) -> serde_json::Result<P> {
        serde_json::from_value(self.payload.clone())
    }

    /// True when this event belongs to the given aggregate.
    pub fn belongs_to(&self, aggregate: &Aggregate) -> bool {
        self.instance_id == aggregate.instance_id
            && self.aggregate_type == aggregate.type_
            && self.aggregate_id == aggregate.id
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::types::Aggregate;

    use super::EventCommand;

    #[derive(Serialize, Deserialize)]
    struct NameChanged {
        name: String,
    }

    #[test]
    fn event_command_serializes_payload() {
        let aggregate = Aggregate::new("inst1", "org", "org1", "org1");
        let command = EventCommand::new(aggregate, "org.changed", "user1")
            .with_payload(&NameChanged {
                name: "Acme".to_owned(),
            })
            .unwrap();

        assert_eq!(command.revision, 1);
        assert_eq!(command.payload.unwrap()["name"], "Acme");
    }
}
