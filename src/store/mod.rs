use async_trait::async_trait;
use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;

use crate::event::{EventCommand, StoredEvent};
use crate::types::{Aggregate, Position, SequenceNumber};

pub mod memory;
pub mod postgres;
mod subscription;

pub use subscription::{EventBroadcaster, EventSubscription, Notification};

/// Maximum internal attempts at regenerating positions/versions on a
/// duplicate-key error before surfacing a storage error.
pub(crate) const MAX_PUSH_RETRIES: u32 = 3;

/// Errors produced by event store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Sql error
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// Serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The aggregate moved past the expected version.
    #[error("concurrency conflict on {aggregate_id}: expected version {expected}, current {current}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: SequenceNumber,
        current: SequenceNumber,
    },
    /// Duplicate positions or versions persisted across every retry.
    #[error("push retries exhausted after {attempts} attempts")]
    PushRetriesExhausted { attempts: u32 },
}

/// Expected current version of one aggregate, for optimistic concurrency.
#[derive(Debug, Clone)]
pub struct ExpectedVersion {
    pub aggregate: Aggregate,
    pub version: SequenceNumber,
}

/// Conjunction of predicates over the event log.
///
/// Matching events are returned ordered by `(position, in_tx_order)`,
/// ascending unless `descending` is set.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct EventFilter {
    #[builder(default, setter(strip_option, into))]
    pub instance_id: Option<String>,
    #[builder(default)]
    pub aggregate_types: Vec<String>,
    #[builder(default)]
    pub aggregate_ids: Vec<String>,
    #[builder(default)]
    pub event_types: Vec<String>,
    #[builder(default, setter(strip_option, into))]
    pub owner: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub creator: Option<String>,
    #[builder(default, setter(strip_option))]
    pub created_after: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub created_before: Option<DateTime<Utc>>,
    /// Only events strictly after this position.
    #[builder(default, setter(strip_option))]
    pub position_after: Option<Position>,
    #[builder(default, setter(strip_option))]
    pub limit: Option<u32>,
    #[builder(default)]
    pub descending: bool,
}

impl EventFilter {
    /// Filter over the full history of one aggregate, ascending.
    pub fn for_aggregate(aggregate_type: &str, instance_id: &str, aggregate_id: &str) -> Self {
        Self::builder()
            .instance_id(instance_id)
            .aggregate_types(vec![aggregate_type.to_owned()])
            .aggregate_ids(vec![aggregate_id.to_owned()])
            .build()
    }

    /// True when the event satisfies every predicate of this filter.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(instance_id) = &self.instance_id {
            if &event.instance_id != instance_id {
                return false;
            }
        }
        if !self.aggregate_types.is_empty() && !self.aggregate_types.contains(&event.aggregate_type) {
            return false;
        }
        if !self.aggregate_ids.is_empty() && !self.aggregate_ids.contains(&event.aggregate_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(owner) = &self.owner {
            if &event.owner != owner {
                return false;
            }
        }
        if let Some(creator) = &self.creator {
            if &event.creator != creator {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if event.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if event.created_at > before {
                return false;
            }
        }
        if let Some(position) = self.position_after {
            if event.position <= position {
                return false;
            }
        }
        true
    }
}

/// A fold over stored events, fed by [`Eventstore::filter_to_reducer`].
pub trait Reducer: Send {
    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError>;
}

/// The durable append-only log of events.
///
/// Implementations must guarantee the ordering contract: a reader consuming
/// strictly by increasing `(position, in_tx_order)` and filtering by
/// `instance_id` sees events in commit order for that instance, with no gaps
/// once a position is durable.
#[async_trait]
pub trait Eventstore: Send + Sync {
    /// Persists the commands atomically: either all events are stored with
    /// contiguous positions, or none are. Versions are assigned `max + 1`
    /// per aggregate inside the transaction.
    async fn push(&self, commands: Vec<EventCommand>) -> Result<Vec<StoredEvent>, StoreError>;

    /// Like [`Eventstore::push`], but fails with
    /// [`StoreError::ConcurrencyConflict`] when any listed aggregate's
    /// current version differs from the expected one.
    async fn push_with_concurrency_check(
        &self,
        commands: Vec<EventCommand>,
        expected: Vec<ExpectedVersion>,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Returns the events matching the filter.
    async fn filter(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StoreError>;

    /// Streams matching events into the reducer, in order.
    async fn filter_to_reducer(&self, filter: &EventFilter, reducer: &mut dyn Reducer) -> Result<(), StoreError>;

    /// Position of the newest event, optionally scoped to one instance.
    /// [`Position::MIN`] when the log is empty.
    async fn latest_position(&self, instance_id: Option<&str>) -> Result<Position, StoreError>;

    /// Newest event matching the filter.
    async fn latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError>;

    /// Every instance id that has at least one event.
    async fn distinct_instance_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Best-effort notification of committed events. Consumers treat the
    /// subscription as a wake-up hint and fall back to polling.
    fn subscribe(&self) -> EventSubscription;

    /// Removes every event of the given tenant. The only supported delete.
    async fn purge_instance(&self, instance_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::Value;

    use crate::event::StoredEvent;
    use crate::types::Position;

    use super::EventFilter;

    fn event(instance_id: &str, aggregate_type: &str, event_type: &str) -> StoredEvent {
        StoredEvent {
            instance_id: instance_id.to_owned(),
            aggregate_type: aggregate_type.to_owned(),
            aggregate_id: "a1".to_owned(),
            aggregate_version: 1,
            event_type: event_type.to_owned(),
            revision: 1,
            position: Position::new(Decimal::ONE, 0),
            creator: "system".to_owned(),
            owner: "a1".to_owned(),
            created_at: Utc::now(),
            payload: Value::Null,
        }
    }

    #[test]
    fn filter_matches_conjunction() {
        let filter = EventFilter::builder()
            .instance_id("inst1")
            .aggregate_types(vec!["org".to_owned()])
            .event_types(vec!["org.added".to_owned()])
            .build();

        assert!(filter.matches(&event("inst1", "org", "org.added")));
        assert!(!filter.matches(&event("inst2", "org", "org.added")));
        assert!(!filter.matches(&event("inst1", "user", "org.added")));
        assert!(!filter.matches(&event("inst1", "org", "org.changed")));
    }

    #[test]
    fn filter_position_after_is_strict() {
        let filter = EventFilter::builder()
            .position_after(Position::new(Decimal::ONE, 0))
            .build();

        assert!(!filter.matches(&event("inst1", "org", "org.added")));

        let mut later = event("inst1", "org", "org.added");
        later.position = Position::new(Decimal::ONE, 1);
        assert!(filter.matches(&later));
    }
}
