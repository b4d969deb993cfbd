//! In-memory [`Eventstore`] used by hermetic tests and local tooling.
//!
//! Mirrors the Postgres semantics: per-aggregate contiguous versions, one
//! global position per push with `in_tx_order` disambiguation, atomic
//! batches, and post-commit subscription notifications.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::event::{EventCommand, StoredEvent};
use crate::types::{Position, SequenceNumber};

use super::{EventBroadcaster, EventFilter, EventSubscription, Eventstore, ExpectedVersion, Reducer, StoreError};

#[derive(Default)]
struct Log {
    events: Vec<StoredEvent>,
    next_global: i64,
}

impl Log {
    fn current_version(&self, instance_id: &str, aggregate_type: &str, aggregate_id: &str) -> SequenceNumber {
        self.events
            .iter()
            .filter(|e| {
                e.instance_id == instance_id && e.aggregate_type == aggregate_type && e.aggregate_id == aggregate_id
            })
            .map(|e| e.aggregate_version)
            .max()
            .unwrap_or(0)
    }
}

/// Non-durable event store backed by a `Vec`.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Log>>,
    broadcaster: EventBroadcaster,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_locked(
        &self,
        commands: Vec<EventCommand>,
        expected: &[ExpectedVersion],
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut log = self.log.lock().expect("event log poisoned");

        for check in expected {
            let current = log.current_version(
                &check.aggregate.instance_id,
                &check.aggregate.type_,
                &check.aggregate.id,
            );
            if current != check.version {
                return Err(StoreError::ConcurrencyConflict {
                    aggregate_id: check.aggregate.id.clone(),
                    expected: check.version,
                    current,
                });
            }
        }

        log.next_global += 1;
        let global = Decimal::from(log.next_global);
        let created_at = Utc::now();

        let mut batch = Vec::with_capacity(commands.len());
        for (in_tx_order, command) in commands.into_iter().enumerate() {
            let version = log.current_version(
                &command.aggregate.instance_id,
                &command.aggregate.type_,
                &command.aggregate.id,
            ) + batch
                .iter()
                .filter(|e: &&StoredEvent| e.belongs_to(&command.aggregate))
                .count() as SequenceNumber
                + 1;

            batch.push(StoredEvent {
                instance_id: command.aggregate.instance_id,
                aggregate_type: command.aggregate.type_,
                aggregate_id: command.aggregate.id,
                aggregate_version: version,
                event_type: command.event_type,
                revision: command.revision,
                position: Position::new(global, in_tx_order as i32),
                creator: command.creator,
                owner: command.aggregate.resource_owner,
                created_at,
                payload: command.payload.unwrap_or(serde_json::Value::Null),
            });
        }

        log.events.extend(batch.iter().cloned());
        Ok(batch)
    }

    fn matching(&self, filter: &EventFilter) -> Vec<StoredEvent> {
        let log = self.log.lock().expect("event log poisoned");
        let mut events: Vec<StoredEvent> = log.events.iter().filter(|e| filter.matches(e)).cloned().collect();
        events.sort_by(|a, b| a.position.cmp(&b.position));
        if filter.descending {
            events.reverse();
        }
        if let Some(limit) = filter.limit {
            events.truncate(limit as usize);
        }
        events
    }
}

#[async_trait]
impl Eventstore for InMemoryEventStore {
    async fn push(&self, commands: Vec<EventCommand>) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self.push_locked(commands, &[])?;
        self.broadcaster.publish(&events);
        Ok(events)
    }

    async fn push_with_concurrency_check(
        &self,
        commands: Vec<EventCommand>,
        expected: Vec<ExpectedVersion>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self.push_locked(commands, &expected)?;
        self.broadcaster.publish(&events);
        Ok(events)
    }

    async fn filter(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StoreError> {
        Ok(self.matching(filter))
    }

    async fn filter_to_reducer(&self, filter: &EventFilter, reducer: &mut dyn Reducer) -> Result<(), StoreError> {
        for event in self.matching(filter) {
            reducer.reduce(&event)?;
        }
        Ok(())
    }

    async fn latest_position(&self, instance_id: Option<&str>) -> Result<Position, StoreError> {
        let log = self.log.lock().expect("event log poisoned");
        Ok(log
            .events
            .iter()
            .filter(|e| instance_id.map_or(true, |id| e.instance_id == id))
            .map(|e| e.position)
            .max()
            .unwrap_or(Position::MIN))
    }

    async fn latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.matching(filter).into_iter().last())
    }

    async fn distinct_instance_ids(&self) -> Result<Vec<String>, StoreError> {
        let log = self.log.lock().expect("event log poisoned");
        let ids: BTreeSet<String> = log.events.iter().map(|e| e.instance_id.clone()).collect();
        Ok(ids.into_iter().collect())
    }

    fn subscribe(&self) -> EventSubscription {
        self.broadcaster.subscribe()
    }

    async fn purge_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        let mut log = self.log.lock().expect("event log poisoned");
        log.events.retain(|e| e.instance_id != instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::event::EventCommand;
    use crate::store::{EventFilter, Eventstore, ExpectedVersion, StoreError};
    use crate::types::Aggregate;

    use super::InMemoryEventStore;

    fn org_command(instance_id: &str, org_id: &str, event_type: &str) -> EventCommand {
        EventCommand::new(
            Aggregate::new(instance_id, "org", org_id, org_id),
            event_type,
            "system",
        )
    }

    #[tokio::test]
    async fn versions_are_contiguous_per_aggregate() {
        let store = InMemoryEventStore::new();

        store
            .push(vec![
                org_command("inst1", "org1", "org.added"),
                org_command("inst1", "org1", "org.domain.added"),
            ])
            .await
            .unwrap();
        let events = store
            .push(vec![org_command("inst1", "org1", "org.domain.verified")])
            .await
            .unwrap();

        assert_eq!(events[0].aggregate_version, 3);

        let all = store
            .filter(&EventFilter::for_aggregate("org", "inst1", "org1"))
            .await
            .unwrap();
        let versions: Vec<i64> = all.iter().map(|e| e.aggregate_version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn batch_shares_global_position() {
        let store = InMemoryEventStore::new();

        let events = store
            .push(vec![
                org_command("inst1", "org1", "org.added"),
                org_command("inst1", "org1", "org.domain.added"),
            ])
            .await
            .unwrap();

        assert_eq!(events[0].position.global, events[1].position.global);
        assert_eq!(events[0].position.in_tx_order, 0);
        assert_eq!(events[1].position.in_tx_order, 1);
    }

    #[tokio::test]
    async fn concurrency_check_detects_stale_version() {
        let store = InMemoryEventStore::new();
        store.push(vec![org_command("inst1", "org1", "org.added")]).await.unwrap();

        let stale = ExpectedVersion {
            aggregate: Aggregate::new("inst1", "org", "org1", "org1"),
            version: 0,
        };
        let err = store
            .push_with_concurrency_check(vec![org_command("inst1", "org1", "org.changed")], vec![stale])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ConcurrencyConflict { expected: 0, current: 1, .. }));
    }

    #[tokio::test]
    async fn instances_are_isolated() {
        let store = InMemoryEventStore::new();
        store.push(vec![org_command("inst1", "org1", "org.added")]).await.unwrap();
        store.push(vec![org_command("inst2", "org1", "org.added")]).await.unwrap();

        let filter = EventFilter::builder().instance_id("inst1").build();
        let events = store.filter(&filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].instance_id, "inst1");

        store.purge_instance("inst1").await.unwrap();
        assert_eq!(store.distinct_instance_ids().await.unwrap(), vec!["inst2".to_owned()]);
    }
}
