//! Transient folds of aggregate histories used during command handling.
//!
//! A write model is a capability set, not a hierarchy: implementers provide
//! [`WriteModel::reduce`] plus access to the shared [`WriteModelBase`]
//! bookkeeping, and the free functions here do the loading.

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::event::StoredEvent;
use crate::store::{EventFilter, Eventstore, Reducer, StoreError};
use crate::types::{ObjectDetails, SequenceNumber};

/// Bookkeeping shared by every write model.
#[derive(Debug, Clone, Default)]
pub struct WriteModelBase {
    pub instance_id: String,
    pub aggregate_id: String,
    pub resource_owner: String,
    pub sequence: SequenceNumber,
    pub change_date: Option<DateTime<Utc>>,
}

impl WriteModelBase {
    /// Records the metadata of one observed event.
    fn track(&mut self, event: &StoredEvent) {
        self.instance_id = event.instance_id.clone();
        self.aggregate_id = event.aggregate_id.clone();
        self.resource_owner = event.owner.clone();
        self.sequence = event.aggregate_version;
        self.change_date = Some(event.created_at);
    }
}

/// One aggregate type's fold over its event history.
///
/// `reduce` must be total over the aggregate's known event types; unknown
/// event types are ignored for forward compatibility.
pub trait WriteModel: Default + Send {
    const AGGREGATE_TYPE: &'static str;

    fn base(&self) -> &WriteModelBase;
    fn base_mut(&mut self) -> &mut WriteModelBase;

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError>;

    /// True once at least one event has been observed.
    fn exists(&self) -> bool {
        self.base().sequence > 0
    }

    /// Aggregate summary for command return values.
    fn object_details(&self) -> ObjectDetails {
        ObjectDetails {
            sequence: self.base().sequence,
            event_date: self.base().change_date.unwrap_or_default(),
            resource_owner: self.base().resource_owner.clone(),
        }
    }
}

/// Every write model is a [`Reducer`]: metadata tracking happens here so
/// implementations only fold their domain fields.
impl<W: WriteModel> Reducer for W {
    fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
        self.base_mut().track(event);
        WriteModel::reduce(self, event)
    }
}

/// Replays the aggregate's history from the store into a fresh model.
pub async fn load<W: WriteModel>(
    store: &dyn Eventstore,
    instance_id: &str,
    aggregate_id: &str,
) -> Result<W, Error> {
    let mut model = W::default();
    model.base_mut().instance_id = instance_id.to_owned();
    model.base_mut().aggregate_id = aggregate_id.to_owned();

    let filter = EventFilter::for_aggregate(W::AGGREGATE_TYPE, instance_id, aggregate_id);
    store.filter_to_reducer(&filter, &mut model).await?;
    Ok(model)
}

/// Replays an arbitrary filter into a fresh model. Used by folds spanning
/// several aggregates of one type (e.g. the usernames taken in an org).
pub async fn load_filtered<W: WriteModel>(store: &dyn Eventstore, filter: &EventFilter) -> Result<W, Error> {
    let mut model = W::default();
    store.filter_to_reducer(filter, &mut model).await?;
    Ok(model)
}

/// Folds freshly pushed events into the model so callers observe the
/// post-push sequence.
pub fn append_and_reduce<W: WriteModel>(model: &mut W, events: &[StoredEvent]) -> Result<(), Error> {
    for event in events {
        if event.aggregate_type == W::AGGREGATE_TYPE && event.aggregate_id == model.base().aggregate_id {
            Reducer::reduce(model, event)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::Value;

    use crate::event::StoredEvent;
    use crate::store::memory::InMemoryEventStore;
    use crate::store::{Eventstore, StoreError};
    use crate::types::{Aggregate, Position};
    use crate::event::EventCommand;

    use super::{append_and_reduce, load, WriteModel, WriteModelBase};

    #[derive(Default)]
    struct CountingModel {
        base: WriteModelBase,
        added: u32,
        unknown_seen: bool,
    }

    impl WriteModel for CountingModel {
        const AGGREGATE_TYPE: &'static str = "counter";

        fn base(&self) -> &WriteModelBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut WriteModelBase {
            &mut self.base
        }

        fn reduce(&mut self, event: &StoredEvent) -> Result<(), StoreError> {
            match event.event_type.as_str() {
                "counter.added" => self.added += 1,
                _ => self.unknown_seen = true,
            }
            Ok(())
        }
    }

    fn stored(event_type: &str, version: i64) -> StoredEvent {
        StoredEvent {
            instance_id: "inst1".to_owned(),
            aggregate_type: "counter".to_owned(),
            aggregate_id: "c1".to_owned(),
            aggregate_version: version,
            event_type: event_type.to_owned(),
            revision: 1,
            position: Position::new(Decimal::from(version), 0),
            creator: "system".to_owned(),
            owner: "org1".to_owned(),
            created_at: Utc::now(),
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn load_replays_history_and_tracks_sequence() {
        let store = InMemoryEventStore::new();
        let aggregate = Aggregate::new("inst1", "counter", "c1", "org1");
        store
            .push(vec![
                EventCommand::new(aggregate.clone(), "counter.added", "system"),
                EventCommand::new(aggregate.clone(), "counter.added", "system"),
                EventCommand::new(aggregate, "counter.future", "system"),
            ])
            .await
            .unwrap();

        let model: CountingModel = load(&store, "inst1", "c1").await.unwrap();

        assert_eq!(model.added, 2);
        assert!(model.unknown_seen);
        assert_eq!(model.base().sequence, 3);
        assert_eq!(model.base().resource_owner, "org1");
        assert!(model.exists());
    }

    #[test]
    fn append_and_reduce_advances_sequence() {
        let mut model = CountingModel::default();
        model.base_mut().aggregate_id = "c1".to_owned();

        append_and_reduce(&mut model, &[stored("counter.added", 1), stored("counter.added", 2)]).unwrap();

        assert_eq!(model.added, 2);
        assert_eq!(model.base().sequence, 2);
        assert_eq!(model.object_details().resource_owner, "org1");
    }

    #[test]
    fn append_ignores_foreign_aggregates() {
        let mut model = CountingModel::default();
        model.base_mut().aggregate_id = "c1".to_owned();

        let mut foreign = stored("counter.added", 1);
        foreign.aggregate_id = "c2".to_owned();
        append_and_reduce(&mut model, &[foreign]).unwrap();

        assert_eq!(model.added, 0);
        assert!(!model.exists());
    }
}
