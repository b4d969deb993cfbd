use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::StoredEvent;

const CHANNEL_CAPACITY: usize = 256;

/// In-process fan-out of committed event batches.
///
/// Publishing happens after the store transaction commits, so subscribers
/// never observe an event that could still roll back.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<Arc<Vec<StoredEvent>>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, events: &[StoredEvent]) {
        if events.is_empty() {
            return;
        }
        // Send only fails when there are no subscribers.
        let _ = self.sender.send(Arc::new(events.to_vec()));
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A best-effort stream of committed event batches.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Arc<Vec<StoredEvent>>>,
}

/// What a subscription wake-up means to the consumer.
pub enum Notification {
    /// A batch of freshly committed events.
    Events(Arc<Vec<StoredEvent>>),
    /// The subscriber fell behind and missed batches. Poll the store.
    Lagged,
    /// The store is gone; no more notifications will arrive.
    Closed,
}

impl EventSubscription {
    /// Waits for the next notification.
    pub async fn recv(&mut self) -> Notification {
        match self.receiver.recv().await {
            Ok(events) => Notification::Events(events),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscription lagged, falling back to polling");
                Notification::Lagged
            }
            Err(broadcast::error::RecvError::Closed) => Notification::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::Value;

    use crate::event::StoredEvent;
    use crate::types::Position;

    use super::{EventBroadcaster, Notification};

    fn event() -> StoredEvent {
        StoredEvent {
            instance_id: "inst1".to_owned(),
            aggregate_type: "org".to_owned(),
            aggregate_id: "org1".to_owned(),
            aggregate_version: 1,
            event_type: "org.added".to_owned(),
            revision: 1,
            position: Position::new(Decimal::ONE, 0),
            creator: "system".to_owned(),
            owner: "org1".to_owned(),
            created_at: Utc::now(),
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_batches() {
        let broadcaster = EventBroadcaster::new();
        let mut subscription = broadcaster.subscribe();

        broadcaster.publish(&[event()]);

        match subscription.recv().await {
            Notification::Events(events) => assert_eq!(events.len(), 1),
            _ => panic!("expected events"),
        }
    }

    #[test]
    fn empty_batches_are_not_published() {
        let broadcaster = EventBroadcaster::new();
        let mut subscription = broadcaster.subscribe();

        broadcaster.publish(&[]);

        assert!(matches!(
            subscription.receiver.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
