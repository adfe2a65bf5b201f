//! Invalidation events.
//!
//! Every invalidation is published on a broadcast channel so external
//! observers (other process-local caches, audit logs) can follow along.

use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::query::Row;

const DEFAULT_CAPACITY: usize = 256;

/// Table name carried by events for a full flush.
pub const ALL_TABLES: &str = "*";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    /// Invalidated table, or [`ALL_TABLES`].
    pub table: String,
    /// Changed row; `None` for table-wide and full invalidations.
    pub fields: Option<Row>,
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(table: impl Into<String>, fields: Option<Row>, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            table: table.into(),
            fields,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_full_flush(&self) -> bool {
        self.table == ALL_TABLES
    }
}

/// Fan-out of invalidation events.
///
/// Publishing never blocks; slow subscribers observe `Lagged` from tokio.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<InvalidationEvent>,
    epoch_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, table: &str, fields: Option<Row>) {
        let event = InvalidationEvent::new(table, fields, self.next_epoch());

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            table = %event.table,
            fields = ?event.fields,
            "Cache invalidated"
        );

        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use crate::query::Value;

    use super::*;

    #[test]
    fn event_creation() {
        let event = InvalidationEvent::new("post", None, 42);
        assert_eq!(event.epoch, 42);
        assert_eq!(event.table, "post");
        assert!(!event.id.is_nil());
        assert!(!event.is_full_flush());
        assert!(InvalidationEvent::new(ALL_TABLES, None, 0).is_full_flush());
    }

    #[test]
    fn epoch_monotonicity() {
        let bus = EventBus::default();
        let e1 = bus.next_epoch();
        let e2 = bus.next_epoch();
        assert!(e1 < e2);
    }

    #[test]
    fn subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let row = Row::from([("id".to_string(), Value::Int(5))]);
        bus.publish("post", Some(row.clone()));
        bus.publish(ALL_TABLES, None);

        let first = rx.try_recv().expect("first event");
        assert_eq!(first.table, "post");
        assert_eq!(first.fields, Some(row));
        let second = rx.try_recv().expect("second event");
        assert!(second.is_full_flush());
        assert!(first.epoch < second.epoch);
    }

    #[tokio::test]
    async fn async_subscribers_are_woken() {
        let bus = std::sync::Arc::new(EventBus::default());
        let mut rx = bus.subscribe();

        let publisher = std::sync::Arc::clone(&bus);
        tokio::spawn(async move {
            publisher.publish("tag", None);
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        assert_eq!(event.table, "tag");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(0);
        bus.publish("post", None);
    }
}
