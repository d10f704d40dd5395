//! Message buses and the in-memory collector.
//!
//! The event store hands outbound messages to a bus *inside* its storage
//! transaction, so a compatible bus must be able to enroll its writes in
//! the caller's transaction - a SQL-backed bus appends outbox rows through
//! the transaction handle it receives. The capability is part of the trait
//! contract and checked at store construction.
//!
//! [`InMemoryMessageBus`] is the in-process collector used by handlers and
//! the rebuilder: it ignores the transaction argument and makes messages
//! visible immediately, which is exactly what the rebuilder's depth-first
//! drain needs.

use crate::errors::StoreResult;
use crate::message::{CommandEnvelope, Envelope, VersionedEvent};
use crate::store::StoreTransaction;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Outbound event publication, enrollable in a store transaction.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Whether this bus writes through the caller's transaction. The event
    /// store refuses buses that answer `false`.
    fn enrolls_in_transaction(&self) -> bool;

    /// Publishes event envelopes as part of the given transaction.
    ///
    /// # Errors
    ///
    /// Returns a store error when the write cannot be staged; the caller
    /// rolls the transaction back.
    async fn publish(
        &self,
        envelopes: Vec<Envelope<VersionedEvent>>,
        txn: &mut dyn StoreTransaction,
    ) -> StoreResult<()>;
}

/// Outbound command delivery, enrollable in a store transaction.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Whether this bus writes through the caller's transaction.
    fn enrolls_in_transaction(&self) -> bool;

    /// Sends command envelopes as part of the given transaction.
    ///
    /// # Errors
    ///
    /// Returns a store error when the write cannot be staged.
    async fn send(
        &self,
        envelopes: Vec<Envelope<CommandEnvelope>>,
        txn: &mut dyn StoreTransaction,
    ) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct Queues {
    commands: VecDeque<Envelope<CommandEnvelope>>,
    events: VecDeque<Envelope<VersionedEvent>>,
}

/// In-process collector with one FIFO queue per message kind.
///
/// Processing rounds are single-threaded - one message is handled end to
/// end before the next - so the mutex here only guards against the bus
/// being shared behind an `Arc`, never against contention. Commands drain
/// before events within a round.
#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    queues: Mutex<Queues>,
}

impl InMemoryMessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any commands are queued.
    pub fn has_new_commands(&self) -> bool {
        !self.lock().commands.is_empty()
    }

    /// Whether any events are queued.
    pub fn has_new_events(&self) -> bool {
        !self.lock().events.is_empty()
    }

    /// Takes every queued command, in FIFO order.
    pub fn drain_commands(&self) -> Vec<Envelope<CommandEnvelope>> {
        self.lock().commands.drain(..).collect()
    }

    /// Takes every queued event, in FIFO order.
    pub fn drain_events(&self) -> Vec<Envelope<VersionedEvent>> {
        self.lock().events.drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().expect("bus lock poisoned")
    }
}

#[async_trait]
impl EventBus for InMemoryMessageBus {
    fn enrolls_in_transaction(&self) -> bool {
        // The collector's delivery is the current processing round itself;
        // it has no writes of its own to enroll, so the transaction
        // argument is ignored.
        true
    }

    async fn publish(
        &self,
        envelopes: Vec<Envelope<VersionedEvent>>,
        _txn: &mut dyn StoreTransaction,
    ) -> StoreResult<()> {
        self.lock().events.extend(envelopes);
        Ok(())
    }
}

#[async_trait]
impl CommandBus for InMemoryMessageBus {
    fn enrolls_in_transaction(&self) -> bool {
        true
    }

    async fn send(
        &self,
        envelopes: Vec<Envelope<CommandEnvelope>>,
        _txn: &mut dyn StoreTransaction,
    ) -> StoreResult<()> {
        self.lock().commands.extend(envelopes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::store::{PersistedEvent, TransactionScope};
    use crate::types::{AggregateType, EventVersion, SourceId, Timestamp};
    use std::any::Any;

    /// A do-nothing transaction so the bus methods can be exercised.
    struct NullTransaction;

    #[async_trait]
    impl StoreTransaction for NullTransaction {
        fn scope(&self) -> TransactionScope {
            TransactionScope::retry_suspended()
        }

        async fn last_version(
            &mut self,
            _source_type: &AggregateType,
            _id: SourceId,
        ) -> StoreResult<u64> {
            Ok(0)
        }

        async fn read_events(
            &mut self,
            _source_type: &AggregateType,
            _id: SourceId,
            _after_version: u64,
        ) -> StoreResult<Vec<PersistedEvent>> {
            Ok(Vec::new())
        }

        async fn insert_events(&mut self, _rows: Vec<PersistedEvent>) -> StoreResult<()> {
            Ok(())
        }

        async fn truncate(&mut self) -> StoreResult<()> {
            Ok(())
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> StoreResult<()> {
            Err(StoreError::Storage("nothing to roll back".to_string()))
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn event(tag: &str) -> Envelope<VersionedEvent> {
        Envelope::for_event(VersionedEvent {
            source_id: SourceId::new(),
            source_type: AggregateType::try_new("inventory").unwrap(),
            version: EventVersion::first(),
            tag: tag.to_string(),
            body: serde_json::json!({}),
            correlation_id: None,
            created_at: Timestamp::now(),
        })
    }

    fn command(tag: &str) -> Envelope<CommandEnvelope> {
        Envelope::for_command(CommandEnvelope {
            command_id: crate::types::MessageId::new(),
            tag: tag.to_string(),
            body: serde_json::json!({}),
            created_at: Timestamp::now(),
        })
    }

    #[tokio::test]
    async fn new_bus_has_no_messages() {
        let bus = InMemoryMessageBus::new();
        assert!(!bus.has_new_commands());
        assert!(!bus.has_new_events());
        assert!(bus.drain_commands().is_empty());
        assert!(bus.drain_events().is_empty());
    }

    #[tokio::test]
    async fn published_events_drain_in_fifo_order() {
        let bus = InMemoryMessageBus::new();
        let mut txn = NullTransaction;
        bus.publish(vec![event("first"), event("second")], &mut txn)
            .await
            .unwrap();
        bus.publish(vec![event("third")], &mut txn).await.unwrap();

        assert!(bus.has_new_events());
        let drained = bus.drain_events();
        let tags: Vec<_> = drained.iter().map(|e| e.body.tag.as_str()).collect();
        assert_eq!(tags, ["first", "second", "third"]);
        assert!(!bus.has_new_events());
    }

    #[tokio::test]
    async fn sent_commands_drain_in_fifo_order() {
        let bus = InMemoryMessageBus::new();
        let mut txn = NullTransaction;
        bus.send(vec![command("a"), command("b")], &mut txn)
            .await
            .unwrap();

        let drained = bus.drain_commands();
        let tags: Vec<_> = drained.iter().map(|c| c.body.tag.as_str()).collect();
        assert_eq!(tags, ["a", "b"]);
        assert!(!bus.has_new_commands());
    }

    #[tokio::test]
    async fn command_and_event_queues_are_independent() {
        let bus = InMemoryMessageBus::new();
        let mut txn = NullTransaction;
        bus.send(vec![command("cmd")], &mut txn).await.unwrap();
        bus.publish(vec![event("evt")], &mut txn).await.unwrap();

        assert_eq!(bus.drain_commands().len(), 1);
        assert!(bus.has_new_events());
        assert_eq!(bus.drain_events().len(), 1);
    }

    #[test]
    fn collector_claims_the_enrollment_capability() {
        let bus = InMemoryMessageBus::new();
        assert!(EventBus::enrolls_in_transaction(&bus));
        assert!(CommandBus::enrolls_in_transaction(&bus));
    }
}
