//! A bus whose deliveries commit and roll back with the store transaction.

use async_trait::async_trait;
use messagecore::{
    CommandBus, CommandEnvelope, Envelope, EventBus, StoreError, StoreResult, StoreTransaction,
    VersionedEvent,
};
use std::sync::{Arc, Mutex};

use crate::store::MemoryTransaction;

/// Transaction-enrolled outbox bus.
///
/// `publish`/`send` stage the envelopes on the in-memory transaction as
/// deferred actions, so deliveries become visible exactly when the event
/// rows do - and never for a rolled-back save. This is the in-memory
/// stand-in for a SQL outbox table living in the same database as the
/// events.
#[derive(Default)]
pub struct OutboxBus {
    events: Arc<Mutex<Vec<Envelope<VersionedEvent>>>>,
    commands: Arc<Mutex<Vec<Envelope<CommandEnvelope>>>>,
}

impl OutboxBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Event envelopes delivered by committed transactions, in order.
    pub fn delivered_events(&self) -> Vec<Envelope<VersionedEvent>> {
        self.events.lock().expect("outbox lock poisoned").clone()
    }

    /// Command envelopes delivered by committed transactions, in order.
    pub fn delivered_commands(&self) -> Vec<Envelope<CommandEnvelope>> {
        self.commands.lock().expect("outbox lock poisoned").clone()
    }

    /// Takes the delivered events, clearing the list. Test helper.
    pub fn take_events(&self) -> Vec<Envelope<VersionedEvent>> {
        std::mem::take(&mut *self.events.lock().expect("outbox lock poisoned"))
    }

    fn memory_txn<'a>(
        txn: &'a mut dyn StoreTransaction,
        bus: &'static str,
    ) -> StoreResult<&'a mut MemoryTransaction> {
        txn.as_any_mut()
            .downcast_mut::<MemoryTransaction>()
            .ok_or(StoreError::IncompatibleBus { bus })
    }
}

#[async_trait]
impl EventBus for OutboxBus {
    fn enrolls_in_transaction(&self) -> bool {
        true
    }

    async fn publish(
        &self,
        envelopes: Vec<Envelope<VersionedEvent>>,
        txn: &mut dyn StoreTransaction,
    ) -> StoreResult<()> {
        let memory_txn = Self::memory_txn(txn, "event")?;
        let delivered = Arc::clone(&self.events);
        memory_txn.defer(move || {
            delivered
                .lock()
                .expect("outbox lock poisoned")
                .extend(envelopes);
        });
        Ok(())
    }
}

#[async_trait]
impl CommandBus for OutboxBus {
    fn enrolls_in_transaction(&self) -> bool {
        true
    }

    async fn send(
        &self,
        envelopes: Vec<Envelope<CommandEnvelope>>,
        txn: &mut dyn StoreTransaction,
    ) -> StoreResult<()> {
        let memory_txn = Self::memory_txn(txn, "command")?;
        let delivered = Arc::clone(&self.commands);
        memory_txn.defer(move || {
            delivered
                .lock()
                .expect("outbox lock poisoned")
                .extend(envelopes);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventPersistence;
    use messagecore::{
        AggregateType, EventPersistence, EventVersion, SourceId, Timestamp, TransactionScope,
    };

    fn envelope(tag: &str) -> Envelope<VersionedEvent> {
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

    #[tokio::test]
    async fn deliveries_appear_only_after_commit() {
        let store = InMemoryEventPersistence::new();
        let bus = OutboxBus::new();

        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        bus.publish(vec![envelope("noted")], txn.as_mut()).await.unwrap();
        assert!(bus.delivered_events().is_empty());

        txn.commit().await.unwrap();
        assert_eq!(bus.delivered_events().len(), 1);
    }

    #[tokio::test]
    async fn rolled_back_deliveries_never_appear() {
        let store = InMemoryEventPersistence::new();
        let bus = OutboxBus::new();

        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        bus.publish(vec![envelope("noted")], txn.as_mut()).await.unwrap();
        txn.rollback().await.unwrap();

        assert!(bus.delivered_events().is_empty());
    }

    #[tokio::test]
    async fn a_foreign_transaction_type_is_rejected() {
        struct ForeignTxn;

        #[async_trait]
        impl StoreTransaction for ForeignTxn {
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
            ) -> StoreResult<Vec<messagecore::PersistedEvent>> {
                Ok(Vec::new())
            }

            async fn insert_events(
                &mut self,
                _rows: Vec<messagecore::PersistedEvent>,
            ) -> StoreResult<()> {
                Ok(())
            }

            async fn truncate(&mut self) -> StoreResult<()> {
                Ok(())
            }

            async fn commit(self: Box<Self>) -> StoreResult<()> {
                Ok(())
            }

            async fn rollback(self: Box<Self>) -> StoreResult<()> {
                Ok(())
            }

            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }

        let bus = OutboxBus::new();
        let mut txn = ForeignTxn;
        let result = bus.publish(vec![envelope("noted")], &mut txn).await;
        assert!(matches!(result, Err(StoreError::IncompatibleBus { .. })));
    }
}
