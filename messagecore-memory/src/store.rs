//! In-memory events table with transactional staging.

use async_trait::async_trait;
use messagecore::{
    AggregateType, EventPersistence, PersistedEvent, SourceId, StoreError, StoreResult,
    StoreTransaction, TransactionScope,
};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type EventKey = (AggregateType, SourceId, u64);

#[derive(Debug, Default)]
struct Tables {
    events: BTreeMap<EventKey, PersistedEvent>,
}

/// Thread-safe in-memory event persistence for testing and development.
///
/// Writes go through [`MemoryTransaction`]s: staged until commit, gone on
/// rollback. The primary key `(aggregate type, id, version)` is enforced
/// at commit, mirroring the uniqueness constraint of the real table.
#[derive(Clone, Default)]
pub struct InMemoryEventPersistence {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryEventPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed event row, in primary-key order. Test helper.
    pub fn events_table(&self) -> Vec<PersistedEvent> {
        self.lock().events.values().cloned().collect()
    }

    /// Number of committed event rows. Test helper.
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("event table lock poisoned")
    }
}

#[async_trait]
impl EventPersistence for InMemoryEventPersistence {
    async fn begin(&self, scope: TransactionScope) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            scope,
            staged: Vec::new(),
            truncate_staged: false,
            deferred: Vec::new(),
        }))
    }

    async fn read_events(
        &self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let tables = self.lock();
        Ok(read_stream(&tables.events, source_type, id, after_version))
    }
}

fn read_stream(
    events: &BTreeMap<EventKey, PersistedEvent>,
    source_type: &AggregateType,
    id: SourceId,
    after_version: u64,
) -> Vec<PersistedEvent> {
    events
        .range((source_type.clone(), id, after_version + 1)..)
        .take_while(|((kind, row_id, _), _)| kind == source_type && *row_id == id)
        .map(|(_, row)| row.clone())
        .collect()
}

/// An open transaction over the in-memory store.
///
/// Holds staged rows and deferred actions; nothing is visible to other
/// readers until [`commit`](StoreTransaction::commit). The deferred
/// actions are how transaction-enrolled collaborators (the outbox bus)
/// make their deliveries atomic with the event rows.
pub struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    scope: TransactionScope,
    staged: Vec<PersistedEvent>,
    truncate_staged: bool,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl MemoryTransaction {
    /// Registers an action to run if and only if this transaction
    /// commits. Used by transaction-enrolled buses.
    pub fn defer(&mut self, action: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(action));
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn scope(&self) -> TransactionScope {
        self.scope
    }

    async fn last_version(
        &mut self,
        source_type: &AggregateType,
        id: SourceId,
    ) -> StoreResult<u64> {
        // An in-memory read never blocks on row locks, so the READPAST
        // semantics of the contract are trivially met.
        let committed = if self.truncate_staged {
            0
        } else {
            let tables = self.tables.lock().expect("event table lock poisoned");
            read_stream(&tables.events, source_type, id, 0)
                .last()
                .map_or(0, |row| u64::from(row.version))
        };
        let staged = self
            .staged
            .iter()
            .filter(|row| &row.aggregate_type == source_type && row.aggregate_id == id)
            .map(|row| u64::from(row.version))
            .max()
            .unwrap_or(0);
        Ok(committed.max(staged))
    }

    async fn read_events(
        &mut self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let mut rows = if self.truncate_staged {
            Vec::new()
        } else {
            let tables = self.tables.lock().expect("event table lock poisoned");
            read_stream(&tables.events, source_type, id, after_version)
        };
        rows.extend(
            self.staged
                .iter()
                .filter(|row| {
                    &row.aggregate_type == source_type
                        && row.aggregate_id == id
                        && u64::from(row.version) > after_version
                })
                .cloned(),
        );
        rows.sort_by_key(|row| u64::from(row.version));
        Ok(rows)
    }

    async fn insert_events(&mut self, rows: Vec<PersistedEvent>) -> StoreResult<()> {
        self.staged.extend(rows);
        Ok(())
    }

    async fn truncate(&mut self) -> StoreResult<()> {
        self.truncate_staged = true;
        self.staged.clear();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        {
            let mut tables = self.tables.lock().expect("event table lock poisoned");
            if self.truncate_staged {
                tables.events.clear();
            }
            // Enforce the primary key before touching the table.
            for row in &self.staged {
                let key = (
                    row.aggregate_type.clone(),
                    row.aggregate_id,
                    u64::from(row.version),
                );
                if tables.events.contains_key(&key) {
                    return Err(StoreError::Storage(format!(
                        "duplicate event key {}/{} v{}",
                        row.aggregate_type, row.aggregate_id, row.version
                    )));
                }
            }
            for row in self.staged {
                let key = (
                    row.aggregate_type.clone(),
                    row.aggregate_id,
                    u64::from(row.version),
                );
                tables.events.insert(key, row);
            }
        }
        for action in self.deferred {
            action();
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Staged rows and deferred actions drop with the transaction.
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messagecore::{EventVersion, Timestamp};

    fn inventory() -> AggregateType {
        AggregateType::try_new("inventory").unwrap()
    }

    fn row(id: SourceId, version: u64) -> PersistedEvent {
        PersistedEvent {
            aggregate_id: id,
            aggregate_type: inventory(),
            version: EventVersion::try_new(version).unwrap(),
            payload: "{}".to_string(),
            event_type: "noted".to_string(),
            correlation_id: None,
            created_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn staged_rows_are_invisible_until_commit() {
        let store = InMemoryEventPersistence::new();
        let id = SourceId::new();
        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(id, 1)]).await.unwrap();

        assert!(store.read_events(&inventory(), id, 0).await.unwrap().is_empty());
        txn.commit().await.unwrap();
        assert_eq!(store.read_events(&inventory(), id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let store = InMemoryEventPersistence::new();
        let id = SourceId::new();
        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(id, 1)]).await.unwrap();
        txn.rollback().await.unwrap();

        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn a_transaction_reads_its_own_writes() {
        let store = InMemoryEventPersistence::new();
        let id = SourceId::new();
        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(id, 1), row(id, 2)]).await.unwrap();

        assert_eq!(txn.last_version(&inventory(), id).await.unwrap(), 2);
        let seen = txn.read_events(&inventory(), id, 1).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(u64::from(seen[0].version), 2);
    }

    #[tokio::test]
    async fn commit_rejects_duplicate_primary_keys() {
        let store = InMemoryEventPersistence::new();
        let id = SourceId::new();
        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(id, 1)]).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(id, 1)]).await.unwrap();
        assert!(matches!(
            txn.commit().await,
            Err(StoreError::Storage(_))
        ));
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn truncate_clears_committed_rows_on_commit() {
        let store = InMemoryEventPersistence::new();
        let id = SourceId::new();
        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(id, 1)]).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.truncate().await.unwrap();
        assert_eq!(txn.last_version(&inventory(), id).await.unwrap(), 0);
        txn.commit().await.unwrap();
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn deferred_actions_run_only_on_commit() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let store = InMemoryEventPersistence::new();
        let fired = Arc::new(AtomicU32::new(0));

        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        let memory_txn = txn
            .as_any_mut()
            .downcast_mut::<MemoryTransaction>()
            .unwrap();
        let counter = Arc::clone(&fired);
        memory_txn.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        txn.rollback().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        let memory_txn = txn
            .as_any_mut()
            .downcast_mut::<MemoryTransaction>()
            .unwrap();
        let counter = Arc::clone(&fired);
        memory_txn.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        txn.commit().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streams_are_isolated_by_type_and_id() {
        let store = InMemoryEventPersistence::new();
        let first = SourceId::new();
        let second = SourceId::new();
        let mut txn = store.begin(TransactionScope::retry_suspended()).await.unwrap();
        txn.insert_events(vec![row(first, 1), row(second, 1), row(second, 2)])
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.read_events(&inventory(), first, 0).await.unwrap().len(), 1);
        assert_eq!(store.read_events(&inventory(), second, 0).await.unwrap().len(), 2);
        let other = AggregateType::try_new("order").unwrap();
        assert!(store.read_events(&other, first, 0).await.unwrap().is_empty());
    }
}
