//! The transactional event store.
//!
//! [`EventStore`] is the save/load surface for one aggregate type. A save
//! drains the aggregate's pending events and, inside a single storage
//! transaction: asserts the version chain, inserts the event rows, and
//! hands the outbound envelopes to the event bus (and, for sagas, the
//! command bus) enrolled in that same transaction. Only after the commit
//! does the snapshot cache get refreshed; any failure rolls back and marks
//! the snapshot stale instead.
//!
//! The storage backend is reached through the [`EventPersistence`] /
//! [`StoreTransaction`] ports so vendor drivers stay out of this crate.
//! Transactions carry a [`TransactionScope`] under which driver-level retry
//! is suspended: a driver must never silently reconnect-and-retry in the
//! middle of a user-opened transaction.

use crate::aggregate::{EventSourced, MementoOriginator};
use crate::bus::{CommandBus, EventBus};
use crate::errors::{SerializationError, StoreError, StoreResult};
use crate::message::{CommandEnvelope, Envelope, VersionedEvent};
use crate::snapshot::{Memento, SnapshotCache};
use crate::types::{AggregateType, CorrelationId, EventVersion, MessageId, SourceId, Timestamp};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Whether the storage driver's automatic retry machinery is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRetry {
    /// The driver may transparently retry failed operations.
    Enabled,
    /// The driver must surface failures instead of retrying. Required
    /// inside a user-opened transaction, where a silent reconnect would
    /// split the transaction across connections.
    Suspended,
}

/// Per-operation scope passed down to the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionScope {
    /// Driver retry behavior for the duration of the operation.
    pub driver_retry: DriverRetry,
}

impl TransactionScope {
    /// The scope every user-opened transaction runs under.
    pub const fn retry_suspended() -> Self {
        Self {
            driver_retry: DriverRetry::Suspended,
        }
    }
}

/// One row of the events table.
///
/// Primary key is `(aggregate_id, aggregate_type, version)`; the payload is
/// the serialized event body as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEvent {
    /// The emitting aggregate instance.
    pub aggregate_id: SourceId,
    /// The emitting aggregate's kind.
    pub aggregate_type: AggregateType,
    /// Position in the stream, from 1 with no gaps.
    pub version: EventVersion,
    /// Serialized event body.
    pub payload: String,
    /// The event's stable type tag.
    pub event_type: String,
    /// Identity of the originating command.
    pub correlation_id: Option<CorrelationId>,
    /// When the row was written.
    pub created_at: Timestamp,
}

impl PersistedEvent {
    /// Builds the row for a stamped wire event.
    pub fn from_event(event: &VersionedEvent) -> Self {
        Self {
            aggregate_id: event.source_id,
            aggregate_type: event.source_type.clone(),
            version: event.version,
            payload: event.body.to_string(),
            event_type: event.tag.clone(),
            correlation_id: event.correlation_id.clone(),
            created_at: event.created_at,
        }
    }

    /// Reconstructs the wire event from this row.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Decode`] if the payload text is not valid.
    pub fn to_event(&self) -> Result<VersionedEvent, SerializationError> {
        let body: Value =
            serde_json::from_str(&self.payload).map_err(|source| SerializationError::Decode {
                kind: self.event_type.clone(),
                source,
            })?;
        Ok(VersionedEvent {
            source_id: self.aggregate_id,
            source_type: self.aggregate_type.clone(),
            version: self.version,
            tag: self.event_type.clone(),
            body,
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
        })
    }
}

/// An open storage transaction.
///
/// Writes staged through a transaction become visible only on
/// [`commit`](Self::commit); dropping or rolling back discards them.
/// Vendor-coupled buses downcast via [`as_any_mut`](Self::as_any_mut) to
/// reach their sibling transaction and append outbox rows to it.
#[async_trait]
pub trait StoreTransaction: Send {
    /// The scope this transaction was opened under.
    fn scope(&self) -> TransactionScope;

    /// The last persisted version for a stream, read without blocking on
    /// concurrent writers (the READPAST equivalent); 0 when the stream has
    /// no events.
    ///
    /// # Errors
    ///
    /// Returns a store error when the read fails.
    async fn last_version(
        &mut self,
        source_type: &AggregateType,
        id: SourceId,
    ) -> StoreResult<u64>;

    /// Reads a stream's events with version greater than `after_version`,
    /// seeing writes staged earlier in this same transaction.
    ///
    /// # Errors
    ///
    /// Returns a store error when the read fails.
    async fn read_events(
        &mut self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<PersistedEvent>>;

    /// Stages event rows for insertion.
    ///
    /// # Errors
    ///
    /// Returns a store error when staging fails (e.g. a key violation the
    /// backend detects eagerly).
    async fn insert_events(&mut self, rows: Vec<PersistedEvent>) -> StoreResult<()>;

    /// Stages truncation of the events and snapshots tables. Used by the
    /// rebuilder only.
    ///
    /// # Errors
    ///
    /// Returns a store error when the truncation cannot be staged.
    async fn truncate(&mut self) -> StoreResult<()>;

    /// Atomically applies every staged write.
    ///
    /// # Errors
    ///
    /// Returns a store error when the commit fails; staged writes are lost.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards every staged write.
    ///
    /// # Errors
    ///
    /// Returns a store error when the backend rollback itself fails.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;

    /// Downcast support for vendor-coupled collaborators.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Port to the events-table storage backend.
#[async_trait]
pub trait EventPersistence: Send + Sync {
    /// Opens a transaction under the given scope.
    ///
    /// # Errors
    ///
    /// Returns a store error when a transaction cannot be opened.
    async fn begin(&self, scope: TransactionScope) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Reads the events of one stream with version greater than
    /// `after_version`, in ascending version order.
    ///
    /// # Errors
    ///
    /// Returns a store error when the read fails.
    async fn read_events(
        &self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<PersistedEvent>>;
}

/// The message whose handling produced a save, used to derive the
/// correlation id stamped on the saved events: a command correlates by its
/// own id, an event passes its correlation id through.
#[derive(Debug, Clone)]
pub enum TriggerMessage {
    /// The save was triggered by a command.
    Command {
        /// The command's id.
        id: MessageId,
    },
    /// The save was triggered by an event (e.g. a saga reacting).
    Event {
        /// The correlation id the event carried, if any.
        correlation_id: Option<CorrelationId>,
    },
}

impl TriggerMessage {
    /// The trigger for a command envelope.
    pub fn from_command(command: &CommandEnvelope) -> Self {
        Self::Command {
            id: command.command_id,
        }
    }

    /// The trigger for a delivered event.
    pub fn from_event(event: &Envelope<VersionedEvent>) -> Self {
        Self::Event {
            correlation_id: event.correlation_id.clone(),
        }
    }

    /// The correlation id to stamp on events saved under this trigger.
    pub fn correlation(&self) -> Option<CorrelationId> {
        match self {
            Self::Command { id } => Some(CorrelationId::from(*id)),
            Self::Event { correlation_id } => correlation_id.clone(),
        }
    }
}

struct SnapshotSupport<A> {
    cache: Arc<SnapshotCache>,
    capture: fn(&A) -> Result<Memento, SerializationError>,
    restore: fn(SourceId, &Memento, Vec<VersionedEvent>) -> Result<A, crate::errors::RehydrationError>,
}

/// The transactional event store for one aggregate type.
///
/// Construction verifies that both buses can enroll their writes in the
/// store transaction; a bus that cannot is rejected with
/// [`StoreError::IncompatibleBus`].
pub struct EventStore<A: EventSourced> {
    persistence: Arc<dyn EventPersistence>,
    event_bus: Arc<dyn EventBus>,
    command_bus: Arc<dyn CommandBus>,
    snapshots: Option<SnapshotSupport<A>>,
}

impl<A: EventSourced> EventStore<A> {
    /// Creates a store over the given backend and buses.
    ///
    /// # Errors
    ///
    /// [`StoreError::IncompatibleBus`] when either bus cannot enroll in
    /// the caller's transaction.
    pub fn new(
        persistence: Arc<dyn EventPersistence>,
        event_bus: Arc<dyn EventBus>,
        command_bus: Arc<dyn CommandBus>,
    ) -> StoreResult<Self> {
        if !event_bus.enrolls_in_transaction() {
            return Err(StoreError::IncompatibleBus { bus: "event" });
        }
        if !command_bus.enrolls_in_transaction() {
            return Err(StoreError::IncompatibleBus { bus: "command" });
        }
        Ok(Self {
            persistence,
            event_bus,
            command_bus,
            snapshots: None,
        })
    }

    /// Enables the snapshot shortcut for this store.
    #[must_use]
    pub fn with_snapshots(mut self, cache: Arc<SnapshotCache>) -> Self
    where
        A: MementoOriginator,
    {
        self.snapshots = Some(SnapshotSupport {
            cache,
            capture: <A as MementoOriginator>::to_memento,
            restore: <A as MementoOriginator>::from_memento,
        });
        self
    }

    /// Loads an aggregate, or `None` when it has no persisted events.
    ///
    /// With a snapshot cache attached, a fresh snapshot is used alone; a
    /// stale or older snapshot is combined with the event tail read from
    /// storage. Without one, the full history is replayed.
    ///
    /// # Errors
    ///
    /// Storage, serialization, or rehydration failures.
    pub async fn find(&self, id: SourceId) -> StoreResult<Option<A>> {
        let source_type = A::source_type();
        if let Some(snapshots) = &self.snapshots {
            if let Some(cached) = snapshots.cache.get(&source_type, id) {
                if cached.fresh {
                    trace!(%source_type, %id, version = cached.memento.version,
                        "serving aggregate from fresh snapshot");
                    return Ok(Some((snapshots.restore)(id, &cached.memento, Vec::new())?));
                }
                let tail = self.read_after(&source_type, id, cached.memento.version).await?;
                trace!(%source_type, %id, snapshot_version = cached.memento.version,
                    tail_len = tail.len(), "serving aggregate from snapshot plus tail");
                return Ok(Some((snapshots.restore)(id, &cached.memento, tail)?));
            }
        }

        let history = self.read_after(&source_type, id, 0).await?;
        if history.is_empty() {
            return Ok(None);
        }
        Ok(Some(A::from_history(id, history)?))
    }

    /// Loads an aggregate, failing with [`StoreError::NotFound`] when it
    /// has no persisted events.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], or anything [`find`](Self::find) raises.
    pub async fn get(&self, id: SourceId) -> StoreResult<A> {
        self.find(id).await?.ok_or_else(|| StoreError::NotFound {
            source_type: A::source_type(),
            id,
        })
    }

    /// Persists the aggregate's pending events and hands the outbound
    /// messages to the buses, all in one transaction.
    ///
    /// On success the snapshot cache is refreshed; on any failure the
    /// transaction is rolled back and the snapshot entry is marked stale
    /// so the next load reads the event tail.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConcurrencyConflict`] when another writer appended
    /// first, or any storage/bus failure.
    pub async fn save(&self, aggregate: &mut A, trigger: &TriggerMessage) -> StoreResult<()> {
        let source_type = A::source_type();
        let id = aggregate.id();
        let pending = aggregate.drain_pending();
        if pending.is_empty() {
            trace!(%source_type, %id, "save skipped: no pending events");
            return Ok(());
        }

        let correlation = trigger.correlation();
        let mut txn = self
            .persistence
            .begin(TransactionScope::retry_suspended())
            .await?;

        if let Err(err) = self
            .append(txn.as_mut(), aggregate, pending, correlation)
            .await
        {
            if let Err(rollback_err) = txn.rollback().await {
                warn!(%source_type, %id, error = %rollback_err, "rollback failed after save error");
            }
            self.mark_stale(&source_type, id);
            return Err(err);
        }

        if let Err(err) = txn.commit().await {
            self.mark_stale(&source_type, id);
            return Err(err);
        }

        debug!(%source_type, %id, version = aggregate.version(), "aggregate saved");
        self.refresh_snapshot(&source_type, aggregate);
        Ok(())
    }

    async fn append(
        &self,
        txn: &mut dyn StoreTransaction,
        aggregate: &mut A,
        mut pending: Vec<VersionedEvent>,
        correlation: Option<CorrelationId>,
    ) -> StoreResult<()> {
        let source_type = A::source_type();
        let id = aggregate.id();

        let current = txn.last_version(&source_type, id).await?;
        let attempted = u64::from(pending[0].version);
        if current + 1 != attempted {
            warn!(%source_type, %id, attempted, current, "optimistic concurrency conflict");
            return Err(StoreError::ConcurrencyConflict {
                source_type,
                id,
                attempted,
                current,
            });
        }

        let now = Timestamp::now();
        for event in &mut pending {
            event.correlation_id = correlation.clone();
            event.created_at = now;
        }

        let rows = pending.iter().map(PersistedEvent::from_event).collect();
        txn.insert_events(rows).await?;

        let envelopes: Vec<_> = pending.into_iter().map(Envelope::for_event).collect();
        self.event_bus.publish(envelopes, txn).await?;

        if let Some(emitter) = aggregate.as_command_emitter() {
            let commands = emitter.drain_pending_commands();
            if !commands.is_empty() {
                let envelopes: Vec<_> =
                    commands.into_iter().map(Envelope::for_command).collect();
                self.command_bus.send(envelopes, txn).await?;
            }
        }
        Ok(())
    }

    async fn read_after(
        &self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<VersionedEvent>> {
        let rows = self
            .persistence
            .read_events(source_type, id, after_version)
            .await?;
        rows.iter()
            .map(|row| row.to_event().map_err(StoreError::from))
            .collect()
    }

    fn mark_stale(&self, source_type: &AggregateType, id: SourceId) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.cache.mark_stale(source_type, id);
        }
    }

    fn refresh_snapshot(&self, source_type: &AggregateType, aggregate: &A) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        match (snapshots.capture)(aggregate) {
            Ok(memento) => snapshots.cache.set(source_type, aggregate.id(), memento),
            Err(err) => {
                // The events are already committed; a missing snapshot only
                // costs the next load a tail read.
                warn!(%source_type, id = %aggregate.id(), error = %err,
                    "snapshot capture failed after commit; entry marked stale");
                snapshots.cache.mark_stale(source_type, aggregate.id());
            }
        }
    }
}
