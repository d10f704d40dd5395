//! Deterministic event-store reconstruction from the message log.
//!
//! The rebuilder replays every logged message - commands through the
//! command processor, events through the event dispatcher - against a
//! truncated destination store, inside one storage transaction, while a
//! second transaction accumulates the new audit log. Messages produced
//! during replay drain through the in-memory bus, commands before events,
//! until both queues are empty, and every message (outer or inner) passes
//! the duplicate filter first. Given the same log, two rebuilds produce
//! identical event tables.
//!
//! Handler saves during replay must land in the rebuilder's transaction,
//! not transactions of their own: handlers are given the rebuilder's
//! *enlisted* persistence, whose transactions join the open one and whose
//! commit/rollback are deferred to the rebuild itself. Because the rebuild
//! spans what a vendor backend would see as multiple connections, the
//! whole run executes with driver retry suspended.
//!
//! The audit transaction commits before the event-store transaction. That
//! ordering is inherited from the system this one replaces and is a known
//! crash-consistency hazard: a crash between the two commits leaves audit
//! rows for events that were never written.

use crate::audit::{AuditLog, AuditMetadata, AuditTransaction};
use crate::bus::InMemoryMessageBus;
use crate::dispatcher::EventDispatcher;
use crate::errors::{ProcessingError, ProcessingResult, RebuildError, StoreError, StoreResult};
use crate::message::{CommandEnvelope, Envelope, MessageKind, VersionedEvent};
use crate::message_log::MessageLogRead;
use crate::processor::{CommandHandler, CommandProcessor};
use crate::serialization::{LoggedMessage, MessageSerializer};
use crate::snapshot::SnapshotCache;
use crate::store::{
    EventPersistence, PersistedEvent, StoreTransaction, TransactionScope,
};
use crate::types::{AggregateType, SourceId};
use async_trait::async_trait;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const DEFAULT_BATCH_SIZE: usize = 256;

type SharedStoreTxn = Arc<Mutex<Option<Box<dyn StoreTransaction>>>>;
type SharedAuditTxn = Arc<Mutex<Option<Box<dyn AuditTransaction>>>>;

/// Live progress counters for an ongoing rebuild.
///
/// Shared with observers; the counters are monotone within one run and
/// reset when the next run starts.
#[derive(Debug, Default)]
pub struct RebuildCounters {
    total: AtomicU64,
    processed: AtomicU64,
    commands: AtomicU64,
    events: AtomicU64,
    duplicates: AtomicU64,
}

impl RebuildCounters {
    /// Total number of source log entries in the current run.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Source log entries fully processed so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Commands replayed, inner ones included.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Events replayed, inner ones included.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Messages suppressed by the duplicate filter.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    fn reset(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.commands.store(0, Ordering::Relaxed);
        self.events.store(0, Ordering::Relaxed);
        self.duplicates.store(0, Ordering::Relaxed);
    }
}

/// Summary of a completed rebuild.
#[derive(Debug, Clone)]
pub struct RebuildReport {
    /// Source log entries found.
    pub total: u64,
    /// Source log entries processed.
    pub processed: u64,
    /// Commands replayed, inner ones included.
    pub commands: u64,
    /// Events replayed, inner ones included.
    pub events: u64,
    /// Messages suppressed as duplicates.
    pub duplicates: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Processing rate over the whole run.
    pub messages_per_second: f64,
}

/// Rebuilds an event store by replaying the durable message log.
pub struct EventStoreRebuilder {
    source: Arc<dyn MessageLogRead>,
    serializer: Arc<dyn MessageSerializer>,
    destination: Arc<dyn EventPersistence>,
    audit: Arc<dyn AuditLog>,
    bus: Arc<InMemoryMessageBus>,
    snapshot_cache: Option<Arc<SnapshotCache>>,
    store_txn: SharedStoreTxn,
    audit_txn: SharedAuditTxn,
    counters: Arc<RebuildCounters>,
    batch_size: usize,
}

impl EventStoreRebuilder {
    /// Creates a rebuilder over the given source log, destination store,
    /// and fresh audit log. Replay handlers must publish through `bus`.
    pub fn new(
        source: Arc<dyn MessageLogRead>,
        serializer: Arc<dyn MessageSerializer>,
        destination: Arc<dyn EventPersistence>,
        audit: Arc<dyn AuditLog>,
        bus: Arc<InMemoryMessageBus>,
    ) -> Self {
        Self {
            source,
            serializer,
            destination,
            audit,
            bus,
            snapshot_cache: None,
            store_txn: Arc::new(Mutex::new(None)),
            audit_txn: Arc::new(Mutex::new(None)),
            counters: Arc::new(RebuildCounters::default()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Clears this snapshot cache when the snapshots table is truncated.
    #[must_use]
    pub fn with_snapshot_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.snapshot_cache = Some(cache);
        self
    }

    /// The live progress counters, for perf-counter observers.
    pub fn counters(&self) -> Arc<RebuildCounters> {
        Arc::clone(&self.counters)
    }

    /// A persistence handle whose transactions join the rebuild's open
    /// transaction. Build the replay handlers' event stores on this, so
    /// their saves land in the rebuild transaction instead of committing
    /// on their own.
    pub fn enlisted_persistence(&self) -> Arc<dyn EventPersistence> {
        Arc::new(EnlistedPersistence {
            shared: Arc::clone(&self.store_txn),
        })
    }

    /// Runs the rebuild to completion.
    ///
    /// The processor and dispatcher are rebuild-dedicated instances wired
    /// to the enlisted persistence; the audit-log mirror is registered on
    /// both before replay starts. On success, the audit transaction
    /// commits first, then the event-store transaction. On any failure,
    /// both roll back and the error propagates.
    ///
    /// # Errors
    ///
    /// [`RebuildError::Serialization`] for an unreadable log entry,
    /// [`RebuildError::Processing`] for a replay failure, or
    /// [`RebuildError::Store`] for transaction failures.
    #[instrument(skip_all)]
    pub async fn rebuild(
        &self,
        mut processor: CommandProcessor,
        mut dispatcher: EventDispatcher,
    ) -> Result<RebuildReport, RebuildError> {
        let started = Instant::now();
        let total = self.source.count().await?;
        self.counters.reset(total);
        info!(total, "starting event store rebuild");

        let mirror = Arc::new(AuditMirror {
            txn: Arc::clone(&self.audit_txn),
        });
        processor.register_catch_all(Arc::clone(&mirror) as Arc<dyn CommandHandler>);
        dispatcher.register_catch_all(mirror);

        let store_txn = self
            .destination
            .begin(TransactionScope::retry_suspended())
            .await?;
        *self.store_txn.lock().await = Some(store_txn);
        match self.audit.begin().await {
            Ok(audit_txn) => *self.audit_txn.lock().await = Some(audit_txn),
            Err(err) => {
                self.abort().await;
                return Err(err.into());
            }
        }

        let outcome = self.replay_all(&processor, &dispatcher).await;
        match outcome {
            Ok(()) => {
                self.finish(started).await
            }
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    async fn replay_all(
        &self,
        processor: &CommandProcessor,
        dispatcher: &EventDispatcher,
    ) -> Result<(), RebuildError> {
        {
            let mut guard = self.store_txn.lock().await;
            let txn = guard
                .as_mut()
                .ok_or_else(|| StoreError::Storage("rebuild transaction missing".to_string()))?;
            txn.truncate().await?;
        }
        if let Some(cache) = &self.snapshot_cache {
            cache.clear();
        }

        let mut after_id = 0;
        loop {
            let batch = self
                .source
                .read_batch(after_id, self.batch_size)
                .await
                .map_err(RebuildError::Store)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                after_id = entry.id;
                let message = self.serializer.deserialize(&entry.payload).map_err(
                    |source| RebuildError::Serialization {
                        entry_id: entry.id,
                        source,
                    },
                )?;
                debug!(entry_id = entry.id, kind = %message.kind(), tag = message.tag(),
                    "replaying log entry");
                self.apply(message, processor, dispatcher)
                    .await
                    .map_err(|source| RebuildError::Processing {
                        entry_id: entry.id,
                        source,
                    })?;
                self.drain_bus(processor, dispatcher)
                    .await
                    .map_err(|source| RebuildError::Processing {
                        entry_id: entry.id,
                        source,
                    })?;
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        message: LoggedMessage,
        processor: &CommandProcessor,
        dispatcher: &EventDispatcher,
    ) -> ProcessingResult<()> {
        match message {
            LoggedMessage::Command(command) => {
                self.replay_command(Envelope::for_command(command), processor)
                    .await
            }
            LoggedMessage::Event(event) => {
                self.replay_event(Envelope::for_event(event), dispatcher).await
            }
        }
    }

    /// Drains the in-memory bus until both queues are empty, commands
    /// first, pulling fresh commands after every replayed message so inner
    /// work completes before the next log entry.
    async fn drain_bus(
        &self,
        processor: &CommandProcessor,
        dispatcher: &EventDispatcher,
    ) -> ProcessingResult<()> {
        let mut queued_events: VecDeque<Envelope<VersionedEvent>> = VecDeque::new();
        let mut queued_commands: VecDeque<Envelope<CommandEnvelope>> = VecDeque::new();
        loop {
            queued_commands.extend(self.bus.drain_commands());
            if let Some(command) = queued_commands.pop_front() {
                self.replay_command(command, processor).await?;
                continue;
            }
            queued_events.extend(self.bus.drain_events());
            if let Some(event) = queued_events.pop_front() {
                self.replay_event(event, dispatcher).await?;
                continue;
            }
            break;
        }
        Ok(())
    }

    async fn replay_command(
        &self,
        command: Envelope<CommandEnvelope>,
        processor: &CommandProcessor,
    ) -> ProcessingResult<()> {
        if self.is_duplicate(&command.body.key()).await? {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(tag = %command.body.tag, "suppressing duplicate command");
            return Ok(());
        }
        processor.process_message(&command).await?;
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn replay_event(
        &self,
        event: Envelope<VersionedEvent>,
        dispatcher: &EventDispatcher,
    ) -> ProcessingResult<()> {
        if self.is_duplicate(&event.body.key()).await? {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(tag = %event.body.tag, "suppressing duplicate event");
            return Ok(());
        }
        dispatcher.dispatch(&event).await?;
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn is_duplicate(&self, key: &crate::message::MessageKey) -> StoreResult<bool> {
        let guard = self.audit_txn.lock().await;
        match guard.as_ref() {
            Some(txn) => txn.is_duplicate(key).await,
            None => Err(StoreError::Storage(
                "audit transaction missing during replay".to_string(),
            )),
        }
    }

    async fn finish(&self, started: Instant) -> Result<RebuildReport, RebuildError> {
        // Audit first, then the event store: the ordering this system
        // inherits. A crash between the two commits leaves audit rows for
        // events that were never written.
        let audit_txn = self.audit_txn.lock().await.take();
        let mut audit_txn = audit_txn.ok_or_else(|| {
            StoreError::Storage("audit transaction missing at commit".to_string())
        })?;
        if let Err(err) = async {
            audit_txn.truncate_previous().await?;
            audit_txn.commit().await
        }
        .await
        {
            self.abort().await;
            return Err(err.into());
        }

        let store_txn = self.store_txn.lock().await.take();
        let store_txn = store_txn.ok_or_else(|| {
            StoreError::Storage("rebuild transaction missing at commit".to_string())
        })?;
        store_txn.commit().await?;

        let elapsed = started.elapsed();
        let processed = self.counters.processed();
        let report = RebuildReport {
            total: self.counters.total(),
            processed,
            commands: self.counters.commands(),
            events: self.counters.events(),
            duplicates: self.counters.duplicates(),
            elapsed,
            messages_per_second: if elapsed.as_secs_f64() > 0.0 {
                processed as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
        };
        info!(
            processed = report.processed,
            commands = report.commands,
            events = report.events,
            duplicates = report.duplicates,
            "event store rebuild committed"
        );
        Ok(report)
    }

    async fn abort(&self) {
        if let Some(audit_txn) = self.audit_txn.lock().await.take() {
            if let Err(err) = audit_txn.rollback().await {
                warn!(error = %err, "audit transaction rollback failed");
            }
        }
        if let Some(store_txn) = self.store_txn.lock().await.take() {
            if let Err(err) = store_txn.rollback().await {
                warn!(error = %err, "store transaction rollback failed");
            }
        }
    }
}

/// Catch-all handler mirroring every processed message into the new audit
/// log. Inert when no rebuild transaction is open.
struct AuditMirror {
    txn: SharedAuditTxn,
}

impl AuditMirror {
    async fn record(&self, key: crate::message::MessageKey, metadata: AuditMetadata) -> ProcessingResult<()> {
        let mut guard = self.txn.lock().await;
        let Some(txn) = guard.as_mut() else {
            return Ok(());
        };
        txn.record(key, metadata).await.map_err(ProcessingError::from)
    }
}

#[async_trait]
impl CommandHandler for AuditMirror {
    fn handled_tags(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn handle(&self, command: &Envelope<CommandEnvelope>) -> ProcessingResult<()> {
        self.record(
            command.body.key(),
            AuditMetadata {
                kind: MessageKind::Command,
                tag: command.body.tag.clone(),
                correlation_id: command.correlation_id.clone(),
                created_at: command.body.created_at,
            },
        )
        .await
    }
}

#[async_trait]
impl crate::dispatcher::EventHandler for AuditMirror {
    fn subscribed_tags(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn handle(&self, event: &Envelope<VersionedEvent>) -> ProcessingResult<()> {
        self.record(
            event.body.key(),
            AuditMetadata {
                kind: MessageKind::Event,
                tag: event.body.tag.clone(),
                correlation_id: event.body.correlation_id.clone(),
                created_at: event.body.created_at,
            },
        )
        .await
    }
}

/// Persistence facade whose transactions join the rebuild's open
/// transaction instead of opening their own.
struct EnlistedPersistence {
    shared: SharedStoreTxn,
}

#[async_trait]
impl EventPersistence for EnlistedPersistence {
    async fn begin(&self, _scope: TransactionScope) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(JoinedTransaction {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn read_events(
        &self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let mut guard = self.shared.lock().await;
        let txn = guard.as_mut().ok_or_else(|| {
            StoreError::Storage("no open rebuild transaction to read through".to_string())
        })?;
        txn.read_events(source_type, id, after_version).await
    }
}

/// A transaction view over the rebuild's shared transaction. Writes and
/// reads delegate to the open transaction; commit and rollback are
/// deferred to the rebuild, which finishes the real transaction once.
struct JoinedTransaction {
    shared: SharedStoreTxn,
}

#[async_trait]
impl StoreTransaction for JoinedTransaction {
    fn scope(&self) -> TransactionScope {
        TransactionScope::retry_suspended()
    }

    async fn last_version(
        &mut self,
        source_type: &AggregateType,
        id: SourceId,
    ) -> StoreResult<u64> {
        let mut guard = self.shared.lock().await;
        let txn = guard.as_mut().ok_or_else(|| {
            StoreError::Storage("no open rebuild transaction".to_string())
        })?;
        txn.last_version(source_type, id).await
    }

    async fn read_events(
        &mut self,
        source_type: &AggregateType,
        id: SourceId,
        after_version: u64,
    ) -> StoreResult<Vec<PersistedEvent>> {
        let mut guard = self.shared.lock().await;
        let txn = guard.as_mut().ok_or_else(|| {
            StoreError::Storage("no open rebuild transaction".to_string())
        })?;
        txn.read_events(source_type, id, after_version).await
    }

    async fn insert_events(&mut self, rows: Vec<PersistedEvent>) -> StoreResult<()> {
        let mut guard = self.shared.lock().await;
        let txn = guard.as_mut().ok_or_else(|| {
            StoreError::Storage("no open rebuild transaction".to_string())
        })?;
        txn.insert_events(rows).await
    }

    async fn truncate(&mut self) -> StoreResult<()> {
        let mut guard = self.shared.lock().await;
        let txn = guard.as_mut().ok_or_else(|| {
            StoreError::Storage("no open rebuild transaction".to_string())
        })?;
        txn.truncate().await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        // Deferred: the rebuild commits the real transaction.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Deferred likewise; a replay failure aborts the whole rebuild.
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKey;
    use crate::types::{MessageId, Timestamp};

    #[test]
    fn counters_reset_between_runs() {
        let counters = RebuildCounters::default();
        counters.processed.store(10, Ordering::Relaxed);
        counters.duplicates.store(2, Ordering::Relaxed);

        counters.reset(7);
        assert_eq!(counters.total(), 7);
        assert_eq!(counters.processed(), 0);
        assert_eq!(counters.commands(), 0);
        assert_eq!(counters.events(), 0);
        assert_eq!(counters.duplicates(), 0);
    }

    #[tokio::test]
    async fn mirror_is_inert_without_an_open_transaction() {
        let mirror = AuditMirror {
            txn: Arc::new(Mutex::new(None)),
        };
        let outcome = mirror
            .record(
                MessageKey::Command {
                    id: MessageId::new(),
                },
                AuditMetadata {
                    kind: MessageKind::Command,
                    tag: "noop".to_string(),
                    correlation_id: None,
                    created_at: Timestamp::now(),
                },
            )
            .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn enlisted_reads_fail_outside_a_rebuild() {
        let persistence = EnlistedPersistence {
            shared: Arc::new(Mutex::new(None)),
        };
        let result = persistence
            .read_events(
                &AggregateType::try_new("inventory").unwrap(),
                SourceId::new(),
                0,
            )
            .await;
        assert!(matches!(result, Err(StoreError::Storage(_))));
    }
}
