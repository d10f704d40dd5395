//! Event-sourced persistence and messaging core.
//!
//! `messagecore` provides the infrastructure half of an event-sourced
//! system: aggregates mutate only by appending versioned events, the
//! [`EventStore`] persists those events transactionally together with the
//! outbound messages they produce, and the in-process [`CommandProcessor`]
//! and [`EventDispatcher`] route messages to registered handlers with
//! idempotency and retry guarantees. The [`EventStoreRebuilder`] can
//! reconstruct the whole store from the durable message log by replaying
//! every original message through the same handlers.
//!
//! # Architecture
//!
//! | Piece | Role |
//! |-------|------|
//! | [`EventSourcedRoot`] / [`EventSourced`] | Aggregate base: rehydration, pending events |
//! | [`ComplexEventSourced`] | Ordered, idempotent consumption of foreign streams |
//! | [`EventStore`] | Optimistic-concurrency append with outbox co-commit |
//! | [`SnapshotCache`] | Optional load accelerator with a freshness window |
//! | [`InMemoryMessageBus`] | FIFO collector for messages produced mid-round |
//! | [`CommandProcessor`] | Tag-keyed dispatch, bounded retry |
//! | [`EventDispatcher`] | Multi-handler fan-out, sync or concurrent |
//! | [`EventStoreRebuilder`] | Deterministic replay of the message log |
//!
//! Storage backends and durable logs are reached through ports
//! ([`EventPersistence`], [`AuditLog`], [`MessageLogRead`]); the
//! `messagecore-memory` crate ships the in-memory reference adapters used
//! in tests and development.
//!
//! # A save, end to end
//!
//! A command arrives at the [`CommandProcessor`], whose handler loads an
//! aggregate from the [`EventStore`] (possibly via snapshot), calls domain
//! methods that enqueue events on the aggregate, and saves. The save runs
//! in one storage transaction: version-chain check, event-row inserts,
//! hand-off of the outbound envelopes to the event bus (and saga commands
//! to the command bus) enrolled in that same transaction. After commit the
//! snapshot cache is refreshed, and subscribed event handlers run through
//! the [`EventDispatcher`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod audit;
pub mod bus;
pub mod complex;
pub mod dispatcher;
pub mod errors;
pub mod message;
pub mod message_log;
pub mod processor;
pub mod rebuild;
pub mod retry;
pub mod serialization;
pub mod snapshot;
pub mod store;
pub mod trace;
pub mod types;
pub mod worker;

pub use aggregate::{
    CommandEmitter, EventSourced, EventSourcedRoot, MementoOriginator, Rehydrators,
};
pub use audit::{AuditLog, AuditMetadata, AuditTransaction};
pub use bus::{CommandBus, EventBus, InMemoryMessageBus};
pub use complex::{
    ComplexEventSourced, ForeignEventParked, ForeignEventProcessed, ForeignOutcome,
    ForeignStreamKey, ForeignStreamTracker, MAX_PARKED,
};
pub use dispatcher::{DispatchMode, EventDispatcher, EventHandler};
pub use errors::{
    ProcessingError, ProcessingResult, RebuildError, RegistrationError, RehydrationError,
    SerializationError, StoreError, StoreResult,
};
pub use message::{
    CommandEnvelope, DomainCommand, DomainEvent, Envelope, MessageKey, MessageKind,
    VersionedEvent,
};
pub use message_log::{MessageLogEntry, MessageLogRead};
pub use processor::{CommandHandler, CommandProcessor};
pub use rebuild::{EventStoreRebuilder, RebuildCounters, RebuildReport};
pub use retry::RetryConfig;
pub use serialization::{JsonMessageSerializer, LoggedMessage, MessageSerializer};
pub use snapshot::{CachedMemento, Memento, SnapshotCache, SnapshotConfig};
pub use store::{
    DriverRetry, EventPersistence, EventStore, PersistedEvent, StoreTransaction,
    TransactionScope, TriggerMessage,
};
pub use trace::{BoundedTracer, TraceSink, TRACE_QUEUE_CAPACITY};
pub use types::{
    AggregateType, CorrelationId, EventVersion, MessageId, SourceId, Timestamp,
};
pub use worker::{ReadModelRebuilder, Worker, WorkerStatus};
