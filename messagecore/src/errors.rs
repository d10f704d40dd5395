//! Error types for the messaging core.
//!
//! Each subsystem has its own error enum, and every failure kind callers
//! need to distinguish - not-found, concurrency conflict, duplicate handler,
//! missing handler, serialization failure, rehydration mismatch, transient
//! I/O, incompatible bus - is a dedicated variant they can match on.

use crate::types::{AggregateType, SourceId};
use thiserror::Error;

/// Errors raised while encoding or decoding messages and payloads.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// A message or event payload could not be written.
    #[error("failed to serialize `{kind}`: {source}")]
    Encode {
        /// The type tag of the value being serialized.
        kind: String,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A serialized form could not be read back.
    #[error("failed to deserialize `{kind}`: {source}")]
    Decode {
        /// The type tag (or "message" when the tag itself is unreadable).
        kind: String,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while rebuilding aggregate state from events.
#[derive(Debug, Error)]
pub enum RehydrationError {
    /// Event history has a hole: the next event's version does not follow
    /// the last applied version. Indicates corrupted history; fatal.
    #[error(
        "version gap rehydrating {source_type}/{id}: expected version {expected}, found {found}"
    )]
    VersionGap {
        /// The aggregate type being rehydrated.
        source_type: AggregateType,
        /// The aggregate instance.
        id: SourceId,
        /// The version the aggregate expected to apply next.
        expected: u64,
        /// The version actually present in the history.
        found: u64,
    },

    /// An event in the history has no registered rehydrator. This is a
    /// programming error: every event an aggregate can emit must be
    /// registered in its constructor.
    #[error("no rehydrator registered for event tag `{tag}`")]
    MissingRehydrator {
        /// The unhandled event tag.
        tag: String,
    },

    /// An event payload could not be decoded into its domain type.
    #[error("failed to decode event `{tag}` during rehydration: {source}")]
    Decode {
        /// The event tag being decoded.
        tag: String,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A newly emitted event could not be serialized to its wire form.
    #[error("failed to encode event `{tag}`: {source}")]
    Encode {
        /// The event tag being encoded.
        tag: String,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A snapshot payload could not be decoded back into aggregate state.
    #[error("failed to decode snapshot for {source_type}: {source}")]
    Snapshot {
        /// The aggregate type whose snapshot failed to decode.
        source_type: AggregateType,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// The parked-event list of a complex aggregate is full.
    #[error("parked foreign event list is full (limit {limit})")]
    ParkedOverflow {
        /// The configured parking capacity.
        limit: usize,
    },
}

impl From<SerializationError> for RehydrationError {
    fn from(err: SerializationError) -> Self {
        match err {
            SerializationError::Encode { kind, source } => Self::Encode { tag: kind, source },
            SerializationError::Decode { kind, source } => Self::Decode { tag: kind, source },
        }
    }
}

/// Errors raised by the event store and its persistence ports.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The aggregate has no persisted events. Raised by `get`; `find`
    /// reports the same condition as `Ok(None)`.
    #[error("aggregate {source_type}/{id} not found")]
    NotFound {
        /// The aggregate type that was requested.
        source_type: AggregateType,
        /// The requested instance id.
        id: SourceId,
    },

    /// Optimistic concurrency control rejected a save: another writer
    /// appended to the stream after this aggregate was loaded.
    #[error(
        "concurrency conflict on {source_type}/{id}: attempted to append \
         version {attempted} but the stream is at version {current}"
    )]
    ConcurrencyConflict {
        /// The aggregate type being saved.
        source_type: AggregateType,
        /// The aggregate instance.
        id: SourceId,
        /// The first pending version the aggregate tried to append.
        attempted: u64,
        /// The last version actually persisted.
        current: u64,
    },

    /// The bus handed to the event store cannot enroll its writes in the
    /// caller's transaction. Fatal at construction.
    #[error("incompatible {bus} bus: it cannot enroll in the store transaction")]
    IncompatibleBus {
        /// Which bus failed the capability check ("event" or "command").
        bus: &'static str,
    },

    /// A payload could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Aggregate state could not be rebuilt from history or snapshot.
    #[error(transparent)]
    Rehydration(#[from] RehydrationError),

    /// A transient backend failure (timeout, dropped connection). Safe to
    /// retry; the command processor and async dispatcher do so.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// A non-transient backend failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Errors raised while registering message handlers.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    /// Two handlers declared the same command tag. Fatal at startup.
    #[error("a handler for command tag `{tag}` is already registered")]
    DuplicateHandler {
        /// The doubly registered command tag.
        tag: String,
    },
}

/// Errors raised while processing a command or dispatching an event.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// No handler is registered for the message's tag. A programming
    /// error: registration happens at startup and is complete by the time
    /// processing begins.
    #[error("no handler registered for tag `{tag}`")]
    NoHandler {
        /// The unroutable tag.
        tag: String,
    },

    /// The handler hit the event store and failed there.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The message body could not be decoded into the handler's type.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// A transient failure outside the store (e.g. a collaborator timeout).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The handler rejected the message for a domain reason.
    #[error("handler failed: {0}")]
    Handler(String),
}

impl ProcessingError {
    /// Whether this failure is an optimistic concurrency conflict.
    ///
    /// The asynchronous event dispatcher treats a conflict as "the event
    /// was already applied by another handler" and stops retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Errors raised by the event-store rebuilder.
#[derive(Debug, Error)]
pub enum RebuildError {
    /// A source log entry could not be deserialized. Fails the whole
    /// rebuild: a partially replayed store is worse than no store.
    #[error("log entry {entry_id} could not be deserialized: {source}")]
    Serialization {
        /// The id of the unreadable log entry.
        entry_id: u64,
        /// The underlying serializer error.
        #[source]
        source: SerializationError,
    },

    /// Replaying a message through its handler failed.
    #[error("replay of log entry {entry_id} failed: {source}")]
    Processing {
        /// The id of the log entry being replayed.
        entry_id: u64,
        /// The underlying processing error.
        #[source]
        source: ProcessingError,
    },

    /// The destination event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Type alias for event store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Type alias for message processing results.
pub type ProcessingResult<T> = Result<T, ProcessingError>;
