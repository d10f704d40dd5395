//! Message types: commands, versioned events, and delivery envelopes.
//!
//! At the infrastructure boundary every message travels in a type-erased
//! wire form - a stable type *tag* plus a `serde_json::Value` body - so the
//! buses, processor, dispatcher, and rebuilder never need to know concrete
//! domain types. Domain code works with typed values implementing
//! [`DomainCommand`] or [`DomainEvent`] and converts at the edges.

use crate::errors::SerializationError;
use crate::types::{AggregateType, CorrelationId, EventVersion, MessageId, SourceId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a message is a command (one target) or an event (no target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An instruction to a single aggregate.
    Command,
    /// A fact published by an aggregate.
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// A typed command that can be routed by its stable tag.
///
/// The tag is the registry key for handler dispatch; it must be unique
/// across the application and stable across releases (it is persisted in
/// the message log).
pub trait DomainCommand: Serialize + DeserializeOwned {
    /// Stable type tag, e.g. `"add-items"`.
    const TAG: &'static str;
}

/// A typed domain event that an aggregate can emit and rehydrate from.
///
/// As with commands, the tag is the stable registry key: rehydrators and
/// event handlers are looked up by it, and it is persisted in the
/// `EventType` column of the events table.
pub trait DomainEvent: Serialize + DeserializeOwned {
    /// Stable type tag, e.g. `"items-added"`.
    const TAG: &'static str;
}

/// Wire form of a command: identity, routing tag, and serialized body.
///
/// The target aggregate is part of the body; routing uses only the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Unique identity of this command.
    pub command_id: MessageId,
    /// Stable type tag used for handler lookup.
    pub tag: String,
    /// Serialized command body.
    pub body: Value,
    /// When the command was created.
    pub created_at: Timestamp,
}

impl CommandEnvelope {
    /// Wraps a typed command into its wire form with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Encode`] if the body cannot be
    /// serialized.
    pub fn wrap<C: DomainCommand>(command: &C) -> Result<Self, SerializationError> {
        let body = serde_json::to_value(command).map_err(|source| SerializationError::Encode {
            kind: C::TAG.to_string(),
            source,
        })?;
        Ok(Self {
            command_id: MessageId::new(),
            tag: C::TAG.to_string(),
            body,
            created_at: Timestamp::now(),
        })
    }

    /// Decodes the body back into its typed command.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] if the body does not match
    /// the target type.
    pub fn decode<C: DomainCommand>(&self) -> Result<C, SerializationError> {
        serde_json::from_value(self.body.clone()).map_err(|source| SerializationError::Decode {
            kind: self.tag.clone(),
            source,
        })
    }

    /// The duplicate-detection key for this command: its id.
    pub fn key(&self) -> MessageKey {
        MessageKey::Command {
            id: self.command_id,
        }
    }
}

/// Wire form of an event emitted by an aggregate.
///
/// `(source_type, source_id, version)` identifies the event globally; the
/// version sequence per source is contiguous from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEvent {
    /// The aggregate instance that emitted the event.
    pub source_id: SourceId,
    /// The kind of the emitting aggregate.
    pub source_type: AggregateType,
    /// Position of the event in its source stream.
    pub version: EventVersion,
    /// Stable type tag used for rehydrator and handler lookup.
    pub tag: String,
    /// Serialized event body.
    pub body: Value,
    /// Identity of the command that (transitively) caused this event.
    /// Stamped by the event store at save time.
    pub correlation_id: Option<CorrelationId>,
    /// When the event was created.
    pub created_at: Timestamp,
}

impl VersionedEvent {
    /// Decodes the body back into its typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::Decode`] if the body does not match
    /// the target type.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, SerializationError> {
        serde_json::from_value(self.body.clone()).map_err(|source| SerializationError::Decode {
            kind: self.tag.clone(),
            source,
        })
    }

    /// The duplicate-detection key for this event: its stream coordinates.
    pub fn key(&self) -> MessageKey {
        MessageKey::Event {
            source_type: self.source_type.clone(),
            source_id: self.source_id,
            version: self.version,
        }
    }
}

/// Identity used for duplicate detection in the audit log.
///
/// Two commands are duplicates when their ids match; two events are
/// duplicates when they occupy the same position of the same stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKey {
    /// A command, identified by its id.
    Command {
        /// The command's unique id.
        id: MessageId,
    },
    /// An event, identified by its stream coordinates.
    Event {
        /// The emitting aggregate's kind.
        source_type: AggregateType,
        /// The emitting aggregate instance.
        source_id: SourceId,
        /// The event's position in its stream.
        version: EventVersion,
    },
}

/// A message plus delivery metadata.
///
/// The envelope is what handlers actually receive: the body, the delivery
/// `message_id`, the correlation id threading back to the originating
/// command, and a human-readable trace line for diagnostics.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// The wrapped message.
    pub body: T,
    /// Delivery identity of this envelope.
    pub message_id: MessageId,
    /// Identity of the originating command, when known.
    pub correlation_id: Option<CorrelationId>,
    /// Human-readable description of the delivery, for tracing.
    pub trace_text: String,
}

impl Envelope<CommandEnvelope> {
    /// Wraps a command for delivery. The envelope reuses the command's own
    /// id as its delivery id; commands are correlation roots, so no
    /// correlation id is attached.
    pub fn for_command(command: CommandEnvelope) -> Self {
        let trace_text = format!("command `{}` ({})", command.tag, command.command_id);
        Self {
            message_id: command.command_id,
            correlation_id: None,
            trace_text,
            body: command,
        }
    }
}

impl Envelope<VersionedEvent> {
    /// Wraps an event for delivery with a fresh delivery id, carrying the
    /// event's correlation id forward.
    pub fn for_event(event: VersionedEvent) -> Self {
        let trace_text = format!(
            "event `{}` v{} of {}/{}",
            event.tag, event.version, event.source_type, event.source_id
        );
        Self {
            message_id: MessageId::new(),
            correlation_id: event.correlation_id.clone(),
            trace_text,
            body: event,
        }
    }
}
