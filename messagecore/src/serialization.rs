//! The serializer contract for logged messages.
//!
//! The message log stores text. The serialized form must be
//! self-describing: it carries the message kind and type tag so the
//! inverse direction can reconstruct the original concrete message without
//! out-of-band knowledge. The concrete syntax is an implementation detail
//! - only round-trip fidelity is contractual - and the shipped
//! implementation is JSON.

use crate::errors::SerializationError;
use crate::message::{CommandEnvelope, MessageKey, MessageKind, VersionedEvent};
use serde::{Deserialize, Serialize};

/// A message as it appears in the durable message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum LoggedMessage {
    /// A logged command.
    Command(CommandEnvelope),
    /// A logged event.
    Event(VersionedEvent),
}

impl LoggedMessage {
    /// Whether this is a command or an event.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Command(_) => MessageKind::Command,
            Self::Event(_) => MessageKind::Event,
        }
    }

    /// The message's stable type tag.
    pub fn tag(&self) -> &str {
        match self {
            Self::Command(command) => &command.tag,
            Self::Event(event) => &event.tag,
        }
    }

    /// The duplicate-detection key.
    pub fn key(&self) -> MessageKey {
        match self {
            Self::Command(command) => command.key(),
            Self::Event(event) => event.key(),
        }
    }
}

/// Text codec for logged messages.
pub trait MessageSerializer: Send + Sync {
    /// Writes the self-describing text form.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Encode`] when the message cannot be written.
    fn serialize(&self, message: &LoggedMessage) -> Result<String, SerializationError>;

    /// Reconstructs the original message from its text form.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Decode`] when the text is not a valid
    /// serialized message.
    fn deserialize(&self, text: &str) -> Result<LoggedMessage, SerializationError>;
}

/// The JSON implementation of the serializer contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageSerializer;

impl JsonMessageSerializer {
    /// Creates the serializer.
    pub fn new() -> Self {
        Self
    }
}

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, message: &LoggedMessage) -> Result<String, SerializationError> {
        serde_json::to_string(message).map_err(|source| SerializationError::Encode {
            kind: message.tag().to_string(),
            source,
        })
    }

    fn deserialize(&self, text: &str) -> Result<LoggedMessage, SerializationError> {
        serde_json::from_str(text).map_err(|source| SerializationError::Decode {
            kind: "message".to_string(),
            source,
        })
    }
}
