//! The durable message log consumed by the rebuilder.
//!
//! Every externally-originated message is appended to this ordered log by
//! the capture pipeline (an external collaborator); the rebuilder replays
//! it front to back. Entries carry a monotonically increasing id and the
//! serialized message text.

use crate::errors::StoreResult;
use crate::message::MessageKind;
use async_trait::async_trait;

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLogEntry {
    /// Monotonically increasing, gap-tolerant log position.
    pub id: u64,
    /// Whether the payload is a command or an event.
    pub kind: MessageKind,
    /// The serialized message, as written by the message serializer.
    pub payload: String,
}

/// Read side of the message log.
///
/// Batched reads keep the rebuild lazy: the log can be far larger than
/// memory, and the rebuilder only ever holds one batch.
#[async_trait]
pub trait MessageLogRead: Send + Sync {
    /// Total number of entries, for progress reporting.
    ///
    /// # Errors
    ///
    /// Returns a store error when the count fails.
    async fn count(&self) -> StoreResult<u64>;

    /// Reads up to `limit` entries with id greater than `after_id`, in
    /// ascending id order.
    ///
    /// # Errors
    ///
    /// Returns a store error when the read fails.
    async fn read_batch(&self, after_id: u64, limit: usize)
        -> StoreResult<Vec<MessageLogEntry>>;
}
