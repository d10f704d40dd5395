//! The message audit log: duplicate detection for replay.
//!
//! A durable table of processed-message keys. A command is a duplicate of
//! another when their ids match; an event is a duplicate when it occupies
//! the same `(source type, source id, version)` position. The rebuilder
//! consults the log before applying each message so replaying a log twice
//! cannot apply anything twice.

use crate::errors::StoreResult;
use crate::message::{MessageKey, MessageKind};
use crate::types::{CorrelationId, Timestamp};
use async_trait::async_trait;

/// Indexable metadata recorded alongside a processed-message key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditMetadata {
    /// Whether the message was a command or an event.
    pub kind: MessageKind,
    /// The message's stable type tag.
    pub tag: String,
    /// The correlation id the message carried, if any.
    pub correlation_id: Option<CorrelationId>,
    /// When the message was created.
    pub created_at: Timestamp,
}

/// Port to the audit-log database.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Opens a transaction over the audit database.
    ///
    /// # Errors
    ///
    /// Returns a store error when the transaction cannot be opened.
    async fn begin(&self) -> StoreResult<Box<dyn AuditTransaction>>;
}

/// An open audit-log transaction.
///
/// Duplicate checks see both committed rows and rows recorded earlier in
/// this same transaction - during a rebuild the duplicate filter must
/// cover the messages replayed moments ago, long before anything commits.
#[async_trait]
pub trait AuditTransaction: Send {
    /// Whether the key has already been recorded.
    ///
    /// # Errors
    ///
    /// Returns a store error when the lookup fails.
    async fn is_duplicate(&self, key: &MessageKey) -> StoreResult<bool>;

    /// Records a processed-message key with its metadata.
    ///
    /// # Errors
    ///
    /// Returns a store error when the write cannot be staged.
    async fn record(&mut self, key: MessageKey, metadata: AuditMetadata) -> StoreResult<()>;

    /// Stages truncation of the previous generation's audit table and
    /// reseeds its identity. Used by the rebuilder only.
    ///
    /// # Errors
    ///
    /// Returns a store error when the truncation cannot be staged.
    async fn truncate_previous(&mut self) -> StoreResult<()>;

    /// Atomically applies every staged write.
    ///
    /// # Errors
    ///
    /// Returns a store error when the commit fails.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards every staged write.
    ///
    /// # Errors
    ///
    /// Returns a store error when the backend rollback itself fails.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
