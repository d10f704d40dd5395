//! In-memory processed-message audit log.

use async_trait::async_trait;
use messagecore::{
    AuditLog, AuditMetadata, AuditTransaction, MessageKey, StoreError, StoreResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct AuditRows {
    keys: HashSet<MessageKey>,
    metadata: HashMap<MessageKey, AuditMetadata>,
}

/// In-memory audit-log database.
///
/// Each rebuild writes a fresh generation through a transaction; the
/// committed generation survives for inspection. Duplicate checks inside
/// a transaction consult only that transaction's rows - the new audit log
/// starts empty, exactly like the fresh table a real rebuild creates.
#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    committed: Arc<Mutex<AuditRows>>,
}

impl InMemoryAuditLog {
    /// Creates an empty audit log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed audit rows. Test helper.
    pub fn row_count(&self) -> usize {
        self.lock().keys.len()
    }

    /// Whether a key has been committed. Test helper.
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.lock().keys.contains(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuditRows> {
        self.committed.lock().expect("audit lock poisoned")
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn begin(&self) -> StoreResult<Box<dyn AuditTransaction>> {
        Ok(Box::new(MemoryAuditTransaction {
            committed: Arc::clone(&self.committed),
            staged: AuditRows::default(),
            truncate_staged: false,
        }))
    }
}

struct MemoryAuditTransaction {
    committed: Arc<Mutex<AuditRows>>,
    staged: AuditRows,
    truncate_staged: bool,
}

#[async_trait]
impl AuditTransaction for MemoryAuditTransaction {
    async fn is_duplicate(&self, key: &MessageKey) -> StoreResult<bool> {
        Ok(self.staged.keys.contains(key))
    }

    async fn record(&mut self, key: MessageKey, metadata: AuditMetadata) -> StoreResult<()> {
        self.staged.keys.insert(key.clone());
        self.staged.metadata.insert(key, metadata);
        Ok(())
    }

    async fn truncate_previous(&mut self) -> StoreResult<()> {
        self.truncate_staged = true;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut committed = self
            .committed
            .lock()
            .map_err(|_| StoreError::Storage("audit lock poisoned".to_string()))?;
        if self.truncate_staged {
            committed.keys.clear();
            committed.metadata.clear();
        }
        committed.keys.extend(self.staged.keys);
        committed.metadata.extend(self.staged.metadata);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
