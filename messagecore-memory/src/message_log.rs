//! In-memory durable message log.

use async_trait::async_trait;
use messagecore::{MessageKind, MessageLogEntry, MessageLogRead, StoreResult};
use std::sync::{Arc, Mutex};

/// In-memory message log with auto-incrementing ids.
///
/// The capture side (appending every externally-originated message) is an
/// external collaborator in production; here [`append`](Self::append)
/// stands in for it so tests and rebuild runs can seed a log.
#[derive(Clone, Default)]
pub struct InMemoryMessageLog {
    entries: Arc<Mutex<Vec<MessageLogEntry>>>,
}

impl InMemoryMessageLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a serialized message, returning its assigned id.
    pub fn append(&self, kind: MessageKind, payload: impl Into<String>) -> u64 {
        let mut entries = self.lock();
        let id = entries.last().map_or(1, |entry| entry.id + 1);
        entries.push(MessageLogEntry {
            id,
            kind,
            payload: payload.into(),
        });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MessageLogEntry>> {
        self.entries.lock().expect("message log lock poisoned")
    }
}

#[async_trait]
impl MessageLogRead for InMemoryMessageLog {
    async fn count(&self) -> StoreResult<u64> {
        Ok(self.lock().len() as u64)
    }

    async fn read_batch(
        &self,
        after_id: u64,
        limit: usize,
    ) -> StoreResult<Vec<MessageLogEntry>> {
        Ok(self
            .lock()
            .iter()
            .filter(|entry| entry.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appended_entries_get_increasing_ids() {
        let log = InMemoryMessageLog::new();
        let first = log.append(MessageKind::Command, "a");
        let second = log.append(MessageKind::Event, "b");
        assert!(second > first);
        assert_eq!(log.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn batches_read_in_ascending_id_order() {
        let log = InMemoryMessageLog::new();
        for i in 0..10 {
            log.append(MessageKind::Command, format!("m{i}"));
        }

        let first = log.read_batch(0, 4).await.unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.id).collect();
        assert_eq!(ids, [1, 2, 3, 4]);

        let rest = log.read_batch(4, 100).await.unwrap();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].id, 5);
    }

    #[tokio::test]
    async fn reading_past_the_end_is_empty() {
        let log = InMemoryMessageLog::new();
        log.append(MessageKind::Command, "only");
        assert!(log.read_batch(1, 10).await.unwrap().is_empty());
    }
}
