//! Snapshot cache for accelerated aggregate loads.
//!
//! A memento is an opaque serialized summary of an aggregate's state at a
//! version; the cache keeps the latest memento per aggregate together with
//! the wall-clock instant it was last refreshed. A memento refreshed within
//! the freshness window can be used without reading the event tail - the
//! single consistency shortcut this system allows, safe because the event
//! store re-verifies versions at every commit. A stale or older entry makes
//! the tail read mandatory.

use crate::types::{AggregateType, SourceId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An opaque snapshot of an aggregate's state at a given version.
///
/// The payload is serialized text only the owning aggregate type can
/// decode; the cache never inspects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memento {
    /// The version the snapshot was taken at.
    pub version: u64,
    /// The opaque serialized state.
    pub payload: String,
}

/// Configuration for the snapshot cache.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// How recently an entry must have been refreshed to skip the event
    /// tail read. The cost of a window that is too long is an optimistic
    /// re-save, never a wrong answer.
    pub freshness_window: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    memento: Memento,
    refreshed_at: Option<Instant>,
}

/// A memento retrieved from the cache, with its freshness verdict.
#[derive(Debug, Clone)]
pub struct CachedMemento {
    /// The cached snapshot.
    pub memento: Memento,
    /// Whether the entry was refreshed within the freshness window. Fresh
    /// entries may be used alone; anything else requires the tail read.
    pub fresh: bool,
}

/// Keyed store `(aggregate type, id) → (memento, last refresh)`.
///
/// Shared across processing rounds; a mutex around the map is sufficient
/// because correctness never depends on the cache - the event store always
/// verifies versions at commit.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: Mutex<HashMap<(AggregateType, SourceId), Entry>>,
    config: SnapshotConfig,
}

impl SnapshotCache {
    /// Creates a cache with the default 1-second freshness window.
    pub fn new() -> Self {
        Self::with_config(SnapshotConfig::default())
    }

    /// Creates a cache with an explicit configuration.
    pub fn with_config(config: SnapshotConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Looks up the memento for an aggregate, reporting whether it is
    /// fresh enough to use without a tail read.
    pub fn get(&self, source_type: &AggregateType, id: SourceId) -> Option<CachedMemento> {
        let entries = self.entries.lock().expect("snapshot cache lock poisoned");
        entries
            .get(&(source_type.clone(), id))
            .map(|entry| CachedMemento {
                memento: entry.memento.clone(),
                fresh: entry
                    .refreshed_at
                    .is_some_and(|at| at.elapsed() <= self.config.freshness_window),
            })
    }

    /// Stores a memento and stamps the refresh time with the current
    /// wall clock. Called after a successful commit.
    pub fn set(&self, source_type: &AggregateType, id: SourceId, memento: Memento) {
        let mut entries = self.entries.lock().expect("snapshot cache lock poisoned");
        entries.insert(
            (source_type.clone(), id),
            Entry {
                memento,
                refreshed_at: Some(Instant::now()),
            },
        );
    }

    /// Marks an entry stale so the next load bypasses the freshness
    /// shortcut. Called after any failed save. A missing entry is fine:
    /// there is nothing to distrust.
    pub fn mark_stale(&self, source_type: &AggregateType, id: SourceId) {
        let mut entries = self.entries.lock().expect("snapshot cache lock poisoned");
        if let Some(entry) = entries.get_mut(&(source_type.clone(), id)) {
            entry.refreshed_at = None;
        }
    }

    /// Drops every entry. Used by the rebuilder when it truncates the
    /// snapshots table.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("snapshot cache lock poisoned")
            .clear();
    }
}
