//! The event-sourced aggregate base.
//!
//! An aggregate's state is fully determined by the ordered sequence of its
//! events. [`EventSourcedRoot`] is the bookkeeping half every aggregate
//! embeds: it tracks identity, the last applied version, the pending
//! (not-yet-persisted) events, and the rehydrator table that maps event
//! tags to state-mutation functions.
//!
//! Rehydrators are registered explicitly in the aggregate's constructor -
//! a missing rehydrator for an applied event is a programming error and
//! surfaces as a fatal [`RehydrationError::MissingRehydrator`].

use crate::errors::{RehydrationError, SerializationError};
use crate::message::{CommandEnvelope, DomainEvent, VersionedEvent};
use crate::snapshot::Memento;
use crate::types::{AggregateType, EventVersion, SourceId, Timestamp};
use serde_json::Value;
use std::collections::HashMap;

type RehydrateFn<S> = Box<dyn Fn(&mut S, &Value) -> Result<(), RehydrationError> + Send + Sync>;

/// Table mapping event tags to typed state-mutation functions.
///
/// Populated once in the aggregate's constructor via [`register`](Self::register);
/// lookups happen on every applied event, both during replay and when new
/// events are emitted.
pub struct Rehydrators<S> {
    table: HashMap<&'static str, RehydrateFn<S>>,
}

impl<S: 'static> Rehydrators<S> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Registers the rehydrator for event type `E`.
    ///
    /// The function receives the decoded, typed event. A later registration
    /// for the same tag replaces the earlier one; aggregates register each
    /// tag exactly once in their constructor.
    pub fn register<E: DomainEvent + 'static>(&mut self, apply: fn(&mut S, E)) {
        self.table.insert(
            E::TAG,
            Box::new(move |state, body| {
                let event: E = serde_json::from_value(body.clone()).map_err(|source| {
                    RehydrationError::Decode {
                        tag: E::TAG.to_string(),
                        source,
                    }
                })?;
                apply(state, event);
                Ok(())
            }),
        );
    }

    fn apply(&self, state: &mut S, tag: &str, body: &Value) -> Result<(), RehydrationError> {
        let rehydrate =
            self.table
                .get(tag)
                .ok_or_else(|| RehydrationError::MissingRehydrator {
                    tag: tag.to_string(),
                })?;
        rehydrate(state, body)
    }
}

impl<S: 'static> Default for Rehydrators<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for Rehydrators<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.table.keys().collect();
        tags.sort();
        f.debug_struct("Rehydrators").field("tags", &tags).finish()
    }
}

/// Identity, version, and pending-event bookkeeping for one aggregate.
///
/// The aggregate type embeds a root next to its domain state `S`:
///
/// - applying an event from history increments the version without
///   touching the pending list ([`load_from`](Self::load_from));
/// - emitting a new event increments the version, runs the rehydrator,
///   and appends to the pending list ([`update`](Self::update));
/// - the event store drains the pending list on save
///   ([`drain_pending`](Self::drain_pending)).
#[derive(Debug)]
pub struct EventSourcedRoot<S> {
    id: SourceId,
    source_type: AggregateType,
    version: u64,
    pending: Vec<VersionedEvent>,
    rehydrators: Rehydrators<S>,
}

impl<S: 'static> EventSourcedRoot<S> {
    /// Creates the root for a fresh aggregate at version 0.
    pub fn new(source_type: AggregateType, id: SourceId, rehydrators: Rehydrators<S>) -> Self {
        Self {
            id,
            source_type,
            version: 0,
            pending: Vec::new(),
            rehydrators,
        }
    }

    /// The aggregate instance id.
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// The aggregate kind.
    pub fn source_type(&self) -> &AggregateType {
        &self.source_type
    }

    /// The last applied version; 0 for a fresh aggregate.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The events emitted since the last save, in emission order.
    pub fn pending(&self) -> &[VersionedEvent] {
        &self.pending
    }

    /// Replays historical events in ascending version order.
    ///
    /// Each event's version must equal the previously applied version
    /// plus one. Does not emit: the pending list is untouched.
    ///
    /// # Errors
    ///
    /// [`RehydrationError::VersionGap`] when the history is not contiguous,
    /// [`RehydrationError::MissingRehydrator`] when an event has no
    /// registered rehydrator, or a decode failure for a corrupt payload.
    /// All of these indicate corrupted history or a programming error.
    pub fn load_from(
        &mut self,
        state: &mut S,
        history: impl IntoIterator<Item = VersionedEvent>,
    ) -> Result<(), RehydrationError> {
        for event in history {
            let found = u64::from(event.version);
            if found != self.version + 1 {
                return Err(RehydrationError::VersionGap {
                    source_type: self.source_type.clone(),
                    id: self.id,
                    expected: self.version + 1,
                    found,
                });
            }
            self.rehydrators.apply(state, &event.tag, &event.body)?;
            self.version = found;
        }
        Ok(())
    }

    /// Restores the root position from a snapshot taken at `version`.
    ///
    /// The caller decodes the memento payload into `S` itself; this only
    /// fast-forwards the version counter so a subsequent
    /// [`load_from`](Self::load_from) can replay the tail.
    pub fn restore_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Emits a new event: stamps it with this aggregate's identity and the
    /// next version, runs the matching rehydrator, and appends it to the
    /// pending list.
    ///
    /// # Errors
    ///
    /// [`RehydrationError::Encode`] if the event body cannot be serialized,
    /// or any rehydration failure from applying the event to `state`.
    pub fn update<E: DomainEvent>(
        &mut self,
        state: &mut S,
        event: E,
    ) -> Result<(), RehydrationError> {
        let body = serde_json::to_value(&event).map_err(|source| RehydrationError::Encode {
            tag: E::TAG.to_string(),
            source,
        })?;
        let versioned = VersionedEvent {
            source_id: self.id,
            source_type: self.source_type.clone(),
            version: EventVersion::after(self.version),
            tag: E::TAG.to_string(),
            body,
            correlation_id: None,
            created_at: Timestamp::now(),
        };
        self.rehydrators
            .apply(state, &versioned.tag, &versioned.body)?;
        self.pending.push(versioned);
        self.version += 1;
        Ok(())
    }

    /// Returns the pending events in insertion order and clears the list.
    ///
    /// Used by the event store only; after a successful save the aggregate
    /// instance is discarded.
    pub fn drain_pending(&mut self) -> Vec<VersionedEvent> {
        std::mem::take(&mut self.pending)
    }
}

/// An aggregate whose state is derived from its event history.
///
/// Implementations embed an [`EventSourcedRoot`] and forward the identity
/// and lifecycle methods to it. Construction happens one of three ways:
/// fresh with a new id, from a full event history, or (for
/// [`MementoOriginator`]s) from a snapshot plus an event tail.
pub trait EventSourced: Send + Sized {
    /// The aggregate kind, shared by every instance of this type.
    fn source_type() -> AggregateType;

    /// This instance's id.
    fn id(&self) -> SourceId;

    /// The last applied version; 0 for a fresh aggregate.
    fn version(&self) -> u64;

    /// Reconstructs an instance by replaying its full history.
    ///
    /// # Errors
    ///
    /// Any [`RehydrationError`] from the replay; see
    /// [`EventSourcedRoot::load_from`].
    fn from_history(
        id: SourceId,
        history: Vec<VersionedEvent>,
    ) -> Result<Self, RehydrationError>;

    /// Returns the pending events in emission order and clears them.
    fn drain_pending(&mut self) -> Vec<VersionedEvent>;

    /// The saga capability: aggregates that also accumulate commands
    /// return themselves here so the event store can co-publish those
    /// commands in the save transaction. The default is "not a saga".
    fn as_command_emitter(&mut self) -> Option<&mut dyn CommandEmitter> {
        None
    }
}

/// An aggregate that can summarize its state into an opaque memento and be
/// rebuilt from one plus an event tail.
///
/// Only the owning aggregate type knows how to decode its memento; the
/// snapshot cache treats the payload as opaque text.
pub trait MementoOriginator: EventSourced {
    /// Captures the current state at the current version.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Encode`] if the state cannot be serialized.
    fn to_memento(&self) -> Result<Memento, SerializationError>;

    /// Rebuilds an instance from a memento and the events persisted after
    /// it, in ascending version order.
    ///
    /// # Errors
    ///
    /// [`RehydrationError::Snapshot`] if the memento payload does not
    /// decode, or any replay failure from the tail.
    fn from_memento(
        id: SourceId,
        memento: &Memento,
        tail: Vec<VersionedEvent>,
    ) -> Result<Self, RehydrationError>;
}

/// Capability of saga-style aggregates: commands accumulated during event
/// handling, to be co-published with the next save.
pub trait CommandEmitter {
    /// Returns the pending commands in emission order and clears them.
    fn drain_pending_commands(&mut self) -> Vec<CommandEnvelope>;
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{Inventory, ItemsAdded};
    use super::*;
    use crate::types::CorrelationId;

    #[test]
    fn update_stamps_identity_and_contiguous_versions() {
        let id = SourceId::new();
        let mut aggregate = Inventory::fresh(id);
        aggregate.add(1, 10);
        aggregate.add(2, 5);

        assert_eq!(aggregate.root.version(), 2);
        let pending = aggregate.root.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].source_id, id);
        assert_eq!(u64::from(pending[0].version), 1);
        assert_eq!(u64::from(pending[1].version), 2);
        assert_eq!(pending[0].tag, ItemsAdded::TAG);
    }

    #[test]
    fn update_applies_the_rehydrator_immediately() {
        let mut aggregate = Inventory::fresh(SourceId::new());
        aggregate.add(1, 10);
        aggregate.add(1, 5);
        assert_eq!(aggregate.state.quantities[&1], 15);
    }

    #[test]
    fn drain_pending_returns_in_insertion_order_and_clears() {
        let mut aggregate = Inventory::fresh(SourceId::new());
        aggregate.add(1, 10);
        aggregate.add(2, 5);

        let drained = aggregate.root.drain_pending();
        assert_eq!(drained.len(), 2);
        assert_eq!(u64::from(drained[0].version), 1);
        assert!(aggregate.root.pending().is_empty());
        // Draining does not roll back the version counter.
        assert_eq!(aggregate.root.version(), 2);
    }

    #[test]
    fn load_from_replays_without_emitting() {
        let id = SourceId::new();
        let mut writer = Inventory::fresh(id);
        writer.add(1, 10);
        writer.add(2, 5);
        writer.add(1, 5);
        let history = writer.root.drain_pending();

        let replayed = Inventory::from_history(id, history).unwrap();
        assert_eq!(replayed.root.version(), 3);
        assert!(replayed.root.pending().is_empty());
        assert_eq!(replayed.state.quantities[&1], 15);
        assert_eq!(replayed.state.quantities[&2], 5);
    }

    #[test]
    fn load_from_rejects_a_version_gap() {
        let id = SourceId::new();
        let mut writer = Inventory::fresh(id);
        writer.add(1, 10);
        writer.add(2, 5);
        let mut history = writer.root.drain_pending();
        history.remove(0);

        let err = Inventory::from_history(id, history).unwrap_err();
        match err {
            RehydrationError::VersionGap {
                expected, found, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected VersionGap, got {other:?}"),
        }
    }

    #[test]
    fn load_from_fails_on_unregistered_event_tag() {
        let id = SourceId::new();
        let mut writer = Inventory::fresh(id);
        writer.add(1, 10);
        let mut history = writer.root.drain_pending();
        history[0].tag = "unknown-event".to_string();

        let err = Inventory::from_history(id, history).unwrap_err();
        assert!(matches!(
            err,
            RehydrationError::MissingRehydrator { ref tag } if tag == "unknown-event"
        ));
    }

    #[test]
    fn new_events_carry_no_correlation_until_saved() {
        let mut aggregate = Inventory::fresh(SourceId::new());
        aggregate.add(1, 1);
        let correlation: Option<&CorrelationId> =
            aggregate.root.pending()[0].correlation_id.as_ref();
        assert!(correlation.is_none());
    }

    #[test]
    fn aggregates_are_not_sagas_by_default() {
        let mut aggregate = Inventory::fresh(SourceId::new());
        assert!(aggregate.as_command_emitter().is_none());
    }

    #[test]
    fn restore_version_fast_forwards_replay() {
        let id = SourceId::new();
        let mut writer = Inventory::fresh(id);
        writer.add(1, 10);
        writer.add(1, 5);
        let history = writer.root.drain_pending();
        let tail = vec![history[1].clone()];

        let mut aggregate = Inventory::fresh(id);
        aggregate.state.quantities.insert(1, 10);
        aggregate.root.restore_version(1);
        aggregate.root.load_from(&mut aggregate.state, tail).unwrap();
        assert_eq!(aggregate.root.version(), 2);
        assert_eq!(aggregate.state.quantities[&1], 15);
    }
}
