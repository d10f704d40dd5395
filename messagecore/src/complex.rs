//! Cross-aggregate event consumption with ordering and idempotency.
//!
//! A complex aggregate consumes versioned events from *foreign* streams -
//! streams owned by other aggregates - and must see each foreign stream
//! exactly once, strictly in version order, no matter how the transport
//! delivers them. [`ForeignStreamTracker`] keeps the per-stream high-water
//! marks and a bounded list of *parked* events that arrived early; the
//! [`ComplexEventSourced::try_process_foreign`] algorithm decides, for each
//! incoming event, whether it is a duplicate, the next in line, or early.
//!
//! Both decisions are themselves recorded as ordinary domain events
//! ([`ForeignEventProcessed`], [`ForeignEventParked`]), so replaying the
//! aggregate's history reconstructs the tracker exactly.

use crate::aggregate::EventSourced;
use crate::errors::RehydrationError;
use crate::message::{DomainEvent, VersionedEvent};
use crate::types::{AggregateType, EventVersion, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on the parked-event list. Exceeding it fails the consume
/// rather than growing without limit; a stream that runs this far ahead
/// points at a publisher bug.
pub const MAX_PARKED: usize = 64;

/// Identity of one foreign event stream as seen by a consumer:
/// the emitting aggregate's kind and id, narrowed to one event tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignStreamKey {
    /// The emitting aggregate's kind.
    pub source_type: AggregateType,
    /// The emitting aggregate instance.
    pub source_id: SourceId,
    /// The consumed event tag.
    pub tag: String,
}

impl ForeignStreamKey {
    /// The stream key of a versioned event.
    pub fn of(event: &VersionedEvent) -> Self {
        Self {
            source_type: event.source_type.clone(),
            source_id: event.source_id,
            tag: event.tag.clone(),
        }
    }
}

/// Bookkeeping event: a foreign event was handed to the domain handler.
///
/// Rehydrating it advances the stream's high-water mark and removes any
/// parked copy of the same `(stream, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignEventProcessed {
    /// The foreign stream the event belongs to.
    pub key: ForeignStreamKey,
    /// The processed version.
    pub version: EventVersion,
}

impl DomainEvent for ForeignEventProcessed {
    const TAG: &'static str = "foreign-event-processed";
}

/// Bookkeeping event: a foreign event arrived early and was parked.
///
/// Rehydrating it appends the event to the parked list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignEventParked {
    /// The early event, stored verbatim for later replay.
    pub event: VersionedEvent,
}

impl DomainEvent for ForeignEventParked {
    const TAG: &'static str = "foreign-event-parked";
}

/// Per-stream consumption state: high-water marks and parked events.
///
/// Lives inside the complex aggregate's state and is mutated exclusively
/// through the rehydrators for the two bookkeeping events, which keeps the
/// tracker a pure function of the aggregate's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForeignStreamTracker {
    /// Keyed by a struct, which JSON maps cannot express, so the map
    /// travels as a sorted entry list.
    #[serde(with = "stream_positions")]
    last_processed: HashMap<ForeignStreamKey, u64>,
    parked: Vec<VersionedEvent>,
}

mod stream_positions {
    use super::ForeignStreamKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub(super) fn serialize<S>(
        map: &HashMap<ForeignStreamKey, u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut entries: Vec<(&ForeignStreamKey, &u64)> = map.iter().collect();
        entries.sort_by_key(|(key, _)| {
            (key.source_type.clone(), key.source_id, key.tag.clone())
        });
        entries.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<HashMap<ForeignStreamKey, u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries: Vec<(ForeignStreamKey, u64)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

impl ForeignStreamTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest processed version for a stream; 0 when the stream has
    /// never been seen.
    pub fn last_processed(&self, key: &ForeignStreamKey) -> u64 {
        self.last_processed.get(key).copied().unwrap_or(0)
    }

    /// The currently parked events, in arrival order.
    pub fn parked(&self) -> &[VersionedEvent] {
        &self.parked
    }

    /// Whether an identical `(stream, version)` is already parked.
    pub fn is_parked(&self, key: &ForeignStreamKey, version: EventVersion) -> bool {
        self.parked
            .iter()
            .any(|parked| parked.version == version && ForeignStreamKey::of(parked) == *key)
    }

    /// The first parked event whose turn has come: its version directly
    /// follows its stream's high-water mark.
    pub fn next_in_order(&self) -> Option<&VersionedEvent> {
        self.parked.iter().find(|parked| {
            u64::from(parked.version) == self.last_processed(&ForeignStreamKey::of(parked)) + 1
        })
    }

    /// Rehydrator for [`ForeignEventProcessed`]: advance the high-water
    /// mark and drop any parked copy of the processed position.
    pub fn apply_processed(&mut self, event: ForeignEventProcessed) {
        let version = u64::from(event.version);
        self.last_processed.insert(event.key.clone(), version);
        self.parked.retain(|parked| {
            parked.version != event.version || ForeignStreamKey::of(parked) != event.key
        });
    }

    /// Rehydrator for [`ForeignEventParked`]: append to the parked list.
    pub fn apply_parked(&mut self, event: ForeignEventParked) {
        self.parked.push(event.event);
    }
}

/// Outcome of offering a foreign event to a complex aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignOutcome {
    /// The event (and possibly a run of parked successors) was handed to
    /// the domain handler.
    Processed,
    /// The event was already processed or already parked; nothing changed.
    Duplicate,
    /// The event arrived early and was parked for later.
    Parked,
}

/// An event-sourced aggregate that additionally consumes foreign streams.
///
/// Implementors supply access to their [`ForeignStreamTracker`], the domain
/// reaction to an in-order foreign event, and a way to record bookkeeping
/// events through their event-sourced root. The ordering algorithm itself
/// is the provided [`try_process_foreign`](Self::try_process_foreign).
pub trait ComplexEventSourced: EventSourced {
    /// The tracker embedded in this aggregate's state.
    fn tracker(&self) -> &ForeignStreamTracker;

    /// Domain reaction to an in-order foreign event. Called exactly once
    /// per `(stream, version)`, strictly in version order.
    ///
    /// # Errors
    ///
    /// Any rehydration failure, e.g. a body that does not decode.
    fn apply_foreign(&mut self, event: &VersionedEvent) -> Result<(), RehydrationError>;

    /// Records a bookkeeping event through the aggregate's root, exactly
    /// like any other domain event (stamped, applied, appended to pending).
    ///
    /// # Errors
    ///
    /// Any failure from the root's update path.
    fn record<E: DomainEvent>(&mut self, event: E) -> Result<(), RehydrationError>;

    /// Offers a foreign event to the aggregate.
    ///
    /// - A version at or below the stream's high-water mark is a
    ///   [`ForeignOutcome::Duplicate`] and has no side effects.
    /// - The directly following version is processed, recorded, and any
    ///   parked events that become in-order are drained the same way.
    /// - A later version is parked, unless an identical one already is.
    ///
    /// # Errors
    ///
    /// [`RehydrationError::ParkedOverflow`] when the parked list is full,
    /// or any failure from the domain handler or the recording path.
    fn try_process_foreign(
        &mut self,
        event: VersionedEvent,
    ) -> Result<ForeignOutcome, RehydrationError> {
        let key = ForeignStreamKey::of(&event);
        let version = u64::from(event.version);
        let last = self.tracker().last_processed(&key);

        if version <= last {
            return Ok(ForeignOutcome::Duplicate);
        }

        if version == last + 1 {
            self.apply_foreign(&event)?;
            self.record(ForeignEventProcessed {
                key,
                version: event.version,
            })?;
            // Processing may have made parked successors eligible.
            while let Some(parked) = self.tracker().next_in_order().cloned() {
                self.apply_foreign(&parked)?;
                self.record(ForeignEventProcessed {
                    key: ForeignStreamKey::of(&parked),
                    version: parked.version,
                })?;
            }
            return Ok(ForeignOutcome::Processed);
        }

        if self.tracker().is_parked(&key, event.version) {
            return Ok(ForeignOutcome::Duplicate);
        }
        if self.tracker().parked().len() >= MAX_PARKED {
            return Err(RehydrationError::ParkedOverflow { limit: MAX_PARKED });
        }
        self.record(ForeignEventParked { event })?;
        Ok(ForeignOutcome::Parked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{EventSourcedRoot, Rehydrators};
    use crate::types::Timestamp;

    /// A settlement tracker consuming `order-placed` events from order
    /// aggregates, counting the total quantity it has seen.
    #[derive(Debug)]
    struct Settlement {
        root: EventSourcedRoot<SettlementState>,
        state: SettlementState,
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct SettlementState {
        tracker: ForeignStreamTracker,
        seen_quantity: i64,
        order: Vec<u64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        quantity: i64,
    }

    impl DomainEvent for OrderPlaced {
        const TAG: &'static str = "order-placed";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ForeignApplied {
        quantity: i64,
        version: u64,
    }

    impl DomainEvent for ForeignApplied {
        const TAG: &'static str = "settlement-foreign-applied";
    }

    impl Settlement {
        fn source_type() -> AggregateType {
            AggregateType::try_new("settlement").unwrap()
        }

        fn rehydrators() -> Rehydrators<SettlementState> {
            let mut rehydrators = Rehydrators::new();
            rehydrators.register::<ForeignEventProcessed>(|state: &mut SettlementState, event| {
                state.tracker.apply_processed(event);
            });
            rehydrators.register::<ForeignEventParked>(|state: &mut SettlementState, event| {
                state.tracker.apply_parked(event);
            });
            rehydrators.register::<ForeignApplied>(|state: &mut SettlementState, event| {
                state.seen_quantity += event.quantity;
                state.order.push(event.version);
            });
            rehydrators
        }

        fn fresh(id: SourceId) -> Self {
            Self {
                root: EventSourcedRoot::new(Self::source_type(), id, Self::rehydrators()),
                state: SettlementState::default(),
            }
        }
    }

    impl EventSourced for Settlement {
        fn source_type() -> AggregateType {
            Settlement::source_type()
        }

        fn id(&self) -> SourceId {
            self.root.id()
        }

        fn version(&self) -> u64 {
            self.root.version()
        }

        fn from_history(
            id: SourceId,
            history: Vec<VersionedEvent>,
        ) -> Result<Self, RehydrationError> {
            let mut aggregate = Self::fresh(id);
            aggregate.root.load_from(&mut aggregate.state, history)?;
            Ok(aggregate)
        }

        fn drain_pending(&mut self) -> Vec<VersionedEvent> {
            self.root.drain_pending()
        }
    }

    impl ComplexEventSourced for Settlement {
        fn tracker(&self) -> &ForeignStreamTracker {
            &self.state.tracker
        }

        fn apply_foreign(&mut self, event: &VersionedEvent) -> Result<(), RehydrationError> {
            let placed: OrderPlaced = event.decode()?;
            self.record(ForeignApplied {
                quantity: placed.quantity,
                version: u64::from(event.version),
            })
        }

        fn record<E: DomainEvent>(&mut self, event: E) -> Result<(), RehydrationError> {
            self.root.update(&mut self.state, event)
        }
    }

    fn foreign_event(order_id: SourceId, version: u64, quantity: i64) -> VersionedEvent {
        VersionedEvent {
            source_id: order_id,
            source_type: AggregateType::try_new("order").unwrap(),
            version: EventVersion::try_new(version).unwrap(),
            tag: OrderPlaced::TAG.to_string(),
            body: serde_json::to_value(OrderPlaced { quantity }).unwrap(),
            correlation_id: None,
            created_at: Timestamp::now(),
        }
    }

    #[test]
    fn in_order_events_are_processed_immediately() {
        let order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());

        let outcome = settlement
            .try_process_foreign(foreign_event(order, 1, 10))
            .unwrap();
        assert_eq!(outcome, ForeignOutcome::Processed);
        assert_eq!(settlement.state.seen_quantity, 10);
        let key = ForeignStreamKey::of(&foreign_event(order, 1, 10));
        assert_eq!(settlement.tracker().last_processed(&key), 1);
    }

    #[test]
    fn early_events_are_parked_and_drained_when_the_gap_fills() {
        let order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());

        let parked = settlement
            .try_process_foreign(foreign_event(order, 2, 20))
            .unwrap();
        assert_eq!(parked, ForeignOutcome::Parked);
        assert_eq!(settlement.state.seen_quantity, 0);
        assert_eq!(settlement.tracker().parked().len(), 1);

        let processed = settlement
            .try_process_foreign(foreign_event(order, 1, 10))
            .unwrap();
        assert_eq!(processed, ForeignOutcome::Processed);
        assert_eq!(settlement.state.seen_quantity, 30);
        assert_eq!(settlement.state.order, vec![1, 2]);
        assert!(settlement.tracker().parked().is_empty());

        let key = ForeignStreamKey::of(&foreign_event(order, 1, 10));
        assert_eq!(settlement.tracker().last_processed(&key), 2);
    }

    #[test]
    fn processed_versions_are_duplicates_afterwards() {
        let order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());
        settlement
            .try_process_foreign(foreign_event(order, 1, 10))
            .unwrap();

        let outcome = settlement
            .try_process_foreign(foreign_event(order, 1, 10))
            .unwrap();
        assert_eq!(outcome, ForeignOutcome::Duplicate);
        assert_eq!(settlement.state.seen_quantity, 10);
    }

    #[test]
    fn parking_the_same_position_twice_is_a_duplicate() {
        let order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());
        settlement
            .try_process_foreign(foreign_event(order, 3, 30))
            .unwrap();

        let outcome = settlement
            .try_process_foreign(foreign_event(order, 3, 30))
            .unwrap();
        assert_eq!(outcome, ForeignOutcome::Duplicate);
        assert_eq!(settlement.tracker().parked().len(), 1);
    }

    #[test]
    fn out_of_order_delivery_converges_to_the_in_order_state() {
        let order = SourceId::new();

        let mut in_order = Settlement::fresh(SourceId::new());
        for version in 1..=4 {
            in_order
                .try_process_foreign(foreign_event(order, version, version as i64))
                .unwrap();
        }

        let mut shuffled = Settlement::fresh(SourceId::new());
        for version in [3, 1, 4, 2] {
            shuffled
                .try_process_foreign(foreign_event(order, version, version as i64))
                .unwrap();
        }

        assert_eq!(in_order.state.seen_quantity, shuffled.state.seen_quantity);
        assert_eq!(in_order.state.order, shuffled.state.order);
        assert!(shuffled.tracker().parked().is_empty());
    }

    #[test]
    fn independent_streams_do_not_block_each_other() {
        let first_order = SourceId::new();
        let second_order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());

        settlement
            .try_process_foreign(foreign_event(first_order, 2, 20))
            .unwrap();
        let outcome = settlement
            .try_process_foreign(foreign_event(second_order, 1, 5))
            .unwrap();

        assert_eq!(outcome, ForeignOutcome::Processed);
        assert_eq!(settlement.state.seen_quantity, 5);
        assert_eq!(settlement.tracker().parked().len(), 1);
    }

    #[test]
    fn replaying_history_reconstructs_the_tracker() {
        let order = SourceId::new();
        let id = SourceId::new();
        let mut writer = Settlement::fresh(id);
        writer
            .try_process_foreign(foreign_event(order, 2, 20))
            .unwrap();
        writer
            .try_process_foreign(foreign_event(order, 1, 10))
            .unwrap();
        writer
            .try_process_foreign(foreign_event(order, 4, 40))
            .unwrap();
        let history = writer.drain_pending();

        let replayed = Settlement::from_history(id, history).unwrap();
        assert_eq!(replayed.state.seen_quantity, writer.state.seen_quantity);
        assert_eq!(replayed.tracker(), writer.tracker());
        assert_eq!(replayed.tracker().parked().len(), 1);
    }

    #[test]
    fn parked_events_always_sit_beyond_the_gap() {
        let order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());
        settlement
            .try_process_foreign(foreign_event(order, 1, 1))
            .unwrap();
        settlement
            .try_process_foreign(foreign_event(order, 3, 3))
            .unwrap();
        settlement
            .try_process_foreign(foreign_event(order, 5, 5))
            .unwrap();

        for parked in settlement.tracker().parked() {
            let key = ForeignStreamKey::of(parked);
            assert!(u64::from(parked.version) > settlement.tracker().last_processed(&key) + 1);
        }
    }

    #[test]
    fn tracker_state_roundtrips_through_json() {
        let order = SourceId::new();
        let mut settlement = Settlement::fresh(SourceId::new());
        settlement
            .try_process_foreign(foreign_event(order, 1, 10))
            .unwrap();
        settlement
            .try_process_foreign(foreign_event(order, 3, 30))
            .unwrap();

        let json = serde_json::to_string(&settlement.state).unwrap();
        let back: SettlementState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tracker, *settlement.tracker());
        assert_eq!(back.seen_quantity, settlement.state.seen_quantity);
    }

    #[test]
    fn parked_list_is_bounded() {
        let mut settlement = Settlement::fresh(SourceId::new());
        for i in 0..MAX_PARKED {
            let order = SourceId::new();
            settlement
                .try_process_foreign(foreign_event(order, 2 + i as u64, 1))
                .unwrap();
        }

        let overflow = settlement.try_process_foreign(foreign_event(SourceId::new(), 2, 1));
        assert!(matches!(
            overflow,
            Err(RehydrationError::ParkedOverflow { limit: MAX_PARKED })
        ));
    }
}
