//! Core identity and versioning types for the messaging core.
//!
//! All types follow the "parse, don't validate" principle: smart constructors
//! guarantee validity at construction time, so a value that exists is a value
//! that is legal everywhere it flows.
//!
//! - **`MessageId`**: always a valid UUIDv7, giving time-based ordering
//! - **`SourceId`**: the stable identity of an aggregate instance
//! - **`AggregateType`**: non-empty, at most 255 characters (the persistence
//!   schema bound)
//! - **`EventVersion`**: strictly positive; persisted versions for a stream
//!   are exactly `{1, 2, …, N}`
//! - **`CorrelationId`**: non-empty identifier of the originating command
//! - **`Timestamp`**: UTC wall-clock instants for creation dates

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A globally unique message identifier using UUIDv7 format.
///
/// Every command and envelope carries a `MessageId`. UUIDv7 embeds a
/// timestamp component, so ids created later compare greater, which keeps
/// audit trails naturally ordered.
///
/// # Examples
///
/// ```
/// use messagecore::MessageId;
///
/// let first = MessageId::new();
/// let second = MessageId::new();
/// assert_ne!(first, second);
/// ```
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new `MessageId` stamped with the current time.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() always returns a valid v7 UUID")
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// The stable identity of an aggregate instance.
///
/// Aggregates are identified by `(AggregateType, SourceId)`. The id is
/// assigned once, when the aggregate is first created, and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Uuid);

impl SourceId {
    /// Creates a fresh random id for a new aggregate.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID, e.g. one received from a caller.
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SourceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind of an aggregate (e.g. `"order"`, `"seats-availability"`).
///
/// Combined with a [`SourceId`] this names one event stream. The length
/// bound matches the `AggregateType` column of the events table.
///
/// # Examples
///
/// ```
/// use messagecore::AggregateType;
///
/// let kind = AggregateType::try_new("order").expect("valid aggregate type");
/// assert_eq!(kind.as_ref(), "order");
///
/// assert!(AggregateType::try_new("").is_err());
/// assert!(AggregateType::try_new("a".repeat(256)).is_err());
/// ```
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateType(String);

/// The version of an event within its aggregate stream.
///
/// Versions are strictly positive: the first event of any stream has
/// version 1, and each subsequent event increments by exactly 1, so the
/// persisted versions for a stream are always `{1, 2, …, N}` with no gaps
/// and no duplicates. An aggregate that has applied no events is at version
/// 0, which is why 0 is representable as a plain `u64` on the aggregate but
/// not as an `EventVersion`.
///
/// # Examples
///
/// ```
/// use messagecore::EventVersion;
///
/// let v1 = EventVersion::first();
/// let v2 = v1.next();
/// assert_eq!(u64::from(v1), 1);
/// assert_eq!(u64::from(v2), 2);
/// assert!(EventVersion::try_new(0).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct EventVersion(u64);

impl EventVersion {
    /// The version of the first event in any stream (1).
    pub fn first() -> Self {
        Self::try_new(1).expect("1 is always a valid version")
    }

    /// Returns the version directly after this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("a successor version is always valid")
    }

    /// The version following an aggregate version, where 0 means "fresh".
    pub fn after(aggregate_version: u64) -> Self {
        Self::try_new(aggregate_version + 1).expect("a successor version is always valid")
    }
}

/// Identifier of the originating command, carried through every derived
/// event for causal tracing.
///
/// For a save triggered by a command this is the command's [`MessageId`]
/// rendered as text; for a save triggered by an event it is the correlation
/// id the event already carried.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct CorrelationId(String);

impl From<MessageId> for CorrelationId {
    fn from(id: MessageId) -> Self {
        Self::try_new(id.to_string()).expect("a UUID renders as non-empty text")
    }
}

/// A UTC timestamp for message creation dates.
///
/// All timestamps are stored in UTC to avoid timezone ambiguity and to make
/// event ordering reliable across machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Wraps a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// The current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns a reference to the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Consumes the timestamp, returning the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn aggregate_type_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let kind = AggregateType::try_new(s.clone()).unwrap();
            prop_assert_eq!(kind.as_ref(), &s);
        }

        #[test]
        fn aggregate_type_trims_whitespace(s in " {0,8}[a-zA-Z0-9_-]{1,200} {0,8}") {
            let kind = AggregateType::try_new(s.clone()).unwrap();
            prop_assert_eq!(kind.as_ref(), s.trim());
        }

        #[test]
        fn aggregate_type_rejects_overlong_strings(s in "[a-zA-Z0-9]{256,400}") {
            prop_assert!(AggregateType::try_new(s).is_err());
        }

        #[test]
        fn event_version_accepts_positive_values(v in 1u64..=u64::MAX) {
            let version = EventVersion::try_new(v).unwrap();
            prop_assert_eq!(u64::from(version), v);
        }

        #[test]
        fn event_version_next_increments_by_one(v in 1u64..u64::MAX) {
            let version = EventVersion::try_new(v).unwrap();
            prop_assert_eq!(u64::from(version.next()), v + 1);
        }

        #[test]
        fn event_version_roundtrip_serialization(v in 1u64..=u64::MAX) {
            let version = EventVersion::try_new(v).unwrap();
            let json = serde_json::to_string(&version).unwrap();
            let back: EventVersion = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(version, back);
        }

        #[test]
        fn correlation_id_rejects_blank_strings(s in " {0,20}") {
            prop_assert!(CorrelationId::try_new(s).is_err());
        }
    }

    #[test]
    fn event_version_rejects_zero() {
        assert!(EventVersion::try_new(0).is_err());
    }

    #[test]
    fn event_version_first_is_one() {
        assert_eq!(u64::from(EventVersion::first()), 1);
    }

    #[test]
    fn event_version_after_fresh_aggregate_is_one() {
        assert_eq!(EventVersion::after(0), EventVersion::first());
        assert_eq!(u64::from(EventVersion::after(4)), 5);
    }

    #[test]
    fn message_id_new_is_v7() {
        let id = MessageId::new();
        assert_eq!(id.as_ref().get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn message_id_rejects_non_v7_uuids() {
        assert!(MessageId::try_new(Uuid::nil()).is_err());
        assert!(MessageId::try_new(Uuid::new_v4()).is_err());
    }

    #[test]
    fn message_ids_order_by_creation_time() {
        let first = MessageId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = MessageId::new();
        assert!(second > first);
    }

    #[test]
    fn source_id_roundtrips_through_uuid() {
        let raw = Uuid::new_v4();
        let id = SourceId::from_uuid(raw);
        assert_eq!(id.as_uuid(), &raw);
        assert_eq!(id.to_string(), raw.to_string());
    }

    #[test]
    fn correlation_id_from_message_id_matches_display() {
        let id = MessageId::new();
        let correlation = CorrelationId::from(id);
        assert_eq!(correlation.as_ref(), &id.to_string());
    }

    #[test]
    fn timestamp_now_is_monotonic_enough() {
        let before = Utc::now();
        let stamp = Timestamp::now();
        let after = Utc::now();
        assert!(stamp.as_datetime() >= &before);
        assert!(stamp.as_datetime() <= &after);
    }

    #[test]
    fn timestamp_roundtrip_serialization() {
        let stamp = Timestamp::now();
        let json = serde_json::to_string(&stamp).unwrap();
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(stamp, back);
    }
}
