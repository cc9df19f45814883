//! Core identifier and counter types for the decree runtime.
//!
//! All types follow the "parse, don't validate" principle: smart constructors
//! establish validity once, and a successfully constructed value stays valid
//! for the lifetime of the program.
//!
//! - [`StreamId`]: non-empty, at most 255 characters
//! - [`SeqNr`]: global commit-order counter, assigned by the journal writer
//! - [`EventVersion`]: per-stream counter, the basis for optimistic concurrency
//! - [`EventId`]: always a valid UUIDv7, giving time-based ordering
//! - [`CommandId`]: client-supplied idempotency key
//! - [`Timestamp`]: UTC wall-clock time
//! - [`NonEmptyVec`]: a vector that is known, by construction, to hold at
//!   least one element

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an aggregate instance and of its event stream.
///
/// A `StreamId` is the consistency boundary of the runtime: writes serialize
/// per stream, and a stream's events fold into exactly one aggregate state.
///
/// # Examples
///
/// ```
/// use decree::types::StreamId;
///
/// let stream = StreamId::try_new("account-1").expect("valid stream id");
/// assert_eq!(stream.as_ref(), "account-1");
///
/// assert!(StreamId::try_new("").is_err());
/// assert!(StreamId::try_new("a".repeat(256)).is_err());
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
pub struct StreamId(String);

/// Global sequence number, strictly increasing over commit order.
///
/// `SeqNr` values are assigned by the journal writer at commit time and are
/// unique across all streams. [`SeqNr::initial`] (zero) sits before the first
/// assigned value and is the natural starting cursor for global readers.
#[nutype(
    validate(greater_or_equal = 0),
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
pub struct SeqNr(u64);

impl SeqNr {
    /// The cursor position before the first committed sequence number.
    pub fn initial() -> Self {
        Self::try_new(0).expect("0 is always a valid sequence number")
    }

    /// Returns the next sequence number.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next sequence number is always valid")
    }
}

/// Per-stream event counter.
///
/// The first event of a stream has version 1; versions within a stream are
/// contiguous. [`EventVersion::initial`] (zero) denotes an empty stream and is
/// the expected version of the first append.
///
/// # Examples
///
/// ```
/// use decree::types::EventVersion;
///
/// let v0 = EventVersion::initial();
/// let v1 = v0.next();
/// assert_eq!(u64::from(v1), 1);
/// assert!(v1 > v0);
/// ```
#[nutype(
    validate(greater_or_equal = 0),
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
    /// The version of an empty stream, before any event.
    pub fn initial() -> Self {
        Self::try_new(0).expect("0 is always a valid version")
    }

    /// Returns the version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next version is always valid")
    }

    /// Returns this version advanced by `count` events.
    #[must_use]
    pub fn advanced_by(self, count: u64) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + count).expect("advanced version is always valid")
    }
}

/// Globally unique event identifier in UUIDv7 format.
///
/// UUIDv7 embeds a timestamp, so event ids created later compare greater,
/// which makes them usable as a secondary ordering key across streams.
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
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new id stamped with the current time.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7 always returns a v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-supplied command identifier, used as the idempotency key.
///
/// Unlike [`EventId`], the runtime accepts any UUID version here: the id is
/// minted by the caller, possibly long before the command reaches us, and its
/// only job is to be stable across retries of the same logical command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Wraps an existing UUID.
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Mints a fresh time-ordered id, for callers that do not track their own.
    pub fn random() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for CommandId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A UTC timestamp.
///
/// Wrapping `DateTime<Utc>` keeps timezone handling in one place and gives
/// the rest of the crate a domain type to attach meaning to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// The current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Borrows the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Unwraps into the underlying `DateTime`.
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

/// A vector holding at least one element.
///
/// The decision algebra deals in collections that are never empty: an
/// accepted decision carries at least one event, a rejected one at least one
/// reason. Encoding that in the type removes a class of "empty batch" bugs
/// at every boundary the collections cross.
///
/// # Examples
///
/// ```
/// use decree::types::NonEmptyVec;
///
/// let mut reasons = NonEmptyVec::new("insufficient funds");
/// reasons.push("account frozen");
/// assert_eq!(reasons.len(), 2);
/// assert_eq!(*reasons.head(), "insufficient funds");
///
/// assert!(NonEmptyVec::<u8>::try_from_vec(vec![]).is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonEmptyVec<T>(Vec<T>);

impl<T> NonEmptyVec<T> {
    /// Creates a collection with a single element.
    pub fn new(head: T) -> Self {
        Self(vec![head])
    }

    /// Creates a collection from a head element and any number of tail
    /// elements.
    pub fn of(head: T, tail: impl IntoIterator<Item = T>) -> Self {
        let mut items = vec![head];
        items.extend(tail);
        Self(items)
    }

    /// Parses a plain vector, returning `None` when it is empty.
    pub fn try_from_vec(items: Vec<T>) -> Option<Self> {
        if items.is_empty() {
            None
        } else {
            Some(Self(items))
        }
    }

    /// The first element.
    pub fn head(&self) -> &T {
        &self.0[0]
    }

    /// Appends an element.
    pub fn push(&mut self, item: T) {
        self.0.push(item);
    }

    /// Appends all elements of `other`, preserving order.
    pub fn append(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Number of elements; always at least 1.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }

    /// Borrows the elements as a slice.
    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    /// Unwraps into a plain vector.
    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

impl<T> From<T> for NonEmptyVec<T> {
    fn from(head: T) -> Self {
        Self::new(head)
    }
}

impl<T> IntoIterator for NonEmptyVec<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a NonEmptyVec<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<T> AsRef<[T]> for NonEmptyVec<T> {
    fn as_ref(&self) -> &[T] {
        &self.0
    }
}
