//! Event values, payload capabilities, and multi-key sorting.
//!
//! An [`Event`] is an immutable fact. When it belongs to an aggregate it
//! carries an [`EventAggregate`] tuple whose version is exactly one greater
//! than the previous event's version for that aggregate. Payloads are opaque
//! named types behind the [`EventData`] trait.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::BoxError;
use crate::aggregate::AggregateRef;

/// The aggregate tuple carried by an event that belongs to an aggregate.
///
/// `version` is always `>= 1`; an event that belongs to no aggregate has no
/// tuple at all (`Event::aggregate` returns `None`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct EventAggregate {
    /// Aggregate name (e.g. "order").
    pub name: String,
    /// Aggregate instance id.
    pub id: Uuid,
    /// Version of the aggregate after this event.
    pub version: u64,
}

impl EventAggregate {
    /// The `(name, id)` reference of this tuple, without the version.
    pub fn reference(&self) -> AggregateRef {
        AggregateRef::new(self.name.clone(), self.id)
    }
}

impl fmt::Display for EventAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})@v{}", self.name, self.id, self.version)
    }
}

/// Opaque event payload.
///
/// Implementations are plain data types. The default methods are capability
/// hooks that concrete payloads may override:
///
/// - [`soft_delete`](EventData::soft_delete) marks the owning aggregate as
///   soft-deleted; the rebuild pipeline drops such groups unless configured
///   otherwise.
/// - [`marshal`](EventData::marshal) / [`unmarshal`](EventData::unmarshal)
///   let a payload bring its own byte encoding, which takes precedence over
///   any encoder/decoder registered in a [`codec::Registry`](crate::codec::Registry).
pub trait EventData: fmt::Debug + Send + Sync + 'static {
    /// Upcast for payload downcasting via [`Event::data_as`].
    fn as_any(&self) -> &dyn Any;

    /// Soft-delete marker. Defaults to `false`.
    fn soft_delete(&self) -> bool {
        false
    }

    /// Custom byte encoding. Return `Some` to bypass registered encoders.
    fn marshal(&self) -> Option<Result<Vec<u8>, BoxError>> {
        None
    }

    /// Custom byte decoding into a freshly made value. Return `Some` to
    /// bypass registered decoders.
    fn unmarshal(&mut self, _bytes: &[u8]) -> Option<Result<(), BoxError>> {
        None
    }
}

impl EventData for serde_json::Value {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The empty payload, for events that carry no data.
impl EventData for () {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An immutable domain event.
///
/// Events are cheap to clone; the payload is shared behind an `Arc`.
///
/// # Examples
///
/// ```
/// use replay_es::event::Event;
/// use uuid::Uuid;
///
/// let id = Uuid::new_v4();
/// let evt = Event::new("order.placed", serde_json::json!({"total": 10}))
///     .with_aggregate("order", id, 1);
///
/// assert_eq!(evt.name(), "order.placed");
/// assert_eq!(evt.aggregate().map(|a| a.version), Some(1));
/// ```
#[derive(Debug, Clone)]
pub struct Event {
    id: Uuid,
    name: String,
    time: DateTime<Utc>,
    data: Arc<dyn EventData>,
    aggregate: Option<EventAggregate>,
}

impl Event {
    /// Create an event with a fresh v4 id and the current time.
    pub fn new(name: impl Into<String>, data: impl EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            time: Utc::now(),
            data: Arc::new(data),
            aggregate: None,
        }
    }

    /// Create an event from an already-boxed payload, e.g. one produced by
    /// [`codec::Registry::decode`](crate::codec::Registry::decode).
    pub fn new_boxed(name: impl Into<String>, data: Box<dyn EventData>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            time: Utc::now(),
            data: Arc::from(data),
            aggregate: None,
        }
    }

    /// Replace the auto-generated event id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Replace the auto-generated event time.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Attach the aggregate tuple. `version` must be `>= 1`.
    pub fn with_aggregate(mut self, name: impl Into<String>, id: Uuid, version: u64) -> Self {
        self.aggregate = Some(EventAggregate {
            name: name.into(),
            id,
            version,
        });
        self
    }

    /// Globally unique event id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Event name (e.g. "order.placed").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time, nanosecond resolution.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// The opaque payload.
    pub fn data(&self) -> &dyn EventData {
        self.data.as_ref()
    }

    /// Downcast the payload to a concrete type.
    pub fn data_as<D: EventData>(&self) -> Option<&D> {
        self.data.as_any().downcast_ref::<D>()
    }

    /// The aggregate tuple, if this event belongs to an aggregate.
    pub fn aggregate(&self) -> Option<&EventAggregate> {
        self.aggregate.as_ref()
    }

    /// The `(name, id)` reference of the owning aggregate, if any.
    pub fn aggregate_ref(&self) -> Option<AggregateRef> {
        self.aggregate.as_ref().map(EventAggregate::reference)
    }

    /// Whether the payload carries the soft-delete marker.
    pub fn soft_deleted(&self) -> bool {
        self.data.soft_delete()
    }
}

/// Equality compares `(id, name, time, aggregate)`. The payload is excluded:
/// event ids are unique within any store, so identity carries equality, and
/// opaque payloads have no general equality.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.time == other.time
            && self.aggregate == other.aggregate
    }
}

impl Eq for Event {}

/// Key to sort events by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SortKey {
    /// Event time.
    Time,
    /// Aggregate name (events without an aggregate sort first).
    AggregateName,
    /// Aggregate id.
    AggregateId,
    /// Aggregate version.
    AggregateVersion,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A single sort directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SortOptions {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortOptions {
    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        Self { key, direction }
    }

    /// Ascending directive for `key`.
    pub fn asc(key: SortKey) -> Self {
        Self::new(key, SortDirection::Asc)
    }

    /// Descending directive for `key`.
    pub fn desc(key: SortKey) -> Self {
        Self::new(key, SortDirection::Desc)
    }
}

/// Compare two events by a single key, ascending.
fn compare_by(a: &Event, b: &Event, key: SortKey) -> Ordering {
    match key {
        SortKey::Time => a.time().cmp(&b.time()),
        SortKey::AggregateName => a
            .aggregate()
            .map(|t| t.name.as_str())
            .cmp(&b.aggregate().map(|t| t.name.as_str())),
        SortKey::AggregateId => a
            .aggregate()
            .map(|t| t.id)
            .cmp(&b.aggregate().map(|t| t.id)),
        SortKey::AggregateVersion => a
            .aggregate()
            .map(|t| t.version)
            .cmp(&b.aggregate().map(|t| t.version)),
    }
}

/// Stable multi-key sort. Directives are applied in order: the first
/// non-equal comparison decides, ties fall through to the next directive,
/// and fully tied events keep their input order.
pub fn sort(events: &mut [Event], sortings: &[SortOptions]) {
    events.sort_by(|a, b| {
        for s in sortings {
            let ord = match s.direction {
                SortDirection::Asc => compare_by(a, b, s.key),
                SortDirection::Desc => compare_by(a, b, s.key).reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A plain test payload.
    #[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
    pub(crate) struct FooData {
        pub a: i64,
    }

    impl EventData for FooData {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A payload carrying the soft-delete marker.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct Deleted;

    impl EventData for Deleted {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn soft_delete(&self) -> bool {
            true
        }
    }

    /// Build `count` events for one aggregate, versions `1..=count`, with
    /// strictly increasing times.
    pub(crate) fn aggregate_events(name: &str, id: Uuid, count: u64) -> Vec<Event> {
        versioned_events(name, id, (1..=count).collect())
    }

    /// Build events for one aggregate with the given versions, in order,
    /// with strictly increasing times.
    pub(crate) fn versioned_events(name: &str, id: Uuid, versions: Vec<u64>) -> Vec<Event> {
        let base = Utc::now();
        versions
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                Event::new("evt", FooData { a: v as i64 })
                    .with_time(base + chrono::Duration::nanoseconds(i as i64))
                    .with_aggregate(name, id, v)
            })
            .collect()
    }
}
