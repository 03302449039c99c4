//! Aggregate identity, the replay capability set, and the reusable base.
//!
//! An aggregate is a consistency boundary with an identity
//! ([`AggregateRef`]) and a monotonically increasing version. Concrete
//! aggregates embed an [`AggregateBase`] for the bookkeeping (reference,
//! version, uncommitted changes) and implement
//! [`apply_event`](Aggregate::apply_event) for their domain state, usually
//! by delegating to a [`HandlerRegistry`](crate::projection::HandlerRegistry).

use std::fmt;

use uuid::Uuid;

use crate::event::{Event, EventData};

/// Identity of an aggregate: `(name, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AggregateRef {
    name: String,
    id: Uuid,
}

impl AggregateRef {
    pub fn new(name: impl Into<String>, id: Uuid) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Aggregate name (e.g. "order").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate instance id.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// The capability set a [`History`](crate::history::History) replays against.
///
/// Implementors hold an [`AggregateBase`] and expose it through
/// [`base`](Aggregate::base) / [`base_mut`](Aggregate::base_mut); the
/// provided accessors delegate to it. [`apply_event`](Aggregate::apply_event)
/// dispatches by event name and must silently ignore names the aggregate
/// does not handle -- partial subscribers are valid.
pub trait Aggregate: Send {
    /// Shared bookkeeping (reference, version, uncommitted changes).
    fn base(&self) -> &AggregateBase;

    /// Mutable access to the bookkeeping.
    fn base_mut(&mut self) -> &mut AggregateBase;

    /// Apply a single event to the domain state. Unknown event names are
    /// ignored.
    fn apply_event(&mut self, evt: &Event);

    /// The aggregate's identity.
    fn reference(&self) -> &AggregateRef {
        self.base().reference()
    }

    /// The version of the last committed event, `0` for a fresh aggregate.
    fn current_version(&self) -> u64 {
        self.base().version()
    }
}

/// Reference, version, and uncommitted-change bookkeeping for aggregates.
///
/// New events created through [`next_event`] are buffered here until
/// [`commit`](AggregateBase::commit) moves the version forward and clears
/// the buffer (typically after the events were persisted).
#[derive(Debug, Clone)]
pub struct AggregateBase {
    reference: AggregateRef,
    version: u64,
    changes: Vec<Event>,
}

impl AggregateBase {
    /// A fresh aggregate at version 0 with no uncommitted changes.
    pub fn new(name: impl Into<String>, id: Uuid) -> Self {
        Self {
            reference: AggregateRef::new(name, id),
            version: 0,
            changes: Vec::new(),
        }
    }

    pub fn reference(&self) -> &AggregateRef {
        &self.reference
    }

    /// Version of the last committed event.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The version the next recorded event will carry: committed version
    /// plus the number of uncommitted changes, plus one.
    pub fn next_version(&self) -> u64 {
        self.version + self.changes.len() as u64 + 1
    }

    /// Uncommitted changes in recording order.
    pub fn changes(&self) -> &[Event] {
        &self.changes
    }

    /// Buffer an uncommitted change.
    pub fn record(&mut self, evt: Event) {
        self.changes.push(evt);
    }

    /// Commit the buffered changes: the version advances to the last
    /// change's aggregate version and the buffer is cleared. A no-op when
    /// there are no changes.
    pub fn commit(&mut self) {
        if let Some(last) = self.changes.last() {
            if let Some(tuple) = last.aggregate() {
                self.version = tuple.version;
            }
        }
        self.changes.clear();
    }

    /// Force the committed version. Used by
    /// [`History::apply`](crate::history::History::apply) after a replay;
    /// domain code normally advances the version through
    /// [`commit`](AggregateBase::commit).
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Create the aggregate's next event, record it as an uncommitted change,
/// and apply it.
///
/// The event is stamped with the aggregate's reference and its
/// [`next_version`](AggregateBase::next_version), keeping versions
/// contiguous across multiple uncommitted events.
pub fn next_event<A: Aggregate>(a: &mut A, name: impl Into<String>, data: impl EventData) -> Event {
    let reference = a.reference().clone();
    let evt = Event::new(name, data).with_aggregate(
        reference.name(),
        reference.id(),
        a.base().next_version(),
    );
    a.base_mut().record(evt.clone());
    a.apply_event(&evt);
    evt
}
