//! Replayable aggregate histories.

use crate::aggregate::{Aggregate, AggregateRef};
use crate::event::Event;

/// An ordered event sequence that reconstructs one aggregate's state.
///
/// Histories are produced by [`rebuild`](crate::rebuild::rebuild). The
/// carried events are sorted by ascending aggregate version and, when
/// consistency validation ran, contiguous starting at the target
/// aggregate's `current_version + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    reference: AggregateRef,
    events: Vec<Event>,
}

impl History {
    pub(crate) fn new(reference: AggregateRef, events: Vec<Event>) -> Self {
        Self { reference, events }
    }

    /// The aggregate this history belongs to.
    pub fn reference(&self) -> &AggregateRef {
        &self.reference
    }

    /// The carried events, ascending by aggregate version.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consume the history, taking ownership of its events.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Replay the carried events on `aggregate`.
    ///
    /// Each event is dispatched through
    /// [`Aggregate::apply_event`]; names the aggregate does not handle are
    /// ignored. Afterwards the aggregate's current version equals the last
    /// event's aggregate version.
    ///
    /// The caller is responsible for applying a history only to an
    /// aggregate with the matching [`reference`](History::reference).
    pub fn apply<A: Aggregate>(&self, aggregate: &mut A) {
        debug_assert_eq!(
            aggregate.reference(),
            &self.reference,
            "history applied to a different aggregate"
        );

        for evt in &self.events {
            aggregate.apply_event(evt);
        }

        if let Some(version) = self.events.last().and_then(|e| e.aggregate()).map(|t| t.version) {
            aggregate.base_mut().set_version(version);
        }
    }
}
