//! Projection base: name-keyed event dispatch and the apply contract.
//!
//! A projection (read model) registers one handler per event name in a
//! [`HandlerRegistry`] and implements [`EventApplier`] by delegating to it.
//! Names with no registered handler are silently ignored -- partial
//! subscribers are valid. This is dispatch, not polymorphism: supporting a
//! new event type is one more registration.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::event::Event;

/// Something events can be applied to: a projection or an aggregate's
/// read-side state.
///
/// The `latest_event_time` pair is a capability with no-op defaults.
/// Projections that track it get incremental queries from
/// [`Job::events_for`](crate::job::Job::events_for) (only events after the
/// latest seen time are fetched) and have the time stamped by [`apply`].
pub trait EventApplier {
    /// Apply a single event. Unknown event names must be ignored.
    fn apply_event(&mut self, evt: &Event);

    /// Time of the last event this projection has seen, if tracked.
    fn latest_event_time(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Record the time of the last applied event. No-op by default.
    fn set_latest_event_time(&mut self, _time: DateTime<Utc>) {}
}

/// Apply `events` in order, then stamp the projection's latest event time
/// from the last event.
pub fn apply<P: EventApplier + ?Sized>(events: &[Event], projection: &mut P) {
    for evt in events {
        projection.apply_event(evt);
    }
    if let Some(last) = events.last() {
        projection.set_latest_event_time(last.time());
    }
}

/// Handler function for events dispatched to a `T`.
pub type Handler<T> = Box<dyn Fn(&mut T, &Event) + Send + Sync>;

/// Name-keyed dispatch table for a projection or aggregate of type `T`.
///
/// Build the registry once at construction, hold it in an `Arc`, and
/// delegate `apply_event` to [`dispatch`](HandlerRegistry::dispatch):
///
/// ```
/// use std::sync::Arc;
/// use replay_es::event::Event;
/// use replay_es::projection::{EventApplier, HandlerRegistry};
///
/// struct OrderCount {
///     handlers: Arc<HandlerRegistry<OrderCount>>,
///     placed: u64,
/// }
///
/// impl OrderCount {
///     fn new() -> Self {
///         let mut handlers = HandlerRegistry::new();
///         handlers.register("order.placed", |p: &mut OrderCount, _evt: &Event| {
///             p.placed += 1;
///         });
///         Self { handlers: Arc::new(handlers), placed: 0 }
///     }
/// }
///
/// impl EventApplier for OrderCount {
///     fn apply_event(&mut self, evt: &Event) {
///         let handlers = Arc::clone(&self.handlers);
///         handlers.dispatch(self, evt);
///     }
/// }
///
/// let mut p = OrderCount::new();
/// p.apply_event(&Event::new("order.placed", ()));
/// p.apply_event(&Event::new("order.shipped", ())); // no handler, ignored
/// assert_eq!(p.placed, 1);
/// ```
pub struct HandlerRegistry<T> {
    handlers: HashMap<String, Handler<T>>,
}

impl<T> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `name`, replacing any previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(&mut T, &Event) + Send + Sync + 'static,
    ) {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Whether a handler is registered for `name`.
    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Event names with registered handlers, unordered.
    pub fn handled_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Dispatch `evt` to the handler registered for its name. Absent name
    /// is a no-op.
    pub fn dispatch(&self, target: &mut T, evt: &Event) {
        if let Some(handler) = self.handlers.get(evt.name()) {
            handler(target, evt);
        }
    }
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::Arc;

    use super::*;
    use crate::event::test_fixtures::FooData;

    /// A test projection that sums "added" payloads and tracks the latest
    /// event time.
    pub(crate) struct Tally {
        handlers: Arc<HandlerRegistry<Tally>>,
        pub total: i64,
        pub latest: Option<DateTime<Utc>>,
    }

    impl Tally {
        pub(crate) fn new() -> Self {
            let mut handlers = HandlerRegistry::new();
            handlers.register("added", |p: &mut Tally, evt: &Event| {
                if let Some(data) = evt.data_as::<FooData>() {
                    p.total += data.a;
                }
            });
            Self {
                handlers: Arc::new(handlers),
                total: 0,
                latest: None,
            }
        }
    }

    impl EventApplier for Tally {
        fn apply_event(&mut self, evt: &Event) {
            let handlers = Arc::clone(&self.handlers);
            handlers.dispatch(self, evt);
        }

        fn latest_event_time(&self) -> Option<DateTime<Utc>> {
            self.latest
        }

        fn set_latest_event_time(&mut self, time: DateTime<Utc>) {
            self.latest = Some(time);
        }
    }
}
