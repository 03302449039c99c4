//! Event store contract and the in-memory reference store.
//!
//! The pipeline and projection jobs only consume the [`EventStore`]
//! contract; concrete database backends live outside this crate.
//! [`MemoryStore`] is the reference implementation used in tests and for
//! small embedded setups.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::BoxError;
use crate::event::{self, Event};
use crate::query::Query;
use crate::streams;

/// Errors produced by event stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No event with the given id exists.
    #[error("event {0} not found")]
    NotFound(Uuid),

    /// Inserting would violate a uniqueness invariant: the event id, or
    /// the `(aggregate name, id, version)` tuple when present.
    #[error("event {0} already exists")]
    Duplicate(Uuid),

    /// The store was closed.
    #[error("store closed")]
    Closed,

    /// Backend-specific failure.
    #[error("backend: {0}")]
    Backend(#[source] BoxError),
}

/// Persistent store for events.
///
/// `query` returns a pair of finite channels: the matching events and the
/// per-event errors encountered while streaming them. A setup failure is
/// the returned `Err`; later errors are recoverable and flow on the error
/// channel.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert events, all or nothing.
    async fn insert(&self, events: Vec<Event>) -> Result<(), StoreError>;

    /// Find the event with the given id.
    async fn find(&self, id: Uuid) -> Result<Event, StoreError>;

    /// Stream the events matching `query`, sorted by its sort directives.
    async fn query(
        &self,
        query: Query,
    ) -> Result<(mpsc::Receiver<Event>, mpsc::Receiver<StoreError>), StoreError>;

    /// Delete the given event.
    async fn delete(&self, evt: &Event) -> Result<(), StoreError>;
}

/// In-memory event store.
///
/// Insertion order is preserved; `query` filters with [`Query::test`] and
/// applies the query's sort directives. Uniqueness of event ids and
/// aggregate tuples is enforced on insert.
#[derive(Default)]
pub struct MemoryStore {
    events: std::sync::RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `events`.
    ///
    /// # Errors
    ///
    /// Fails like [`insert`](EventStore::insert) on duplicate events.
    pub fn with_events(events: Vec<Event>) -> Result<Self, StoreError> {
        let store = Self::new();
        store.insert_sync(events)?;
        Ok(store)
    }

    fn insert_sync(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let mut guard = self.events.write().expect("memory store lock poisoned");
        for evt in &events {
            let duplicate = guard.iter().any(|existing| {
                existing.id() == evt.id()
                    || matches!(
                        (existing.aggregate(), evt.aggregate()),
                        (Some(a), Some(b)) if a == b
                    )
            });
            if duplicate {
                return Err(StoreError::Duplicate(evt.id()));
            }
        }
        guard.extend(events);
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert(&self, events: Vec<Event>) -> Result<(), StoreError> {
        self.insert_sync(events)
    }

    async fn find(&self, id: Uuid) -> Result<Event, StoreError> {
        self.events
            .read()
            .expect("memory store lock poisoned")
            .iter()
            .find(|evt| evt.id() == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn query(
        &self,
        query: Query,
    ) -> Result<(mpsc::Receiver<Event>, mpsc::Receiver<StoreError>), StoreError> {
        let mut matching: Vec<Event> = self
            .events
            .read()
            .expect("memory store lock poisoned")
            .iter()
            .filter(|evt| query.test(evt))
            .cloned()
            .collect();
        event::sort(&mut matching, query.sortings());

        tracing::trace!(matched = matching.len(), "memory store query");

        // No per-event errors can occur in memory; the error channel is
        // returned already closed.
        let (_errs_tx, errs_rx) = mpsc::channel(1);
        Ok((streams::from_vec(matching), errs_rx))
    }

    async fn delete(&self, evt: &Event) -> Result<(), StoreError> {
        let mut guard = self.events.write().expect("memory store lock poisoned");
        let before = guard.len();
        guard.retain(|existing| existing.id() != evt.id());
        if guard.len() == before {
            return Err(StoreError::NotFound(evt.id()));
        }
        Ok(())
    }
}
