//! Event-sourced aggregate rebuild engine.
//!
//! `replay-es` consumes an unbounded stream of domain events, partitions it
//! by aggregate identity, validates ordering, and emits for each aggregate
//! a replayable [`History`] that reconstructs the aggregate's current state.
//! Around that core it provides the query model, projection jobs with a
//! fingerprinted fetch cache, and the storage/codec contracts the engine
//! consumes.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Event`] | Immutable fact, optionally bound to an aggregate version |
//! | [`rebuild`](rebuild::rebuild) | 3-stage pipeline: event stream in, history stream out |
//! | [`History`] | Ordered event sequence replayable against an [`Aggregate`] |
//! | [`Query`] | Declarative event filter with merge and canonical form |
//! | [`Job`](job::Job) | Projection work unit with an at-most-once fetch cache |
//! | [`EventStore`](store::EventStore) | Storage contract consumed by jobs and rebuilds |
//! | [`Registry`](codec::Registry) | Name-keyed payload codec registry |
//!
//! # Quick Start
//!
//! ```
//! use replay_es::event::Event;
//! use replay_es::rebuild::{RebuildOptions, rebuild};
//! use uuid::Uuid;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let id = Uuid::new_v4();
//! let events = (1u64..=3).map(|v| {
//!     Event::new("order.placed", serde_json::json!({ "n": v }))
//!         .with_aggregate("order", id, v)
//! });
//!
//! let (mut histories, mut errors) =
//!     rebuild(tokio_stream::iter(events), RebuildOptions::new());
//!
//! let history = histories.recv().await.expect("one aggregate, one history");
//! assert_eq!(history.events().len(), 3);
//! assert!(errors.recv().await.is_none(), "clean input, no errors");
//! # }
//! ```

pub mod aggregate;
pub mod codec;
pub mod consistency;
pub mod event;
pub mod history;
pub mod job;
pub mod projection;
pub mod query;
pub mod rebuild;
pub mod snapshot;
pub mod store;
pub mod streams;

pub use aggregate::{Aggregate, AggregateBase, AggregateRef};
pub use event::{Event, EventData};
pub use history::History;
pub use projection::EventApplier;
pub use query::Query;
pub use rebuild::{RebuildError, RebuildOptions, rebuild};

/// Opaque error type for causes that cross module boundaries (upstream
/// stream errors, backend failures, payload marshalling).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
