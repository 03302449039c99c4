//! Projection jobs: scoped event access with a fingerprinted fetch cache.
//!
//! A [`Job`] is handed to a projection when it should run. Continuous jobs
//! carry a pre-materialised event slice from a subscription; periodic jobs
//! always query the store. Either way, every store fetch is memoised per
//! `(apply-config, query)` fingerprint for the lifetime of the job, so a
//! projection and its helpers can ask for the same events repeatedly
//! without hitting the store twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{Event, SortKey, SortOptions};
use crate::projection::{self, EventApplier};
use crate::query::Query;
use crate::store::{EventStore, StoreError};
use crate::streams::{self, DrainError};

/// Errors produced while running a projection job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Setting up the store query failed.
    #[error("query Events: {0}")]
    Query(#[source] StoreError),

    /// Streaming the query results failed.
    #[error("drain Events: {0}")]
    Drain(#[source] StoreError),

    /// The job's cancellation token fired.
    #[error("job cancelled")]
    Cancelled,
}

/// Options for applying a job to a projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ApplyOptions {
    from_base: bool,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from scratch: ignore pre-materialised events and the
    /// projection's `latest_event_time`, forcing a full re-query.
    pub fn from_base(mut self, from_base: bool) -> Self {
        self.from_base = from_base;
        self
    }

    pub fn is_from_base(&self) -> bool {
        self.from_base
    }
}

enum JobKind {
    /// Events already materialised by a subscription.
    Continuous { events: Vec<Event> },
    /// No pre-materialised events; always query.
    Periodic,
}

/// A unit of projection work.
///
/// Construct with [`continuous`](Job::continuous) or
/// [`periodic`](Job::periodic), optionally narrowing with
/// [`with_filter`](Job::with_filter) (the subscription's filter) and
/// [`with_query`](Job::with_query) (a caller-supplied base query).
pub struct Job<S> {
    store: Arc<S>,
    kind: JobKind,
    cancel: CancellationToken,
    event_names: Vec<String>,
    filter: Query,
    base: Query,
    cache: FetchCache,
}

impl<S: EventStore> Job<S> {
    /// A job for a subscription delivery: `events` were already fetched.
    pub fn continuous<I, N>(store: Arc<S>, event_names: I, events: Vec<Event>) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self::new(store, event_names, JobKind::Continuous { events })
    }

    /// A job for a periodic run: events are always queried from the store.
    pub fn periodic<I, N>(store: Arc<S>, event_names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self::new(store, event_names, JobKind::Periodic)
    }

    fn new<I, N>(store: Arc<S>, event_names: I, kind: JobKind) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            store,
            kind,
            cancel: CancellationToken::new(),
            event_names: event_names.into_iter().map(Into::into).collect(),
            filter: Query::new(),
            base: Query::new(),
            cache: FetchCache::new(),
        }
    }

    /// The subscription's filter, merged into every store query.
    pub fn with_filter(mut self, filter: Query) -> Self {
        self.filter = filter;
        self
    }

    /// A caller-supplied base query, merged last.
    pub fn with_query(mut self, query: Query) -> Self {
        self.base = query;
        self
    }

    /// Cancellation token aborting in-flight fetches.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The job's cancellation context.
    pub fn context(&self) -> &CancellationToken {
        &self.cancel
    }

    /// All events of this job.
    ///
    /// Continuous jobs return their pre-materialised slice; periodic jobs
    /// query the store (memoised).
    pub async fn events(&self) -> Result<Vec<Event>, JobError> {
        self.events_with(None, ApplyOptions::default()).await
    }

    /// The job's events that have one of the given names (in-memory
    /// filter over [`events`](Job::events)).
    pub async fn events_of(&self, names: &[&str]) -> Result<Vec<Event>, JobError> {
        let events = self.events().await?;
        Ok(events
            .into_iter()
            .filter(|evt| names.contains(&evt.name()))
            .collect())
    }

    /// The events that would be applied to `projection`.
    ///
    /// When the projection tracks a `latest_event_time` and `opts` does not
    /// force a from-base rebuild, only events after that time are queried.
    pub async fn events_for<P: EventApplier>(
        &self,
        projection: &P,
        opts: ApplyOptions,
    ) -> Result<Vec<Event>, JobError> {
        let latest = if opts.is_from_base() {
            None
        } else {
            projection.latest_event_time()
        };
        self.events_with(latest, opts).await
    }

    /// Aggregate names to distinct instance ids, extracted from the job's
    /// events, in first-seen order.
    pub async fn aggregates(&self) -> Result<HashMap<String, Vec<Uuid>>, JobError> {
        let events = self.events().await?;
        let mut out: HashMap<String, Vec<Uuid>> = HashMap::new();
        for evt in &events {
            if let Some(tuple) = evt.aggregate() {
                let ids = out.entry(tuple.name.clone()).or_default();
                if !ids.contains(&tuple.id) {
                    ids.push(tuple.id);
                }
            }
        }
        Ok(out)
    }

    /// Distinct ids of aggregates with one of the given names.
    pub async fn aggregates_of(&self, names: &[&str]) -> Result<Vec<Uuid>, JobError> {
        let mut aggregates = self.aggregates().await?;
        let mut out = Vec::new();
        for name in names {
            if let Some(ids) = aggregates.remove(*name) {
                out.extend(ids);
            }
        }
        Ok(out)
    }

    /// The first id of an aggregate with the given name, if any event
    /// belongs to one.
    pub async fn aggregate(&self, name: &str) -> Result<Option<Uuid>, JobError> {
        Ok(self.aggregates_of(&[name]).await?.into_iter().next())
    }

    /// Fetch the projection's events and apply them, stamping its latest
    /// event time.
    pub async fn apply<P: EventApplier>(
        &self,
        projection: &mut P,
        opts: ApplyOptions,
    ) -> Result<(), JobError> {
        let events = self.events_for(projection, opts).await?;
        projection::apply(&events, projection);
        Ok(())
    }

    async fn events_with(
        &self,
        latest: Option<DateTime<Utc>>,
        opts: ApplyOptions,
    ) -> Result<Vec<Event>, JobError> {
        if let JobKind::Continuous { events } = &self.kind {
            if !opts.is_from_base() {
                return Ok(events.clone());
            }
        }

        let query = self.build_query(latest);
        let key = fingerprint(&opts, &query.clone().normalize());

        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        self.cache
            .ensure(key, || async move {
                let start = Instant::now();
                let (events_rx, errs_rx) =
                    store.query(query).await.map_err(JobError::Query)?;
                let (events, abort) =
                    streams::drain(&cancel, ReceiverStream::new(events_rx), vec![errs_rx]).await;
                match abort {
                    None => {
                        tracing::debug!(
                            count = events.len(),
                            elapsed = ?start.elapsed(),
                            "fetched events"
                        );
                        Ok(events)
                    }
                    Some(DrainError::Cancelled) => Err(JobError::Cancelled),
                    Some(DrainError::Stream(err)) => Err(JobError::Drain(err)),
                }
            })
            .await
    }

    /// Build the store query: the configured event names with the
    /// canonical 4-key sort, narrowed to events after `latest`, then the
    /// subscription filter, then the caller's base query (merged last).
    fn build_query(&self, latest: Option<DateTime<Utc>>) -> Query {
        let mut query = Query::new()
            .with_names(self.event_names.iter().cloned())
            .sort_by_multi([
                SortOptions::asc(SortKey::Time),
                SortOptions::asc(SortKey::AggregateName),
                SortOptions::asc(SortKey::AggregateId),
                SortOptions::asc(SortKey::AggregateVersion),
            ]);
        if let Some(latest) = latest {
            query = query.with_after(latest);
        }
        query.merge(self.filter.clone()).merge(self.base.clone())
    }
}

/// Per-job memoisation of store fetches.
///
/// The async mutex is held across the fetch, so concurrent callers with
/// the same key serialise behind exactly one store query. The cache keeps
/// the canonical slice; callers receive defensive clones. Failed fetches
/// are not cached.
struct FetchCache {
    entries: Mutex<HashMap<[u8; 32], Vec<Event>>>,
}

impl FetchCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure<F, Fut>(&self, key: [u8; 32], fetch: F) -> Result<Vec<Event>, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Event>, JobError>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(hit) = entries.get(&key) {
            tracing::trace!("event fetch cache hit");
            return Ok(hit.clone());
        }

        let events = fetch().await?;
        entries.insert(key, events.clone());
        Ok(events)
    }
}

/// SHA-256 over the canonical JSON of `(apply-config, normalised query)`.
fn fingerprint(opts: &ApplyOptions, query: &Query) -> [u8; 32] {
    #[derive(serde::Serialize)]
    struct CacheKey<'a> {
        config: &'a ApplyOptions,
        query: &'a Query,
    }

    let bytes = serde_json::to_vec(&CacheKey {
        config: opts,
        query,
    })
    .expect("cache key serialization cannot fail for plain data");
    Sha256::digest(&bytes).into()
}
