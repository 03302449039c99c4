//! The rebuild pipeline: a stream of events in, a stream of replayable
//! aggregate [`History`] values out.
//!
//! Three cooperating tasks communicate over bounded channels:
//!
//! 1. **accept** reads the input, applies filters, forwards events, and
//!    tracks which aggregates are pending. In grouped mode it emits a
//!    completion token as soon as the aggregate reference changes; at
//!    end-of-input it drains the pending set.
//! 2. **group** owns the only shared state, a map from aggregate reference
//!    to collected events, and answers take-requests from the emit stage.
//! 3. **emit** turns each completed group into a history: sort by version,
//!    apply the soft-delete policy, validate consistency, send.
//!
//! Per-aggregate failures are isolated: the offending aggregate is skipped
//! and surfaced on the error stream while the pipeline continues. Only
//! cancellation and upstream errors shut the pipeline down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::BoxError;
use crate::aggregate::AggregateRef;
use crate::consistency::{self, ConsistencyError};
use crate::event::{self, Event, SortKey, SortOptions};
use crate::history::History;
use crate::streams;

/// Predicate deciding whether an event participates in the rebuild.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Errors surfaced on the pipeline's error stream.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    /// The parent cancellation token fired. Surfaced once, then the
    /// pipeline shuts down.
    #[error("rebuild cancelled")]
    Cancelled,

    /// An upstream error channel yielded an error. The pipeline aborts.
    #[error("event stream: {0}")]
    Upstream(#[source] BoxError),

    /// An aggregate's event sequence failed consistency validation. The
    /// aggregate is skipped; the pipeline continues.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

/// Configuration for [`rebuild`].
///
/// ```
/// use replay_es::rebuild::RebuildOptions;
///
/// let opts = RebuildOptions::new()
///     .grouped(true)
///     .filter(|evt| evt.name() != "audit.noise");
/// # let _ = opts;
/// ```
pub struct RebuildOptions {
    sorted: bool,
    grouped: bool,
    validate_consistency: bool,
    with_soft_deleted: bool,
    filters: Vec<EventFilter>,
    upstream_errors: Vec<mpsc::Receiver<BoxError>>,
    cancel: CancellationToken,
    buffer: usize,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            sorted: false,
            grouped: false,
            validate_consistency: true,
            with_soft_deleted: false,
            filters: Vec::new(),
            upstream_errors: Vec::new(),
            cancel: CancellationToken::new(),
            buffer: 64,
        }
    }
}

impl RebuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The caller guarantees events for each aggregate arrive in ascending
    /// version order; the pipeline skips its internal sort.
    pub fn sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    /// The caller guarantees events for a given aggregate arrive
    /// contiguously; a history is emitted as soon as the aggregate's group
    /// ends (detected by reference change) instead of at end-of-input.
    pub fn grouped(mut self, grouped: bool) -> Self {
        self.grouped = grouped;
        self
    }

    /// Validate each group's consistency before emission. Enabled by
    /// default; disable only when the input guarantees consistency or an
    /// invalid state is explicitly wanted.
    pub fn validate_consistency(mut self, validate: bool) -> Self {
        self.validate_consistency = validate;
        self
    }

    /// Also emit histories for soft-deleted aggregates. Disabled by
    /// default: a group containing a soft-delete marker is dropped
    /// silently.
    pub fn with_soft_deleted(mut self, with: bool) -> Self {
        self.with_soft_deleted = with;
        self
    }

    /// Add an event filter. An event is discarded when any filter rejects
    /// it.
    pub fn filter(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filters.push(Arc::new(f));
        self
    }

    /// Watch an additional error channel; the first error received aborts
    /// the pipeline.
    pub fn upstream_errors(mut self, errors: mpsc::Receiver<BoxError>) -> Self {
        self.upstream_errors.push(errors);
        self
    }

    /// Parent cancellation token. Cancelling it shuts the pipeline down
    /// after surfacing a single [`RebuildError::Cancelled`].
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Capacity of the internal and output channels.
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

/// Take-request sent from the emit stage to the group stage.
struct GroupRequest {
    reference: AggregateRef,
    reply: oneshot::Sender<Vec<Event>>,
}

/// Run the rebuild pipeline over `events`.
///
/// Returns the history stream and the error stream. Both channels close
/// when the pipeline has shut down; no tasks outlive them. Must be called
/// from within a tokio runtime.
///
/// Histories are emitted in the order their aggregates complete: on
/// reference change in grouped mode, in first-seen order at end-of-input
/// otherwise. Within each history, events are sorted ascending by
/// aggregate version.
pub fn rebuild<S>(
    events: S,
    opts: RebuildOptions,
) -> (mpsc::Receiver<History>, mpsc::Receiver<RebuildError>)
where
    S: Stream<Item = Event> + Send + 'static,
{
    let (events_tx, events_rx) = mpsc::channel(opts.buffer);
    let (completions_tx, completions_rx) = mpsc::channel(opts.buffer);
    let (requests_tx, requests_rx) = mpsc::channel(1);
    let (out_tx, out_rx) = mpsc::channel(opts.buffer);
    let (errors_tx, errors_rx) = mpsc::channel(opts.buffer);

    tokio::spawn(accept(
        events,
        opts.filters,
        opts.grouped,
        opts.cancel.clone(),
        opts.upstream_errors,
        events_tx,
        completions_tx,
        errors_tx.clone(),
    ));
    tokio::spawn(group(events_rx, requests_rx));
    tokio::spawn(emit(
        EmitConfig {
            sorted: opts.sorted,
            validate_consistency: opts.validate_consistency,
            with_soft_deleted: opts.with_soft_deleted,
            cancel: opts.cancel,
        },
        completions_rx,
        requests_tx,
        out_tx,
        errors_tx,
    ));

    (out_rx, errors_rx)
}

/// Stage 1: filter events, forward them to the group stage, and signal
/// group completion.
#[allow(clippy::too_many_arguments)]
async fn accept<S>(
    events: S,
    filters: Vec<EventFilter>,
    grouped: bool,
    cancel: CancellationToken,
    upstream_errors: Vec<mpsc::Receiver<BoxError>>,
    events_tx: mpsc::Sender<Event>,
    completions_tx: mpsc::Sender<AggregateRef>,
    errors_tx: mpsc::Sender<RebuildError>,
) where
    S: Stream<Item = Event> + Send + 'static,
{
    let (mut upstream_rx, upstream_stop) = streams::fan_in(upstream_errors);
    tokio::pin!(events);

    // References with collected events that have not completed yet, in
    // first-seen order. `seen` additionally remembers completed references
    // so an aggregate never yields two histories.
    let mut pending: Vec<AggregateRef> = Vec::new();
    let mut seen: HashSet<AggregateRef> = HashSet::new();
    let mut prev: Option<AggregateRef> = None;
    let mut aborted = false;

    loop {
        let evt = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("rebuild cancelled, stopping accept stage");
                let _ = errors_tx.send(RebuildError::Cancelled).await;
                aborted = true;
                break;
            }
            Some(err) = upstream_rx.recv() => {
                tracing::debug!(error = %err, "upstream error, stopping accept stage");
                let _ = errors_tx.send(RebuildError::Upstream(err)).await;
                aborted = true;
                break;
            }
            next = events.next() => match next {
                Some(evt) => evt,
                None => break,
            },
        };

        let Some(reference) = evt.aggregate_ref() else {
            tracing::trace!(event = evt.name(), "skipping event without aggregate");
            continue;
        };
        if !filters.iter().all(|accept| accept(&evt)) {
            continue;
        }

        if seen.insert(reference.clone()) {
            pending.push(reference.clone());
        }
        if events_tx.send(evt).await.is_err() {
            // Group stage is gone; nothing left to feed.
            break;
        }

        if grouped {
            if let Some(prev_ref) = prev.take() {
                if prev_ref != reference {
                    pending.retain(|r| r != &prev_ref);
                    if completions_tx.send(prev_ref).await.is_err() {
                        break;
                    }
                }
            }
            prev = Some(reference);
        }
    }

    // Close the events channel so the group stage can finish, then
    // complete whatever is still pending (in first-seen order). On abort
    // the pending set is dropped: buffered completions still flush, new
    // ones do not.
    drop(events_tx);
    if !aborted {
        for reference in pending {
            if completions_tx.send(reference).await.is_err() {
                break;
            }
        }
    }

    upstream_stop.cancel();
}

/// Stage 2: own the reference -> events map; serve take-requests.
async fn group(mut events_rx: mpsc::Receiver<Event>, mut requests_rx: mpsc::Receiver<GroupRequest>) {
    let mut groups: HashMap<AggregateRef, Vec<Event>> = HashMap::new();
    let mut events_open = true;

    loop {
        // Biased towards events: every event of a group is queued before
        // the group's completion token is emitted, so draining pending
        // events first guarantees a request never sees a partial group.
        tokio::select! {
            biased;
            evt = events_rx.recv(), if events_open => match evt {
                Some(evt) => {
                    let Some(reference) = evt.aggregate_ref() else {
                        continue;
                    };
                    groups.entry(reference).or_default().push(evt);
                }
                None => events_open = false,
            },
            req = requests_rx.recv() => match req {
                Some(GroupRequest { reference, reply }) => {
                    let events = groups.remove(&reference).unwrap_or_default();
                    // A dropped reply means the emit stage is shutting
                    // down; the loop ends on the closed request channel.
                    let _ = reply.send(events);
                }
                None => break,
            },
        }
    }

    if !groups.is_empty() {
        tracing::debug!(
            leftover = groups.len(),
            "group stage exiting with unclaimed aggregates"
        );
    }
}

struct EmitConfig {
    sorted: bool,
    validate_consistency: bool,
    with_soft_deleted: bool,
    cancel: CancellationToken,
}

/// Stage 3: turn completed groups into histories.
async fn emit(
    cfg: EmitConfig,
    mut completions_rx: mpsc::Receiver<AggregateRef>,
    requests_tx: mpsc::Sender<GroupRequest>,
    out_tx: mpsc::Sender<History>,
    errors_tx: mpsc::Sender<RebuildError>,
) {
    while let Some(reference) = completions_rx.recv().await {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = GroupRequest {
            reference: reference.clone(),
            reply: reply_tx,
        };
        if requests_tx.send(request).await.is_err() {
            break;
        }
        let Ok(mut events) = reply_rx.await else {
            break;
        };
        if events.is_empty() {
            continue;
        }

        if !cfg.sorted {
            event::sort(&mut events, &[SortOptions::asc(SortKey::AggregateVersion)]);
        }

        if !cfg.with_soft_deleted && events.iter().any(|evt| evt.soft_deleted()) {
            tracing::debug!(aggregate = %reference, "dropping soft-deleted aggregate");
            continue;
        }

        if cfg.validate_consistency {
            if let Err(err) = consistency::validate(&reference, 0, &events) {
                tracing::warn!(
                    aggregate = %reference,
                    error = %err,
                    "inconsistent event sequence, skipping aggregate"
                );
                let sent = tokio::select! {
                    _ = cfg.cancel.cancelled() => Err(()),
                    res = errors_tx.send(err.into()) => res.map_err(|_| ()),
                };
                if sent.is_err() {
                    break;
                }
                continue;
            }
        }

        let history = History::new(reference, events);
        let sent = tokio::select! {
            _ = cfg.cancel.cancelled() => Err(()),
            res = out_tx.send(history) => res.map_err(|_| ()),
        };
        if sent.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::wrappers::ReceiverStream;
    use uuid::Uuid;

    use super::*;
    use crate::aggregate::Aggregate;
    use crate::aggregate::test_fixtures::Counter;
    use crate::event::test_fixtures::{Deleted, FooData, aggregate_events, versioned_events};

    /// Collect both pipeline outputs to completion.
    async fn run_to_end(
        mut histories: mpsc::Receiver<History>,
        mut errors: mpsc::Receiver<RebuildError>,
    ) -> (Vec<History>, Vec<RebuildError>) {
        let mut hs = Vec::new();
        let mut errs = Vec::new();
        let mut histories_open = true;
        let mut errors_open = true;
        while histories_open || errors_open {
            tokio::select! {
                h = histories.recv(), if histories_open => match h {
                    Some(h) => hs.push(h),
                    None => histories_open = false,
                },
                e = errors.recv(), if errors_open => match e {
                    Some(e) => errs.push(e),
                    None => errors_open = false,
                },
            }
        }
        (hs, errs)
    }

    fn versions_of(history: &History) -> Vec<u64> {
        history
            .events()
            .iter()
            .map(|e| e.aggregate().expect("tuple").version)
            .collect()
    }

    #[tokio::test]
    async fn single_aggregate_clean_rebuild() {
        let id = Uuid::new_v4();
        // "added" events so the Counter fixture can replay them.
        let events: Vec<Event> = (1u64..=3)
            .map(|v| {
                Event::new("added", FooData { a: 1 }).with_aggregate("counter", id, v)
            })
            .collect();

        let (histories, errors) =
            rebuild(tokio_stream::iter(events), RebuildOptions::new());
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty(), "clean input should produce no errors");
        assert_eq!(histories.len(), 1, "exactly one history expected");

        let mut counter = Counter::new(id);
        histories[0].apply(&mut counter);
        assert_eq!(counter.current_version(), 3);
        assert_eq!(counter.total, 3);
    }

    #[tokio::test]
    async fn interleaved_ungrouped_unsorted_input() {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let foo = versioned_events("foo", id_a, vec![3, 1, 2]);
        let bar = versioned_events("bar", id_b, vec![2, 1, 3]);
        // Alternate the two aggregates' events.
        let mut input = Vec::new();
        for (f, b) in foo.into_iter().zip(bar) {
            input.push(f);
            input.push(b);
        }

        let (histories, errors) = rebuild(
            tokio_stream::iter(input),
            RebuildOptions::new().sorted(false).grouped(false),
        );
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty(), "both aggregates should validate");
        assert_eq!(histories.len(), 2);
        for history in &histories {
            assert_eq!(
                versions_of(history),
                vec![1, 2, 3],
                "histories must be sorted ascending by version"
            );
        }
        let mut names: Vec<&str> = histories.iter().map(|h| h.reference().name()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["bar", "foo"]);
    }

    #[tokio::test]
    async fn version_gap_skips_aggregate_and_surfaces_error() {
        let id = Uuid::new_v4();
        let input = versioned_events("foo", id, vec![1, 2, 4]);

        let (histories, errors) = rebuild(tokio_stream::iter(input), RebuildOptions::new());
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(histories.is_empty(), "no history for the gapped aggregate");
        assert_eq!(errors.len(), 1, "exactly one error expected");
        match &errors[0] {
            RebuildError::Consistency(ConsistencyError::VersionGap {
                reference,
                at,
                expected,
                got,
            }) => {
                assert_eq!(reference, &AggregateRef::new("foo", id));
                assert_eq!(*at, 2);
                assert_eq!(*expected, 3);
                assert_eq!(*got, 4);
            }
            other => panic!("expected VersionGap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn grouped_emits_before_input_ends() {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let (input_tx, input_rx) = mpsc::channel(16);

        let (mut histories, _errors) = rebuild(
            ReceiverStream::new(input_rx),
            RebuildOptions::new().grouped(true),
        );

        for evt in aggregate_events("foo", id_a, 4) {
            input_tx.send(evt).await.expect("send should succeed");
        }
        // The first event of B ends A's group; A's history must arrive
        // while B's events are still trickling in and the input is open.
        let b_events = aggregate_events("foo", id_b, 4);
        input_tx
            .send(b_events[0].clone())
            .await
            .expect("send should succeed");

        let first = tokio::time::timeout(Duration::from_secs(1), histories.recv())
            .await
            .expect("history for A should arrive before input closes")
            .expect("history stream should be open");
        assert_eq!(first.reference(), &AggregateRef::new("foo", id_a));
        assert_eq!(versions_of(&first), vec![1, 2, 3, 4]);

        // Finish B and close the input; its history follows.
        for evt in &b_events[1..] {
            input_tx.send(evt.clone()).await.expect("send should succeed");
        }
        drop(input_tx);

        let second = histories.recv().await.expect("history for B expected");
        assert_eq!(second.reference(), &AggregateRef::new("foo", id_b));
        assert!(histories.recv().await.is_none(), "stream should close");
    }

    #[tokio::test]
    async fn soft_deleted_group_is_dropped_silently() {
        let id_deleted = Uuid::new_v4();
        let id_kept = Uuid::new_v4();

        let mut input = versioned_events("foo", id_deleted, vec![1, 2]);
        input.push(Event::new("foo.deleted", Deleted).with_aggregate("foo", id_deleted, 3));
        input.extend(aggregate_events("foo", id_kept, 2));

        let (histories, errors) = rebuild(tokio_stream::iter(input), RebuildOptions::new());
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty(), "soft delete must not produce an error");
        assert_eq!(histories.len(), 1, "only the untouched aggregate remains");
        assert_eq!(histories[0].reference(), &AggregateRef::new("foo", id_kept));
    }

    #[tokio::test]
    async fn with_soft_deleted_keeps_marked_groups() {
        let id = Uuid::new_v4();
        let mut input = versioned_events("foo", id, vec![1, 2]);
        input.push(Event::new("foo.deleted", Deleted).with_aggregate("foo", id, 3));

        let (histories, errors) = rebuild(
            tokio_stream::iter(input),
            RebuildOptions::new().with_soft_deleted(true),
        );
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty());
        assert_eq!(histories.len(), 1);
        assert_eq!(versions_of(&histories[0]), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn filters_discard_rejected_events() {
        let id = Uuid::new_v4();
        // Versions 1..=3 plus a stray the filter removes; without the
        // filter the stray would make the sequence inconsistent.
        let mut input = aggregate_events("foo", id, 3);
        input.push(Event::new("stray", FooData { a: 0 }).with_aggregate("foo", id, 9));

        let (histories, errors) = rebuild(
            tokio_stream::iter(input),
            RebuildOptions::new().filter(|evt| evt.name() != "stray"),
        );
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty(), "filtered input should validate");
        assert_eq!(histories.len(), 1);
        assert_eq!(versions_of(&histories[0]), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn events_without_aggregate_are_skipped() {
        let id = Uuid::new_v4();
        let mut input = vec![Event::new("loose", FooData { a: 0 })];
        input.extend(aggregate_events("foo", id, 2));

        let (histories, errors) = rebuild(tokio_stream::iter(input), RebuildOptions::new());
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty());
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].events().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_version_fails_consistency() {
        let id = Uuid::new_v4();
        let input = versioned_events("foo", id, vec![1, 1]);

        let (histories, errors) = rebuild(tokio_stream::iter(input), RebuildOptions::new());
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(histories.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            RebuildError::Consistency(ConsistencyError::VersionGap { .. })
        ));
    }

    #[tokio::test]
    async fn validation_disabled_emits_gapped_history() {
        let id = Uuid::new_v4();
        let input = versioned_events("foo", id, vec![1, 2, 4]);

        let (histories, errors) = rebuild(
            tokio_stream::iter(input),
            RebuildOptions::new().validate_consistency(false),
        );
        let (histories, errors) = run_to_end(histories, errors).await;

        assert!(errors.is_empty());
        assert_eq!(histories.len(), 1);
        assert_eq!(versions_of(&histories[0]), vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn per_aggregate_errors_do_not_stop_others() {
        let id_bad = Uuid::new_v4();
        let id_good = Uuid::new_v4();
        let mut input = versioned_events("foo", id_bad, vec![2, 3]); // bad start
        input.extend(aggregate_events("foo", id_good, 3));

        let (histories, errors) = rebuild(tokio_stream::iter(input), RebuildOptions::new());
        let (histories, errors) = run_to_end(histories, errors).await;

        assert_eq!(histories.len(), 1, "healthy aggregate should survive");
        assert_eq!(histories[0].reference(), &AggregateRef::new("foo", id_good));
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            RebuildError::Consistency(ConsistencyError::UnexpectedStartVersion { .. })
        ));
    }

    #[tokio::test]
    async fn upstream_error_aborts_pipeline() {
        let (err_tx, err_rx) = mpsc::channel::<BoxError>(1);
        // Input that never closes on its own.
        let (_input_tx, input_rx) = mpsc::channel::<Event>(1);

        let (histories, errors) = rebuild(
            ReceiverStream::new(input_rx),
            RebuildOptions::new().upstream_errors(err_rx),
        );

        err_tx
            .send("store went away".into())
            .await
            .expect("send should succeed");

        let (histories, errors) = tokio::time::timeout(
            Duration::from_secs(1),
            run_to_end(histories, errors),
        )
        .await
        .expect("pipeline should shut down after the upstream error");

        assert!(histories.is_empty());
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            RebuildError::Upstream(cause) => {
                assert_eq!(cause.to_string(), "store went away");
                assert_eq!(errors[0].to_string(), "event stream: store went away");
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_closes_both_outputs() {
        let cancel = CancellationToken::new();
        let (_input_tx, input_rx) = mpsc::channel::<Event>(1);

        let (histories, errors) = rebuild(
            ReceiverStream::new(input_rx),
            RebuildOptions::new().cancel(cancel.clone()),
        );

        cancel.cancel();

        let (histories, errors) = tokio::time::timeout(
            Duration::from_secs(1),
            run_to_end(histories, errors),
        )
        .await
        .expect("pipeline should settle after cancellation");

        assert!(histories.is_empty());
        assert_eq!(errors.len(), 1, "cancellation is surfaced exactly once");
        assert!(matches!(errors[0], RebuildError::Cancelled));
    }

    #[tokio::test]
    async fn at_most_one_history_per_reference() {
        let id = Uuid::new_v4();
        // Grouped contract violated on purpose: the aggregate's events are
        // split by another group. Only the first group may become a
        // history.
        let other = Uuid::new_v4();
        let mut input = versioned_events("foo", id, vec![1, 2]);
        input.extend(aggregate_events("bar", other, 1));
        input.extend(versioned_events("foo", id, vec![3]));

        let (histories, errors) = rebuild(
            tokio_stream::iter(input),
            RebuildOptions::new().grouped(true).validate_consistency(false),
        );
        let (histories, _errors) = run_to_end(histories, errors).await;

        let foo_histories = histories
            .iter()
            .filter(|h| h.reference() == &AggregateRef::new("foo", id))
            .count();
        assert_eq!(foo_histories, 1, "one history per reference at most");
    }
}
